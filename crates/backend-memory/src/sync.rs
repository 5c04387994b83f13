//! Counting semaphore / mutex lock manager with acquisition bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use foreman_backends_core::{BackendResult, SyncAcquireResult, SyncManager};
use foreman_model::{Synchronization, SynchronizationStatus, Workflow};

#[derive(Default)]
struct LockState {
    limit: i64,
    holders: BTreeSet<String>,
}

#[derive(Default)]
pub struct MemorySyncManager {
    locks: Mutex<BTreeMap<String, LockState>>,
    acquired_total: AtomicUsize,
    released_total: AtomicUsize,
}

impl MemorySyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired_total(&self) -> usize {
        self.acquired_total.load(Ordering::SeqCst)
    }

    pub fn released_total(&self) -> usize {
        self.released_total.load(Ordering::SeqCst)
    }

    pub fn held(&self, lock_name: &str) -> usize {
        self.locks
            .lock()
            .expect("locks poisoned")
            .get(lock_name)
            .map(|state| state.holders.len())
            .unwrap_or(0)
    }

    fn holder_key(workflow: &Workflow, holder_id: &str) -> String {
        if holder_id.is_empty() {
            workflow.name().to_string()
        } else {
            holder_id.to_string()
        }
    }

    fn record_holding(workflow: &mut Workflow, lock_name: &str, holding: bool) -> bool {
        let status = workflow
            .status
            .synchronization
            .get_or_insert_with(SynchronizationStatus::default);
        let entry = lock_name.to_string();
        if holding {
            if !status.holding.contains(&entry) {
                status.holding.push(entry);
                return true;
            }
        } else if let Some(index) = status.holding.iter().position(|held| held == &entry) {
            status.holding.remove(index);
            return true;
        }
        false
    }
}

#[async_trait]
impl SyncManager for MemorySyncManager {
    async fn try_acquire(
        &self,
        workflow: &mut Workflow,
        holder_id: &str,
        sync: &Synchronization,
    ) -> BackendResult<SyncAcquireResult> {
        let lock_name = sync.lock_name(workflow.namespace());
        let holder = Self::holder_key(workflow, holder_id);
        let mut locks = self.locks.lock().expect("locks poisoned");
        let state = locks.entry(lock_name.clone()).or_insert_with(|| LockState {
            limit: sync
                .semaphore
                .as_ref()
                .and_then(|semaphore| semaphore.limit)
                .unwrap_or(1),
            holders: BTreeSet::new(),
        });
        if state.holders.contains(&holder) {
            return Ok(SyncAcquireResult {
                acquired: true,
                status_dirty: false,
                message: String::new(),
            });
        }
        if (state.holders.len() as i64) < state.limit {
            state.holders.insert(holder);
            self.acquired_total.fetch_add(1, Ordering::SeqCst);
            let status_dirty = Self::record_holding(workflow, &lock_name, true);
            return Ok(SyncAcquireResult {
                acquired: true,
                status_dirty,
                message: String::new(),
            });
        }
        Ok(SyncAcquireResult {
            acquired: false,
            status_dirty: false,
            message: format!("Waiting for {lock_name} lock. Lock status: 0/{}", state.limit),
        })
    }

    fn release(&self, workflow: &mut Workflow, holder_id: &str, sync: &Synchronization) {
        let lock_name = sync.lock_name(workflow.namespace());
        let holder = Self::holder_key(workflow, holder_id);
        let mut locks = self.locks.lock().expect("locks poisoned");
        if let Some(state) = locks.get_mut(&lock_name) {
            if state.holders.remove(&holder) {
                self.released_total.fetch_add(1, Ordering::SeqCst);
                Self::record_holding(workflow, &lock_name, false);
            }
        }
    }

    fn release_all(&self, workflow: &mut Workflow) -> bool {
        let mut released = false;
        let mut locks = self.locks.lock().expect("locks poisoned");
        let prefix = format!("{}/", workflow.namespace());
        for (lock_name, state) in locks.iter_mut() {
            if !lock_name.starts_with(&prefix) {
                continue;
            }
            let holders: Vec<String> = state
                .holders
                .iter()
                .filter(|holder| {
                    holder.as_str() == workflow.name()
                        || holder.starts_with(&format!("{}-", workflow.name()))
                })
                .cloned()
                .collect();
            for holder in holders {
                state.holders.remove(&holder);
                self.released_total.fetch_add(1, Ordering::SeqCst);
                released = true;
            }
        }
        if let Some(status) = workflow.status.synchronization.as_mut() {
            if !status.holding.is_empty() {
                status.holding.clear();
                released = true;
            }
        }
        released
    }
}
