//! In-memory workflow API with optimistic concurrency and fault injection.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use foreman_backends_core::{BackendError, BackendResult, WorkflowApi};
use foreman_model::{ClaimedVolume, PodDisruptionBudgetSpec, VolumeClaimTemplate, Workflow};

#[derive(Default)]
pub struct MemoryWorkflowApi {
    workflows: Mutex<BTreeMap<(String, String), Workflow>>,
    pdbs: Mutex<HashSet<(String, String)>>,
    pvcs: Mutex<HashSet<(String, String)>>,
    /// Errors popped in order on subsequent `update` calls.
    fail_updates_with: Mutex<VecDeque<BackendError>>,
    update_calls: AtomicUsize,
    write_backs: AtomicUsize,
}

impl MemoryWorkflowApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(workflow: &Workflow) -> (String, String) {
        (
            workflow.namespace().to_string(),
            workflow.name().to_string(),
        )
    }

    /// Seeds the store and returns the stored copy (with its first version).
    pub fn put(&self, mut workflow: Workflow) -> Workflow {
        if workflow.metadata.resource_version.is_empty() {
            workflow.metadata.resource_version = "1".to_string();
        }
        let mut workflows = self.workflows.lock().expect("workflows poisoned");
        workflows.insert(Self::key(&workflow), workflow.clone());
        workflow
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<Workflow> {
        let workflows = self.workflows.lock().expect("workflows poisoned");
        workflows
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mutates the stored copy out-of-band, bumping its version, so the next
    /// operator update conflicts.
    pub fn mutate_stored(&self, namespace: &str, name: &str, f: impl FnOnce(&mut Workflow)) {
        let mut workflows = self.workflows.lock().expect("workflows poisoned");
        if let Some(stored) = workflows.get_mut(&(namespace.to_string(), name.to_string())) {
            f(stored);
            stored.metadata.resource_version = bump_version(&stored.metadata.resource_version);
        }
    }

    pub fn fail_next_update(&self, error: BackendError) {
        self.fail_updates_with
            .lock()
            .expect("failures poisoned")
            .push_back(error);
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn write_backs(&self) -> usize {
        self.write_backs.load(Ordering::SeqCst)
    }

    pub fn has_pdb(&self, workflow: &Workflow) -> bool {
        self.pdbs
            .lock()
            .expect("pdbs poisoned")
            .contains(&Self::key(workflow))
    }
}

fn bump_version(version: &str) -> String {
    let current: u64 = version.parse().unwrap_or(0);
    (current + 1).to_string()
}

#[async_trait]
impl WorkflowApi for MemoryWorkflowApi {
    async fn get(&self, namespace: &str, name: &str) -> BackendResult<Workflow> {
        self.stored(namespace, name)
            .ok_or_else(|| BackendError::NotFound(format!("workflow {namespace}/{name}")))
    }

    async fn update(&self, workflow: &Workflow) -> BackendResult<Workflow> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .fail_updates_with
            .lock()
            .expect("failures poisoned")
            .pop_front()
        {
            return Err(error);
        }
        let mut workflows = self.workflows.lock().expect("workflows poisoned");
        let key = Self::key(workflow);
        let stored = workflows
            .get(&key)
            .ok_or_else(|| BackendError::NotFound(format!("workflow {}/{}", key.0, key.1)))?;
        if stored.metadata.resource_version != workflow.metadata.resource_version {
            return Err(BackendError::Conflict(format!(
                "resource version {} is stale (stored {})",
                workflow.metadata.resource_version, stored.metadata.resource_version
            )));
        }
        let mut updated = workflow.clone();
        updated.metadata.resource_version = bump_version(&updated.metadata.resource_version);
        workflows.insert(key, updated.clone());
        Ok(updated)
    }

    async fn create_pod_disruption_budget(
        &self,
        workflow: &Workflow,
        _spec: &PodDisruptionBudgetSpec,
    ) -> BackendResult<()> {
        self.pdbs
            .lock()
            .expect("pdbs poisoned")
            .insert(Self::key(workflow));
        Ok(())
    }

    async fn delete_pod_disruption_budget(&self, workflow: &Workflow) -> BackendResult<()> {
        self.pdbs
            .lock()
            .expect("pdbs poisoned")
            .remove(&Self::key(workflow));
        Ok(())
    }

    async fn create_persistent_volume_claim(
        &self,
        workflow: &Workflow,
        template: &VolumeClaimTemplate,
    ) -> BackendResult<ClaimedVolume> {
        let claim_name = format!("{}-{}", workflow.name(), template.name);
        self.pvcs
            .lock()
            .expect("pvcs poisoned")
            .insert((workflow.namespace().to_string(), claim_name.clone()));
        Ok(ClaimedVolume {
            name: template.name.clone(),
            claim_name,
        })
    }

    async fn delete_persistent_volume_claim(
        &self,
        workflow: &Workflow,
        claim: &ClaimedVolume,
    ) -> BackendResult<()> {
        self.pvcs
            .lock()
            .expect("pvcs poisoned")
            .remove(&(workflow.namespace().to_string(), claim.claim_name.clone()));
        Ok(())
    }

    fn write_back(&self, _workflow: &Workflow) -> BackendResult<()> {
        self.write_backs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::ObjectMeta;

    fn workflow(name: &str) -> Workflow {
        Workflow {
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_bumps_the_version_and_rejects_stale_writers() {
        let api = MemoryWorkflowApi::new();
        let stored = api.put(workflow("wf"));
        assert_eq!(stored.metadata.resource_version, "1");

        let updated = api.update(&stored).await.expect("update");
        assert_eq!(updated.metadata.resource_version, "2");

        // the first copy is now stale
        let stale = api.update(&stored).await;
        assert!(matches!(stale, Err(BackendError::Conflict(_))));
    }

    #[tokio::test]
    async fn injected_failures_pop_in_order() {
        let api = MemoryWorkflowApi::new();
        let stored = api.put(workflow("wf"));
        api.fail_next_update(BackendError::RequestEntityTooLarge("big".to_string()));
        assert!(matches!(
            api.update(&stored).await,
            Err(BackendError::RequestEntityTooLarge(_))
        ));
        assert!(api.update(&stored).await.is_ok());
        assert_eq!(api.update_calls(), 2);
    }
}
