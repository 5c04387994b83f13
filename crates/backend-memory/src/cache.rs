//! Map-backed memoization caches.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use foreman_backends_core::{BackendResult, Cache, CacheEntry, CacheFactory, Clock};
use foreman_model::Outputs;

pub struct MemoryCache {
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
    save_calls: Mutex<Vec<String>>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(BTreeMap::new()),
            save_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn saved_keys(&self) -> Vec<String> {
        self.save_calls.lock().expect("save calls poisoned").clone()
    }

    pub fn seed(&self, key: &str, entry: CacheEntry) {
        self.entries
            .lock()
            .expect("entries poisoned")
            .insert(key.to_string(), entry);
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn load(&self, key: &str) -> BackendResult<Option<CacheEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("entries poisoned")
            .get(key)
            .cloned())
    }

    async fn save(&self, key: &str, node_id: &str, outputs: &Outputs) -> BackendResult<()> {
        self.save_calls
            .lock()
            .expect("save calls poisoned")
            .push(key.to_string());
        self.entries.lock().expect("entries poisoned").insert(
            key.to_string(),
            CacheEntry {
                node_id: node_id.to_string(),
                outputs: outputs.clone(),
                created_at: self.clock.now(),
            },
        );
        Ok(())
    }
}

/// Creates caches on first reference, like the config-map factory it stands
/// in for.
pub struct MemoryCacheFactory {
    clock: Arc<dyn Clock>,
    caches: Mutex<BTreeMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            caches: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn memory_cache(&self, name: &str) -> Arc<MemoryCache> {
        let mut caches = self.caches.lock().expect("caches poisoned");
        caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::new(Arc::clone(&self.clock))))
            .clone()
    }
}

impl CacheFactory for MemoryCacheFactory {
    fn cache(&self, name: &str) -> Option<Arc<dyn Cache>> {
        Some(self.memory_cache(name))
    }
}
