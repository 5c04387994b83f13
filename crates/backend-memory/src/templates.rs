//! Map-backed workflow template store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use foreman_backends_core::{BackendError, BackendResult, StoredWorkflowTemplate, TemplateStore};

#[derive(Default)]
pub struct MemoryTemplateStore {
    namespaced: Mutex<BTreeMap<(String, String), StoredWorkflowTemplate>>,
    cluster: Mutex<BTreeMap<String, StoredWorkflowTemplate>>,
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_workflow_template(&self, template: StoredWorkflowTemplate) {
        self.namespaced
            .lock()
            .expect("templates poisoned")
            .insert((template.namespace.clone(), template.name.clone()), template);
    }

    pub fn put_cluster_workflow_template(&self, template: StoredWorkflowTemplate) {
        self.cluster
            .lock()
            .expect("templates poisoned")
            .insert(template.name.clone(), template);
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn get_workflow_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> BackendResult<StoredWorkflowTemplate> {
        self.namespaced
            .lock()
            .expect("templates poisoned")
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("workflow template {namespace}/{name}")))
    }

    async fn get_cluster_workflow_template(
        &self,
        name: &str,
    ) -> BackendResult<StoredWorkflowTemplate> {
        self.cluster
            .lock()
            .expect("templates poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("cluster workflow template {name}")))
    }
}
