//! Hydrators: a passthrough and a size-thresholded offloader.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use foreman_backends_core::{BackendError, BackendResult, Hydrator};
use foreman_model::{Nodes, Workflow};

/// Keeps the node graph inline; the common case.
#[derive(Default)]
pub struct PassthroughHydrator;

#[async_trait]
impl Hydrator for PassthroughHydrator {
    fn is_hydrated(&self, workflow: &Workflow) -> bool {
        workflow.status.offload_node_status_version.is_empty()
    }

    async fn hydrate(&self, _workflow: &mut Workflow) -> BackendResult<()> {
        Ok(())
    }

    async fn dehydrate(&self, _workflow: &mut Workflow) -> BackendResult<()> {
        Ok(())
    }

    fn hydrate_with_nodes(&self, workflow: &mut Workflow, nodes: &Nodes) {
        workflow.status.nodes = nodes.clone();
        workflow.status.offload_node_status_version = String::new();
    }
}

/// Detaches the node graph into side storage once it exceeds a node-count
/// threshold, leaving only a version reference in status.
pub struct OffloadingHydrator {
    threshold: usize,
    versions: AtomicU64,
    storage: Mutex<BTreeMap<String, Nodes>>,
}

impl OffloadingHydrator {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            versions: AtomicU64::new(0),
            storage: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn offloaded_versions(&self) -> usize {
        self.storage.lock().expect("storage poisoned").len()
    }
}

#[async_trait]
impl Hydrator for OffloadingHydrator {
    fn is_hydrated(&self, workflow: &Workflow) -> bool {
        workflow.status.offload_node_status_version.is_empty()
    }

    async fn hydrate(&self, workflow: &mut Workflow) -> BackendResult<()> {
        if self.is_hydrated(workflow) {
            return Ok(());
        }
        let version = workflow.status.offload_node_status_version.clone();
        let storage = self.storage.lock().expect("storage poisoned");
        let nodes = storage
            .get(&version)
            .ok_or_else(|| BackendError::NotFound(format!("offloaded nodes {version}")))?;
        workflow.status.nodes = nodes.clone();
        workflow.status.offload_node_status_version = String::new();
        Ok(())
    }

    async fn dehydrate(&self, workflow: &mut Workflow) -> BackendResult<()> {
        if !self.is_hydrated(workflow) || workflow.status.nodes.len() <= self.threshold {
            return Ok(());
        }
        let version = format!("v{}", self.versions.fetch_add(1, Ordering::SeqCst) + 1);
        self.storage
            .lock()
            .expect("storage poisoned")
            .insert(version.clone(), std::mem::take(&mut workflow.status.nodes));
        workflow.status.offload_node_status_version = version;
        Ok(())
    }

    fn hydrate_with_nodes(&self, workflow: &mut Workflow, nodes: &Nodes) {
        workflow.status.nodes = nodes.clone();
        workflow.status.offload_node_status_version = String::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::NodeStatus;

    #[tokio::test]
    async fn offloading_round_trips_past_the_threshold() {
        let hydrator = OffloadingHydrator::new(1);
        let mut workflow = Workflow::default();
        for id in ["a", "b"] {
            workflow.status.nodes.insert(NodeStatus {
                id: id.to_string(),
                name: id.to_string(),
                ..Default::default()
            });
        }

        hydrator.dehydrate(&mut workflow).await.expect("dehydrate");
        assert!(!hydrator.is_hydrated(&workflow));
        assert!(workflow.status.nodes.is_empty());
        assert_eq!(hydrator.offloaded_versions(), 1);

        hydrator.hydrate(&mut workflow).await.expect("hydrate");
        assert!(hydrator.is_hydrated(&workflow));
        assert_eq!(workflow.status.nodes.len(), 2);
    }

    #[tokio::test]
    async fn small_graphs_stay_inline() {
        let hydrator = OffloadingHydrator::new(10);
        let mut workflow = Workflow::default();
        workflow.status.nodes.insert(NodeStatus {
            id: "a".to_string(),
            name: "a".to_string(),
            ..Default::default()
        });
        hydrator.dehydrate(&mut workflow).await.expect("dehydrate");
        assert!(hydrator.is_hydrated(&workflow));
        assert_eq!(workflow.status.nodes.len(), 1);
    }
}
