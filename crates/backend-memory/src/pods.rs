//! Recording pod manager: pods are plain snapshots tests mutate directly.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use foreman_backends_core::{
    BackendResult, PodCleanupAction, PodCreateOptions, PodManager,
};
use foreman_model::{
    PodPhase, PodSnapshot, Template, Workflow, ANNOTATION_NODE_NAME, ANNOTATION_TEMPLATE,
    LABEL_WORKFLOW,
};

#[derive(Default)]
pub struct MemoryPodManager {
    pods: Mutex<BTreeMap<String, PodSnapshot>>,
    cleanup: Mutex<Vec<(String, PodCleanupAction)>>,
    create_opts: Mutex<Vec<(String, PodCreateOptions)>>,
}

impl MemoryPodManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pod(&self, name: &str) -> Option<PodSnapshot> {
        self.pods.lock().expect("pods poisoned").get(name).cloned()
    }

    pub fn pod_count(&self) -> usize {
        self.pods.lock().expect("pods poisoned").len()
    }

    pub fn cleanup_actions(&self) -> Vec<(String, PodCleanupAction)> {
        self.cleanup.lock().expect("cleanup poisoned").clone()
    }

    pub fn create_options(&self) -> Vec<(String, PodCreateOptions)> {
        self.create_opts.lock().expect("create opts poisoned").clone()
    }

    /// Replaces the observed state of a pod, as the informer would.
    pub fn observe(&self, pod: PodSnapshot) {
        self.pods
            .lock()
            .expect("pods poisoned")
            .insert(pod.name.clone(), pod);
    }

    pub fn update_pod(&self, name: &str, f: impl FnOnce(&mut PodSnapshot)) {
        let mut pods = self.pods.lock().expect("pods poisoned");
        if let Some(pod) = pods.get_mut(name) {
            f(pod);
        }
    }

    /// Simulates a pod disappearing without a final event.
    pub fn delete_pod(&self, name: &str) {
        self.pods.lock().expect("pods poisoned").remove(name);
    }
}

#[async_trait]
impl PodManager for MemoryPodManager {
    async fn create(
        &self,
        workflow: &Workflow,
        node_name: &str,
        template: &Template,
        opts: &PodCreateOptions,
    ) -> BackendResult<PodSnapshot> {
        let pod_name = workflow.node_id(node_name);
        self.create_opts
            .lock()
            .expect("create opts poisoned")
            .push((pod_name.clone(), opts.clone()));
        let mut pods = self.pods.lock().expect("pods poisoned");
        if let Some(existing) = pods.get(&pod_name) {
            return Ok(existing.clone());
        }
        let pod = PodSnapshot {
            name: pod_name.clone(),
            namespace: workflow.namespace().to_string(),
            labels: BTreeMap::from([(
                LABEL_WORKFLOW.to_string(),
                workflow.name().to_string(),
            )]),
            annotations: BTreeMap::from([
                (ANNOTATION_NODE_NAME.to_string(), node_name.to_string()),
                (
                    ANNOTATION_TEMPLATE.to_string(),
                    serde_json::to_string(template).expect("template serializes"),
                ),
            ]),
            phase: PodPhase::Pending,
            ..Default::default()
        };
        pods.insert(pod_name, pod.clone());
        Ok(pod)
    }

    fn queue_for_cleanup(&self, _namespace: &str, pod_name: &str, action: PodCleanupAction) {
        self.cleanup
            .lock()
            .expect("cleanup poisoned")
            .push((pod_name.to_string(), action));
    }

    async fn list_workflow_pods(&self, workflow: &Workflow) -> BackendResult<Vec<PodSnapshot>> {
        let pods = self.pods.lock().expect("pods poisoned");
        Ok(pods
            .values()
            .filter(|pod| {
                pod.labels.get(LABEL_WORKFLOW).map(String::as_str) == Some(workflow.name())
            })
            .cloned()
            .collect())
    }
}
