//! Recording metrics, events, and estimation doubles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use foreman_backends_core::{
    ArtifactRepositories, ArtifactRepository, BackendResult, CustomMetric, Estimator, EventRecorder,
    EventType, MetricsSink,
};
use foreman_model::{ArtifactRepositoryRef, NodePhase, Workflow};

#[derive(Default)]
pub struct RecordingMetrics {
    custom: Mutex<BTreeMap<String, CustomMetric>>,
    pod_missing: AtomicUsize,
    operation_panics: AtomicUsize,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn custom_metric_keys(&self) -> Vec<String> {
        self.custom
            .lock()
            .expect("metrics poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn pod_missing_count(&self) -> usize {
        self.pod_missing.load(Ordering::SeqCst)
    }

    pub fn operation_panics(&self) -> usize {
        self.operation_panics.load(Ordering::SeqCst)
    }
}

impl MetricsSink for RecordingMetrics {
    fn upsert_custom_metric(&self, key: &str, metric: CustomMetric) {
        self.custom
            .lock()
            .expect("metrics poisoned")
            .insert(key.to_string(), metric);
    }

    fn get_custom_metric(&self, key: &str) -> Option<CustomMetric> {
        self.custom.lock().expect("metrics poisoned").get(key).cloned()
    }

    fn pod_missing(&self, _recently_started: bool, _phase: NodePhase) {
        self.pod_missing.fetch_add(1, Ordering::SeqCst);
    }

    fn operation_panic(&self) {
        self.operation_panics.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    pub workflow: String,
    pub warning: bool,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("events poisoned").clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|event| event.reason)
            .collect()
    }
}

impl EventRecorder for RecordingEvents {
    fn event(&self, workflow: &Workflow, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().expect("events poisoned").push(RecordedEvent {
            workflow: workflow.name().to_string(),
            warning: event_type == EventType::Warning,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}

/// Fixed estimates, or none at all.
#[derive(Default)]
pub struct FixedEstimator {
    pub workflow_seconds: Option<i64>,
    pub node_seconds: Option<i64>,
}

impl Estimator for FixedEstimator {
    fn estimate_workflow_duration(&self, _workflow: &Workflow) -> Option<i64> {
        self.workflow_seconds
    }

    fn estimate_node_duration(&self, _workflow: &Workflow, _node_name: &str) -> Option<i64> {
        self.node_seconds
    }
}

/// Resolves every reference to a single default repository.
#[derive(Default)]
pub struct MemoryArtifactRepositories;

#[async_trait::async_trait]
impl ArtifactRepositories for MemoryArtifactRepositories {
    async fn resolve(
        &self,
        reference: Option<&ArtifactRepositoryRef>,
        namespace: &str,
    ) -> BackendResult<ArtifactRepositoryRef> {
        Ok(reference.cloned().unwrap_or(ArtifactRepositoryRef {
            config_map: "artifact-repositories".to_string(),
            key: "default".to_string(),
            namespace: namespace.to_string(),
        }))
    }

    async fn get(&self, _reference: &ArtifactRepositoryRef) -> BackendResult<ArtifactRepository> {
        Ok(ArtifactRepository::default())
    }
}
