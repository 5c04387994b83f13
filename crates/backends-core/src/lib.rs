//! Collaborator contracts for the operator core.
//!
//! The operator is a state-transition function over (workflow, pod snapshot,
//! clock); every side effect goes through one of these traits. Production
//! wiring and the in-memory test doubles implement the same surface.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use foreman_model::{
    ArtifactRepositoryRef, ClaimedVolume, NodePhase, Nodes, Outputs, PodDisruptionBudgetSpec,
    PodSnapshot, Synchronization, Template, VolumeClaimTemplate, Workflow, WorkflowSpec,
};

/// Raised when a collaborator call fails.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("request entity too large: {0}")]
    RequestEntityTooLarge(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Transient failures requeue without advancing node state.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Conflict(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Deferred pod-side action, executed by the cleanup queue outside the
/// reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PodCleanupAction {
    DeletePod,
    LabelPodCompleted,
    TerminateContainers,
}

#[derive(Clone, Debug, Default)]
pub struct PodCreateOptions {
    pub on_exit_pod: bool,
    pub execution_deadline: Option<DateTime<Utc>>,
    /// Host names previous attempts failed on, to steer rescheduling away.
    pub avoid_hosts: Vec<String>,
}

#[async_trait]
pub trait PodManager: Send + Sync {
    async fn create(
        &self,
        workflow: &Workflow,
        node_name: &str,
        template: &Template,
        opts: &PodCreateOptions,
    ) -> BackendResult<PodSnapshot>;

    fn queue_for_cleanup(&self, namespace: &str, pod_name: &str, action: PodCleanupAction);

    async fn list_workflow_pods(&self, workflow: &Workflow) -> BackendResult<Vec<PodSnapshot>>;
}

/// Content-addressed storage of previous outputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub node_id: String,
    pub outputs: Outputs,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn hit(&self) -> bool {
        true
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    /// Outputs only while the entry is younger than `max_age`.
    pub fn outputs_with_max_age(&self, max_age: Duration, now: DateTime<Utc>) -> Option<&Outputs> {
        let age = now.signed_duration_since(self.created_at);
        let max_age = chrono::Duration::from_std(max_age).ok()?;
        (age <= max_age).then_some(&self.outputs)
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn load(&self, key: &str) -> BackendResult<Option<CacheEntry>>;
    async fn save(&self, key: &str, node_id: &str, outputs: &Outputs) -> BackendResult<()>;
}

pub trait CacheFactory: Send + Sync {
    fn cache(&self, name: &str) -> Option<Arc<dyn Cache>>;
}

#[derive(Clone, Debug, Default)]
pub struct SyncAcquireResult {
    pub acquired: bool,
    pub status_dirty: bool,
    pub message: String,
}

/// Named-lock coordination. The operator's contract: exactly one `release`
/// per acquired `try_acquire`, with `release_all` covering any remainder once
/// the workflow itself is terminal.
#[async_trait]
pub trait SyncManager: Send + Sync {
    async fn try_acquire(
        &self,
        workflow: &mut Workflow,
        holder_id: &str,
        sync: &Synchronization,
    ) -> BackendResult<SyncAcquireResult>;

    fn release(&self, workflow: &mut Workflow, holder_id: &str, sync: &Synchronization);

    fn release_all(&self, workflow: &mut Workflow) -> bool;
}

/// Offloading of the node graph out of the status object.
#[async_trait]
pub trait Hydrator: Send + Sync {
    fn is_hydrated(&self, workflow: &Workflow) -> bool;
    async fn hydrate(&self, workflow: &mut Workflow) -> BackendResult<()>;
    async fn dehydrate(&self, workflow: &mut Workflow) -> BackendResult<()>;
    fn hydrate_with_nodes(&self, workflow: &mut Workflow, nodes: &Nodes);
}

/// Opaque repository descriptor; the operator only caches it in status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRepository {
    #[serde(default)]
    pub config: Value,
}

#[async_trait]
pub trait ArtifactRepositories: Send + Sync {
    async fn resolve(
        &self,
        reference: Option<&ArtifactRepositoryRef>,
        namespace: &str,
    ) -> BackendResult<ArtifactRepositoryRef>;

    async fn get(&self, reference: &ArtifactRepositoryRef) -> BackendResult<ArtifactRepository>;
}

/// External workflow template, fetched by name for `templateRef` resolution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredWorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub spec: WorkflowSpec,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_workflow_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> BackendResult<StoredWorkflowTemplate>;

    async fn get_cluster_workflow_template(
        &self,
        name: &str,
    ) -> BackendResult<StoredWorkflowTemplate>;
}

/// A custom metric value; real-time gauges re-evaluate on scrape.
#[derive(Clone)]
pub enum MetricValue {
    Gauge(f64),
    Counter(f64),
    RealtimeGauge(Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl fmt::Debug for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(value) => write!(f, "Gauge({value})"),
            MetricValue::Counter(value) => write!(f, "Counter({value})"),
            MetricValue::RealtimeGauge(thunk) => write!(f, "RealtimeGauge({})", thunk()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CustomMetric {
    pub name: String,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub value: MetricValue,
}

pub trait MetricsSink: Send + Sync {
    fn upsert_custom_metric(&self, key: &str, metric: CustomMetric);
    fn get_custom_metric(&self, key: &str) -> Option<CustomMetric>;
    fn pod_missing(&self, recently_started: bool, phase: NodePhase);
    fn operation_panic(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

pub trait EventRecorder: Send + Sync {
    fn event(&self, workflow: &Workflow, event_type: EventType, reason: &str, message: &str);
}

/// Duration estimation from historical runs, in seconds.
pub trait Estimator: Send + Sync {
    fn estimate_workflow_duration(&self, workflow: &Workflow) -> Option<i64>;
    fn estimate_node_duration(&self, workflow: &Workflow, node_name: &str) -> Option<i64>;
}

/// Persistence surface for the workflow resource and its satellite objects.
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> BackendResult<Workflow>;

    /// Optimistic update keyed on `metadata.resourceVersion`.
    async fn update(&self, workflow: &Workflow) -> BackendResult<Workflow>;

    async fn create_pod_disruption_budget(
        &self,
        workflow: &Workflow,
        spec: &PodDisruptionBudgetSpec,
    ) -> BackendResult<()>;

    async fn delete_pod_disruption_budget(&self, workflow: &Workflow) -> BackendResult<()>;

    async fn create_persistent_volume_claim(
        &self,
        workflow: &Workflow,
        template: &VolumeClaimTemplate,
    ) -> BackendResult<ClaimedVolume>;

    async fn delete_persistent_volume_claim(
        &self,
        workflow: &Workflow,
        claim: &ClaimedVolume,
    ) -> BackendResult<()>;

    /// Writes the persisted object back into the local informer store to
    /// reduce conflicts on the next reconciliation.
    fn write_back(&self, workflow: &Workflow) -> BackendResult<()>;
}

/// Injectable time source so reconciliation stays pure over its inputs.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
