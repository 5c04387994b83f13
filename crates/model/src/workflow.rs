//! The workflow object: spec, status, and graph accessors.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::meta::{Condition, LabelSelector, ObjectMeta};
use crate::node::{node_id, NodeStatus, Nodes};
use crate::phase::WorkflowPhase;
use crate::template::{
    Arguments, Metrics, Outputs, RetryStrategy, Synchronization, Template,
};

/// Desired state of a workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entrypoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Template>,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<ShutdownStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_gc: Option<PodGC>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_defaults: Option<TemplateDefaults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_template_ref: Option<WorkflowTemplateRef>,
    /// Fallback retry strategy for templates that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<Synchronization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_repository_ref: Option<ArtifactRepositoryRef>,
}

impl WorkflowSpec {
    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|template| template.name == name)
    }
}

/// Defaults merged field-by-field into every resolved template.
///
/// Carries only the cross-cutting knobs; the execution variant of the target
/// template is never changed by the merge.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStrategy {
    Stop,
    Terminate,
}

impl ShutdownStrategy {
    /// Stop still runs the exit handler once the main tree has completed;
    /// Terminate runs nothing further.
    pub fn should_execute(self, on_exit: bool) -> bool {
        match self {
            ShutdownStrategy::Stop => on_exit,
            ShutdownStrategy::Terminate => false,
        }
    }
}

impl std::fmt::Display for ShutdownStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownStrategy::Stop => f.write_str("Stop"),
            ShutdownStrategy::Terminate => f.write_str("Terminate"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodGC {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<PodGCStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

impl PodGC {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match &self.label_selector {
            Some(selector) => selector.matches(labels),
            None => true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodGCStrategy {
    OnPodSuccess,
    OnPodCompletion,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTemplateRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cluster_scope: bool,
}

/// Pointer to the artifact repository backing this workflow, cached in status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRepositoryRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_map: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// A PVC created for the workflow, tracked for deletion at completion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedVolume {
    pub name: String,
    pub claim_name: String,
}

/// Lock holdings recorded in workflow status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronizationStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holding: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting: Vec<String>,
}

/// Observed state of a workflow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: WorkflowPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Estimated duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Nodes::is_empty")]
    pub nodes: Nodes,
    /// Node graph offloaded out of the status object; non-empty when the
    /// nodes map lives in external storage.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub offload_node_status_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stored_templates: BTreeMap<String, Template>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_workflow_spec: Option<Box<WorkflowSpec>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent_volume_claims: Vec<ClaimedVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization: Option<SynchronizationStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources_duration: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_repository_ref: Option<ArtifactRepositoryRef>,
}

impl WorkflowStatus {
    /// A fulfilled workflow must not be updated except to release held locks.
    pub fn fulfilled(&self) -> bool {
        self.phase.completed()
    }
}

/// The top-level unit being reconciled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Deterministic ID for a node of this workflow.
    pub fn node_id(&self, node_name: &str) -> String {
        node_id(&self.metadata.name, node_name)
    }

    pub fn node_by_name(&self, node_name: &str) -> Option<&NodeStatus> {
        self.status.nodes.get(&self.node_id(node_name))
    }

    pub fn node_by_name_mut(&mut self, node_name: &str) -> Option<&mut NodeStatus> {
        let id = self.node_id(node_name);
        self.status.nodes.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::NodePhase;

    #[test]
    fn entrypoint_node_id_is_the_workflow_name() {
        let workflow = Workflow {
            metadata: ObjectMeta {
                name: "hello".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(workflow.node_id("hello"), "hello");
        assert_ne!(workflow.node_id("hello.step"), "hello.step");
    }

    #[test]
    fn node_by_name_round_trips_through_the_id() {
        let mut workflow = Workflow {
            metadata: ObjectMeta {
                name: "wf".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let id = workflow.node_id("wf.a");
        workflow.status.nodes.insert(NodeStatus {
            id: id.clone(),
            name: "wf.a".to_string(),
            phase: NodePhase::Running,
            ..Default::default()
        });
        assert_eq!(workflow.node_by_name("wf.a").map(|n| n.id.as_str()), Some(id.as_str()));
        assert!(workflow.node_by_name("wf.b").is_none());
    }

    #[test]
    fn shutdown_strategy_gates_the_exit_handler() {
        assert!(ShutdownStrategy::Stop.should_execute(true));
        assert!(!ShutdownStrategy::Stop.should_execute(false));
        assert!(!ShutdownStrategy::Terminate.should_execute(true));
    }
}
