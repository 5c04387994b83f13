//! Object metadata and the label/annotation keys the controller owns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pod annotation naming the node the pod executes.
pub const ANNOTATION_NODE_NAME: &str = "workflows.foreman.io/node-name";
/// Pod annotation carrying the JSON-encoded template the pod runs.
pub const ANNOTATION_TEMPLATE: &str = "workflows.foreman.io/template";
/// Pod annotation carrying the JSON-encoded outputs reported by the pod.
pub const ANNOTATION_OUTPUTS: &str = "workflows.foreman.io/outputs";

/// Pod label naming the owning workflow.
pub const LABEL_WORKFLOW: &str = "workflows.foreman.io/workflow";
/// Label marking a pod or workflow as completed.
pub const LABEL_COMPLETED: &str = "workflows.foreman.io/completed";
/// Workflow label mirroring the current phase.
pub const LABEL_PHASE: &str = "workflows.foreman.io/phase";

/// The subset of object metadata the operator reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Equality-based label selector, used by pod GC filtering.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Workflow condition entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    PodRunning,
    Completed,
}

/// Upserts a condition by type, keeping insertion order for the rest.
pub fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    for existing in conditions.iter_mut() {
        if existing.condition_type == condition.condition_type {
            *existing = condition;
            return;
        }
    }
    conditions.push(condition);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_matches_subset() {
        let selector = LabelSelector {
            match_labels: BTreeMap::from([("tier".to_string(), "batch".to_string())]),
        };
        let mut labels = BTreeMap::from([
            ("tier".to_string(), "batch".to_string()),
            ("extra".to_string(), "x".to_string()),
        ]);
        assert!(selector.matches(&labels));
        labels.insert("tier".to_string(), "other".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn upsert_condition_replaces_by_type() {
        let mut conditions = Vec::new();
        upsert_condition(
            &mut conditions,
            Condition {
                condition_type: ConditionType::PodRunning,
                status: false,
                message: None,
            },
        );
        upsert_condition(
            &mut conditions,
            Condition {
                condition_type: ConditionType::PodRunning,
                status: true,
                message: None,
            },
        );
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].status);
    }
}
