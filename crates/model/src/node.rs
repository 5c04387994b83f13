//! Node statuses and the deterministic ID scheme of the status graph.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::phase::{NodePhase, NodeType};
use crate::template::{Inputs, Outputs, TemplateRef};

/// Deterministic node ID derived from the node name.
///
/// The entrypoint node (name == workflow name) keeps the workflow name as its
/// ID; every other node hashes its full name so that equal names collide and
/// IDs stay stable across reconciliations.
pub fn node_id(workflow_name: &str, node_name: &str) -> String {
    if node_name == workflow_name {
        return workflow_name.to_string();
    }
    let digest = Sha256::digest(node_name.as_bytes());
    let short = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{workflow_name}-{short}")
}

/// Child name for the K-th retry attempt.
pub fn retry_child_name(parent: &str, attempt: usize) -> String {
    format!("{parent}({attempt})")
}

/// Child name for an item-expanded step or task.
pub fn item_child_name(parent: &str, index: usize, desc: &str) -> String {
    format!("{parent}({index}:{desc})")
}

/// Recovers the loop index `I` from a `NAME(I:DESC)` node name.
pub fn loop_index(node_name: &str) -> Option<usize> {
    let open = node_name.rfind('(')?;
    let rest = &node_name[open + 1..];
    let colon = rest.find(':')?;
    rest[..colon].parse().ok()
}

/// Display name is the node name stripped of its boundary prefix.
pub fn display_name(node_name: &str, boundary_name: Option<&str>) -> String {
    if let Some(boundary) = boundary_name {
        let prefix = format!("{boundary}.");
        if let Some(stripped) = node_name.strip_prefix(&prefix) {
            return stripped.to_string();
        }
    }
    node_name
        .rsplit('.')
        .next()
        .unwrap_or(node_name)
        .to_string()
}

/// Memoization outcome recorded on a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoizationStatus {
    pub hit: bool,
    pub key: String,
    pub cache_name: String,
}

/// Synchronization state recorded on a node while a lock is contended.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSynchronizationStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub waiting: String,
}

/// A single execution instance of a template.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template_scope: String,
    pub phase: NodePhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub boundary_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Estimated duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources_duration: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemoned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outbound_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memoization_status: Option<MemoizationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronization_status: Option<NodeSynchronizationStatus>,
}

impl NodeStatus {
    /// A node is fulfilled when terminal, or when daemoned and past Pending
    /// (daemon success is inferred from readiness, not exit).
    pub fn fulfilled(&self) -> bool {
        self.phase.fulfilled() || (self.is_daemoned() && self.phase != NodePhase::Pending)
    }

    pub fn is_daemoned(&self) -> bool {
        self.daemoned == Some(true)
    }

    pub fn failed_or_error(&self) -> bool {
        self.phase.failed_or_error()
    }

    pub fn pending(&self) -> bool {
        self.phase == NodePhase::Pending
    }

    pub fn can_retry(&self) -> bool {
        self.failed_or_error()
    }

    pub fn is_waiting_for_lock(&self) -> bool {
        self.synchronization_status
            .as_ref()
            .is_some_and(|status| !status.waiting.is_empty())
    }

    pub fn is_active_pod(&self) -> bool {
        self.node_type == NodeType::Pod && self.phase.active()
    }
}

/// The status graph: node ID to node status.
///
/// Children and boundary links are stored as IDs, never as references, so the
/// graph serializes flat and traversals stay borrow-friendly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nodes(pub BTreeMap<String, NodeStatus>);

impl Nodes {
    pub fn get(&self, id: &str) -> Option<&NodeStatus> {
        self.0.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut NodeStatus> {
        self.0.get_mut(id)
    }

    pub fn insert(&mut self, node: NodeStatus) {
        self.0.insert(node.id.clone(), node);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &NodeStatus> {
        self.0.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut NodeStatus> {
        self.0.values_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeStatus)> {
        self.0.iter()
    }

    /// Child of a parent by position; negative indexes count from the end
    /// (`-1` is the most recent attempt). Children are located by the `(K)`
    /// suffix embedded in their names so reapplied histories stay stable.
    pub fn child_at(&self, parent: &NodeStatus, index: i64) -> Option<&NodeStatus> {
        if parent.children.is_empty() {
            return None;
        }
        let wanted = if index < 0 {
            parent.children.len() as i64 + index
        } else {
            index
        };
        if wanted < 0 {
            return None;
        }
        let suffix = format!("({wanted})");
        parent
            .children
            .iter()
            .filter_map(|child_id| self.get(child_id))
            .find(|child| child.name.ends_with(&suffix))
            .or_else(|| {
                parent
                    .children
                    .get(wanted as usize)
                    .and_then(|child_id| self.get(child_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_and_prefix_scoped() {
        assert_eq!(node_id("wf", "wf"), "wf");
        let a = node_id("wf", "wf.step");
        let b = node_id("wf", "wf.step");
        assert_eq!(a, b);
        assert!(a.starts_with("wf-"));
        assert_ne!(node_id("wf", "wf.step"), node_id("wf", "wf.other"));
    }

    #[test]
    fn loop_index_recovers_from_item_names() {
        assert_eq!(loop_index("wf.fan(3:apple)"), Some(3));
        assert_eq!(loop_index("wf.fan(0:{\"k\":1})"), Some(0));
        assert_eq!(loop_index("wf.plain"), None);
        assert_eq!(loop_index("wf.retry(2)"), None);
    }

    #[test]
    fn display_name_strips_boundary_prefix() {
        assert_eq!(display_name("wf.build.compile", Some("wf.build")), "compile");
        assert_eq!(display_name("wf.build.compile", None), "compile");
        assert_eq!(display_name("wf", None), "wf");
    }

    #[test]
    fn child_at_prefers_name_suffix_over_position() {
        let mut nodes = Nodes::default();
        let mut parent = NodeStatus {
            id: "p".to_string(),
            name: "wf.task".to_string(),
            ..Default::default()
        };
        for attempt in [1usize, 0] {
            let name = retry_child_name("wf.task", attempt);
            let id = node_id("wf", &name);
            parent.children.push(id.clone());
            nodes.insert(NodeStatus {
                id,
                name,
                ..Default::default()
            });
        }
        let first = nodes.child_at(&parent, 0).expect("first child");
        assert_eq!(first.name, "wf.task(0)");
        let last = nodes.child_at(&parent, -1).expect("last child");
        assert_eq!(last.name, "wf.task(1)");
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn node_id_is_a_pure_function(workflow in "[a-z][a-z0-9-]{0,20}", name in "[a-z][a-z0-9.()-]{0,40}") {
                prop_assert_eq!(node_id(&workflow, &name), node_id(&workflow, &name));
            }

            #[test]
            fn equal_names_collide_and_the_workflow_prefix_is_kept(
                workflow in "[a-z][a-z0-9-]{0,20}",
                name in "[a-z][a-z0-9.-]{1,40}",
            ) {
                let id = node_id(&workflow, &format!("{workflow}.{name}"));
                let prefix = format!("{}-", workflow);
                prop_assert!(id.starts_with(&prefix));
            }

            #[test]
            fn loop_index_recovers_from_generated_child_names(
                parent in "[a-z][a-z0-9.-]{0,30}",
                index in 0usize..10_000,
                desc in "[a-z0-9 {}\"-]{0,20}",
            ) {
                let name = item_child_name(&parent, index, &desc);
                prop_assert_eq!(loop_index(&name), Some(index));
            }
        }
    }

    #[test]
    fn daemoned_running_node_is_fulfilled() {
        let node = NodeStatus {
            phase: NodePhase::Running,
            daemoned: Some(true),
            ..Default::default()
        };
        assert!(node.fulfilled());
        let pending = NodeStatus {
            phase: NodePhase::Pending,
            daemoned: Some(true),
            ..Default::default()
        };
        assert!(!pending.fulfilled());
    }
}
