//! Pre-persist rollups: progress and resource durations.

use std::collections::BTreeMap;

use foreman_model::{NodePhase, NodeType, Workflow};

/// Recomputes `status.progress` as `succeeded/total` over pod-typed nodes.
pub fn update_progress(workflow: &mut Workflow) {
    let mut total = 0usize;
    let mut succeeded = 0usize;
    for node in workflow.status.nodes.values() {
        if node.node_type != NodeType::Pod {
            continue;
        }
        total += 1;
        if node.phase == NodePhase::Succeeded {
            succeeded += 1;
        }
    }
    workflow.status.progress = format!("{succeeded}/{total}");
}

/// Sums per-node resource durations into the workflow total.
pub fn update_resource_durations(workflow: &mut Workflow) {
    let mut totals: BTreeMap<String, i64> = BTreeMap::new();
    for node in workflow.status.nodes.values() {
        for (resource, seconds) in &node.resources_duration {
            *totals.entry(resource.clone()).or_default() += seconds;
        }
    }
    workflow.status.resources_duration = totals;
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::NodeStatus;

    #[test]
    fn progress_counts_only_pod_nodes() {
        let mut workflow = Workflow::default();
        for (id, node_type, phase) in [
            ("a", NodeType::Pod, NodePhase::Succeeded),
            ("b", NodeType::Pod, NodePhase::Running),
            ("c", NodeType::Steps, NodePhase::Succeeded),
        ] {
            workflow.status.nodes.insert(NodeStatus {
                id: id.to_string(),
                name: id.to_string(),
                node_type,
                phase,
                ..Default::default()
            });
        }
        update_progress(&mut workflow);
        assert_eq!(workflow.status.progress, "1/2");
    }

    #[test]
    fn resource_durations_sum_across_nodes() {
        let mut workflow = Workflow::default();
        for (id, seconds) in [("a", 5), ("b", 7)] {
            workflow.status.nodes.insert(NodeStatus {
                id: id.to_string(),
                name: id.to_string(),
                resources_duration: BTreeMap::from([("cpu".to_string(), seconds)]),
                ..Default::default()
            });
        }
        update_resource_durations(&mut workflow);
        assert_eq!(workflow.status.resources_duration.get("cpu"), Some(&12));
    }
}
