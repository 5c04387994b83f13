//! Persistence: diff, dehydrate, optimistically update, reapply on conflict.

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use foreman_backends_core::{
    BackendError, Hydrator, PodCleanupAction, PodManager, SyncManager, WorkflowApi,
};
use foreman_model::{Nodes, PodGCStrategy, PodPhase, Workflow};

use crate::error::OperateError;
use crate::progress::{update_progress, update_resource_durations};

use super::WorkflowOperation;

/// RFC 7386 merge patch producing `original -> desired`.
pub(crate) fn create_merge_patch(original: &Value, desired: &Value) -> Value {
    match (original, desired) {
        (Value::Object(original), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, desired_value) in desired {
                match original.get(key) {
                    Some(original_value) if original_value == desired_value => {}
                    Some(original_value) => {
                        patch.insert(
                            key.clone(),
                            create_merge_patch(original_value, desired_value),
                        );
                    }
                    None => {
                        patch.insert(key.clone(), desired_value.clone());
                    }
                }
            }
            for key in original.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

/// Applies an RFC 7386 merge patch onto a target document.
pub(crate) fn apply_merge_patch(target: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(patch_map) => {
            let mut result = match target {
                Value::Object(target_map) => target_map.clone(),
                _ => Map::new(),
            };
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    result.remove(key);
                } else {
                    let merged = apply_merge_patch(
                        result.get(key).unwrap_or(&Value::Null),
                        patch_value,
                    );
                    result.insert(key.clone(), merged);
                }
            }
            Value::Object(result)
        }
        other => other.clone(),
    }
}

impl<'a> WorkflowOperation<'a> {
    /// Writes the mutated workflow back, skipping when nothing changed.
    pub(crate) async fn persist_updates(&mut self) {
        if !self.updated {
            return;
        }

        update_resource_durations(&mut self.wf);
        update_progress(&mut self.wf);

        if self.orig.metadata.resource_version != self.wf.metadata.resource_version {
            error!("cannot persist updates with mismatched resource versions");
            return;
        }

        let nodes = self.wf.status.nodes.clone();

        if self.wf.status.fulfilled() && self.wf.status.synchronization.is_some() {
            let sync_manager = std::sync::Arc::clone(&self.operator.c.sync);
            if sync_manager.release_all(&mut self.wf) {
                info!(workflow = %self.wf.name(), "released all acquired locks");
            }
        }

        if let Err(err) = self.operator.c.hydrator.dehydrate(&mut self.wf).await {
            warn!(error = %err, "failed to dehydrate");
            self.mark_workflow_error(&err.to_string());
        }

        match self.operator.c.api.update(&self.wf).await {
            Ok(updated) => {
                self.wf = updated;
                self.operator.c.hydrator.hydrate_with_nodes(&mut self.wf, &nodes);
            }
            Err(BackendError::RequestEntityTooLarge(reason)) => {
                self.persist_size_limit_error(&reason).await;
                return;
            }
            Err(BackendError::Conflict(reason)) => {
                info!(reason = %reason, "re-applying updates on latest version");
                match self.reapply_update(&nodes).await {
                    Ok(workflow) => self.wf = workflow,
                    Err(err) => {
                        warn!(error = %err, "failed to re-apply update");
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "error updating workflow");
                return;
            }
        }

        if !self.operator.c.hydrator.is_hydrated(&self.wf) {
            error!("workflow should be hydrated after persist");
            return;
        }

        info!(
            resource_version = %self.wf.metadata.resource_version,
            phase = %self.wf.status.phase,
            "workflow update successful"
        );

        if self.operator.config.informer_write_back {
            if let Err(err) = self.operator.c.api.write_back(&self.wf) {
                self.mark_workflow_error(&err.to_string());
                return;
            }
        }

        // pods are only labeled or deleted after a successful persist, so
        // state never runs ahead of the API
        for (pod_name, pod_phase) in std::mem::take(&mut self.completed_pods) {
            let action = match &self.exec_spec.pod_gc {
                Some(gc) => match gc.strategy {
                    Some(PodGCStrategy::OnPodSuccess) if pod_phase == PodPhase::Succeeded => {
                        Some(PodCleanupAction::DeletePod)
                    }
                    Some(PodGCStrategy::OnPodSuccess) => None,
                    Some(PodGCStrategy::OnPodCompletion) => Some(PodCleanupAction::DeletePod),
                    None => None,
                },
                None => Some(PodCleanupAction::LabelPodCompleted),
            };
            if let Some(action) = action {
                self.operator
                    .c
                    .pods
                    .queue_for_cleanup(self.wf.namespace(), &pod_name, action);
            }
        }
    }

    /// The object outgrew the API's size limit: reset to the original and
    /// persist only the error.
    async fn persist_size_limit_error(&mut self, reason: &str) {
        self.wf = self.orig.clone();
        self.mark_workflow_error(&format!("request entity too large: {reason}"));
        if let Err(err) = self.operator.c.api.update(&self.wf).await {
            warn!(error = %err, "error updating workflow with size error");
        }
    }

    /// Rebuilds the update as a merge patch against the latest version and
    /// retries, refusing to regress fulfilled workflows or terminal nodes.
    async fn reapply_update(&mut self, nodes: &Nodes) -> Result<Workflow, OperateError> {
        if self.orig.metadata.resource_version != self.wf.metadata.resource_version {
            return Err(OperateError::InvariantViolation(
                "cannot re-apply update with mismatched resource versions".to_string(),
            ));
        }
        let mut original = self.orig.clone();
        self.operator.c.hydrator.hydrate(&mut original).await?;
        let original_json = serde_json::to_value(&original)?;
        self.operator.c.hydrator.hydrate_with_nodes(&mut self.wf, nodes);
        let desired_json = serde_json::to_value(&self.wf)?;
        let patch = create_merge_patch(&original_json, &desired_json);

        let mut attempt = 1;
        loop {
            let mut latest = self
                .operator
                .c
                .api
                .get(self.wf.namespace(), &self.wf.metadata.name.clone())
                .await?;
            if latest.status.fulfilled() {
                return Err(OperateError::InvariantViolation(
                    "must never update completed workflows".to_string(),
                ));
            }
            self.operator.c.hydrator.hydrate(&mut latest).await?;
            for (node_id, node) in self.wf.status.nodes.iter() {
                if let Some(latest_node) = latest.status.nodes.get(node_id) {
                    if latest_node.phase.fulfilled() && node.phase != latest_node.phase {
                        return Err(OperateError::InvariantViolation(format!(
                            "must never update completed node {node_id}"
                        )));
                    }
                }
            }
            let latest_json = serde_json::to_value(&latest)?;
            let merged = apply_merge_patch(&latest_json, &patch);
            let mut patched: Workflow = serde_json::from_value(merged)?;
            patched.metadata.resource_version = latest.metadata.resource_version.clone();
            self.operator.c.hydrator.dehydrate(&mut patched).await?;
            match self.operator.c.api.update(&patched).await {
                Ok(mut updated) => {
                    info!(attempt, "update retry attempt successful");
                    self.operator.c.hydrator.hydrate_with_nodes(&mut updated, nodes);
                    return Ok(updated);
                }
                Err(err) => {
                    attempt += 1;
                    warn!(attempt, error = %err, "update retry attempt failed");
                    if attempt > 5 {
                        return Err(err.into());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_captures_changes_additions_and_removals() {
        let original = json!({"a": 1, "b": {"x": 1, "y": 2}, "gone": true});
        let desired = json!({"a": 2, "b": {"x": 1, "y": 3}, "new": "v"});
        let patch = create_merge_patch(&original, &desired);
        assert_eq!(patch, json!({"a": 2, "b": {"y": 3}, "new": "v", "gone": null}));
    }

    #[test]
    fn apply_merge_patch_round_trips() {
        let original = json!({"a": 1, "b": {"x": 1, "y": 2}, "gone": true});
        let desired = json!({"a": 2, "b": {"x": 1, "y": 3}, "new": "v"});
        let patch = create_merge_patch(&original, &desired);
        assert_eq!(apply_merge_patch(&original, &patch), desired);
    }

    #[test]
    fn patch_applies_cleanly_over_third_party_changes() {
        let original = json!({"status": {"phase": "Running", "message": ""}});
        let desired = json!({"status": {"phase": "Succeeded", "message": ""}});
        let patch = create_merge_patch(&original, &desired);
        // a concurrent writer touched an unrelated field
        let latest = json!({"status": {"phase": "Running", "message": "", "other": 1}});
        assert_eq!(
            apply_merge_patch(&latest, &patch),
            json!({"status": {"phase": "Succeeded", "message": "", "other": 1}})
        );
    }
}
