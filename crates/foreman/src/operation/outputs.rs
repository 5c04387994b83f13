//! Output propagation between nodes, scopes, and the workflow.

use serde_json::{Map, Value};

use foreman_model::{loop_index, NodeStatus, Outputs, Parameter};

use crate::error::OperateError;
use crate::scope::Scope;

use super::WorkflowOperation;

impl<'a> WorkflowOperation<'a> {
    /// Publishes globally named outputs to `workflow.outputs.*` and the
    /// workflow status.
    pub(crate) fn add_outputs_to_global_scope(&mut self, outputs: &Outputs) {
        for parameter in &outputs.parameters {
            let Some(global_name) = &parameter.global_name else {
                continue;
            };
            let Some(value) = &parameter.value else {
                continue;
            };
            self.scope.set_global(
                format!("workflow.outputs.parameters.{global_name}"),
                value.clone(),
            );
            let status_outputs = self.wf.status.outputs.get_or_insert_with(Outputs::default);
            match status_outputs
                .parameters
                .iter_mut()
                .find(|existing| existing.name == *global_name)
            {
                Some(existing) => {
                    if existing.value.as_deref() != Some(value) {
                        existing.value = Some(value.clone());
                        self.updated = true;
                    }
                }
                None => {
                    status_outputs.parameters.push(Parameter {
                        name: global_name.clone(),
                        value: Some(value.clone()),
                        ..Default::default()
                    });
                    self.updated = true;
                }
            }
        }
        for artifact in &outputs.artifacts {
            let Some(global_name) = &artifact.global_name else {
                continue;
            };
            let status_outputs = self.wf.status.outputs.get_or_insert_with(Outputs::default);
            if !status_outputs
                .artifacts
                .iter()
                .any(|existing| existing.name == *global_name)
            {
                let mut published = artifact.clone();
                published.name = global_name.clone();
                status_outputs.artifacts.push(published);
                self.updated = true;
            }
        }
    }

    /// Publishes one child's identity and outputs under `PREFIX.*`
    /// (`steps.NAME` or `tasks.NAME`).
    pub(crate) fn add_node_outputs_to_scope(
        &mut self,
        prefix: &str,
        node: &NodeStatus,
        scope: &mut Scope,
    ) {
        scope.set_local(format!("{prefix}.id"), node.id.clone());
        scope.set_local(format!("{prefix}.status"), node.phase.to_string());
        if let Some(started) = node.started_at {
            scope.set_local(format!("{prefix}.startedAt"), started.to_rfc3339());
        }
        if let Some(finished) = node.finished_at {
            scope.set_local(format!("{prefix}.finishedAt"), finished.to_rfc3339());
        }
        if let Some(outputs) = &node.outputs {
            if let Some(result) = &outputs.result {
                scope.set_local(format!("{prefix}.outputs.result"), result.clone());
            }
            if let Some(exit_code) = &outputs.exit_code {
                scope.set_local(format!("{prefix}.exitCode"), exit_code.clone());
            }
            for parameter in &outputs.parameters {
                if let Some(value) = &parameter.value {
                    scope.set_local(
                        format!("{prefix}.outputs.parameters.{}", parameter.name),
                        value.clone(),
                    );
                }
            }
            for artifact in &outputs.artifacts {
                scope.set_artifact(
                    format!("{prefix}.outputs.artifacts.{}", artifact.name),
                    artifact.clone(),
                );
            }
            self.add_outputs_to_global_scope(outputs);
        }
    }

    /// Aggregates item-expanded children into JSON lists under
    /// `PREFIX.outputs.parameters` and `PREFIX.outputs.result`, ordered by
    /// the loop index embedded in each child name.
    pub(crate) fn aggregate_child_outputs_to_scope(
        &mut self,
        prefix: &str,
        mut children: Vec<NodeStatus>,
        scope: &mut Scope,
    ) -> Result<(), OperateError> {
        children.sort_by_key(|child| loop_index(&child.name).unwrap_or(usize::MAX));
        let mut parameter_maps: Vec<Value> = Vec::new();
        let mut results: Vec<Value> = Vec::new();
        for child in &children {
            let Some(outputs) = &child.outputs else {
                continue;
            };
            if let Some(result) = &outputs.result {
                results.push(Value::String(result.clone()));
            }
            let mut map = Map::new();
            for parameter in &outputs.parameters {
                if let Some(value) = &parameter.value {
                    map.insert(parameter.name.clone(), Value::String(value.clone()));
                }
            }
            if !map.is_empty() {
                parameter_maps.push(Value::Object(map));
            }
            self.add_outputs_to_global_scope(outputs);
        }
        if !parameter_maps.is_empty() {
            scope.set_local(
                format!("{prefix}.outputs.parameters"),
                serde_json::to_string(&parameter_maps)?,
            );
        }
        if !results.is_empty() {
            scope.set_local(
                format!("{prefix}.outputs.result"),
                serde_json::to_string(&results)?,
            );
        }
        Ok(())
    }

    /// Builds a template's declared outputs by resolving each `valueFrom`
    /// reference against the scope.
    pub(crate) fn template_outputs_from_scope(
        &self,
        declared: &Outputs,
        scope: &Scope,
    ) -> Result<Option<Outputs>, OperateError> {
        if declared.is_empty() {
            return Ok(None);
        }
        let mut outputs = Outputs::default();
        for parameter in &declared.parameters {
            let Some(value_from) = &parameter.value_from else {
                outputs.parameters.push(parameter.clone());
                continue;
            };
            let Some(reference) = &value_from.parameter else {
                outputs.parameters.push(parameter.clone());
                continue;
            };
            let value = match scope.substitute(reference, false) {
                Ok(value) => value,
                Err(err) => match &value_from.default {
                    Some(default) => default.clone(),
                    None => return Err(err),
                },
            };
            outputs.parameters.push(Parameter {
                name: parameter.name.clone(),
                value: Some(value),
                value_from: None,
                global_name: parameter.global_name.clone(),
            });
        }
        for artifact in &declared.artifacts {
            let mut resolved = artifact.clone();
            if let Some(from) = &artifact.from {
                let key = from
                    .trim()
                    .trim_start_matches("{{")
                    .trim_end_matches("}}")
                    .trim();
                if let Some(source) = scope.lookup_artifact(key) {
                    let mut source = source.clone();
                    source.name = artifact.name.clone();
                    source.global_name = artifact.global_name.clone();
                    resolved = source;
                }
            }
            outputs.artifacts.push(resolved);
        }
        Ok(Some(outputs))
    }
}
