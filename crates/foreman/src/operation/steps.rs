//! Steps execution: sequential groups of parallel steps.

use tracing::{debug, warn};

use foreman_model::{
    item_child_name, ContinueOn, NodePhase, NodeStatus, NodeType, ParallelSteps, Template,
    TemplateBody, TemplateHolder, WorkflowStep,
};

use crate::conditions::eval_when;
use crate::error::OperateError;
use crate::items::{expand_items, process_item};
use crate::scope::Scope;
use crate::template::TemplateContext;

use super::{ExecuteOpts, WorkflowOperation};

pub(crate) fn continue_on_tolerates(continue_on: Option<&ContinueOn>, phase: NodePhase) -> bool {
    let Some(continue_on) = continue_on else {
        return false;
    };
    match phase {
        NodePhase::Failed => continue_on.failed == Some(true),
        NodePhase::Error => continue_on.error == Some(true),
        _ => false,
    }
}

impl<'a> WorkflowOperation<'a> {
    pub(crate) async fn execute_steps(
        &mut self,
        node_name: &str,
        context: TemplateContext,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
    ) -> Result<NodeStatus, OperateError> {
        let TemplateBody::Steps(groups) = &template.body else {
            return Err(OperateError::InvariantViolation(format!(
                "template {} is not a steps template",
                template.name
            )));
        };
        let groups = groups.clone();

        if self.wf.node_by_name(node_name).is_none() {
            self.initialize_executable_node(
                node_name,
                NodeType::Steps,
                template_scope,
                template,
                holder,
                &opts.boundary_id,
                NodePhase::Running,
                "",
            );
        }
        let steps_node_id = self.wf.node_id(node_name);
        let mut scope = self.scope.clone();

        for (index, group) in groups.iter().enumerate() {
            let group_node_name = format!("{node_name}[{index}]");
            if self.wf.node_by_name(&group_node_name).is_none() {
                self.initialize_node(
                    &group_node_name,
                    NodeType::StepGroup,
                    template_scope,
                    None,
                    &steps_node_id,
                    NodePhase::Running,
                    "",
                );
                if index == 0 {
                    self.add_child_node(node_name, &group_node_name);
                } else {
                    // chain the new group off the previous group's leaves
                    let previous_name = format!("{node_name}[{}]", index - 1);
                    let previous_id = self.wf.node_id(&previous_name);
                    let outbound_names: Vec<String> = self
                        .outbound_nodes(&previous_id)
                        .into_iter()
                        .filter_map(|id| self.wf.status.nodes.get(&id).map(|n| n.name.clone()))
                        .collect();
                    for outbound in outbound_names {
                        self.add_child_node(&outbound, &group_node_name);
                    }
                }
            }

            let group_node = self
                .execute_step_group(
                    &group_node_name,
                    group,
                    &context,
                    template_scope,
                    &steps_node_id,
                    &mut scope,
                    opts,
                )
                .await?;
            if !group_node.fulfilled() {
                debug!(node = %node_name, group = index, "step group still running");
                return Ok(self
                    .wf
                    .node_by_name(node_name)
                    .cloned()
                    .expect("steps node initialized"));
            }
            if group_node.failed_or_error() {
                return self.mark_node_phase(node_name, group_node.phase, Some(&group_node.message));
            }
            self.add_group_outputs_to_scope(group, &group_node_name, &mut scope)?;
        }

        let outputs = self.template_outputs_from_scope(&template.outputs, &scope)?;
        let outbound = match groups.len().checked_sub(1) {
            Some(last) => {
                let last_id = self.wf.node_id(&format!("{node_name}[{last}]"));
                self.outbound_nodes(&last_id)
            }
            None => Vec::new(),
        };
        if let Some(node) = self.wf.status.nodes.get_mut(&steps_node_id) {
            if let Some(outputs) = outputs {
                node.outputs = Some(outputs);
            }
            node.outbound_nodes = outbound;
            self.updated = true;
        }
        self.mark_node_phase(node_name, NodePhase::Succeeded, None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step_group(
        &mut self,
        group_node_name: &str,
        group: &ParallelSteps,
        context: &TemplateContext,
        template_scope: &str,
        boundary_id: &str,
        scope: &mut Scope,
        opts: &ExecuteOpts,
    ) -> Result<NodeStatus, OperateError> {
        let group_node = self
            .wf
            .node_by_name(group_node_name)
            .cloned()
            .ok_or_else(|| {
                OperateError::InvariantViolation(format!(
                    "step group {group_node_name} uninitialized"
                ))
            })?;
        if group_node.fulfilled() {
            return Ok(group_node);
        }

        let steps = expand_group_steps(group, scope)?;
        for step in &steps {
            let child_node_name = format!("{group_node_name}.{}", step.name);
            if let Some(when) = &step.when {
                match eval_when(when) {
                    Ok(true) => {}
                    Ok(false) => {
                        if self.wf.node_by_name(&child_node_name).is_none() {
                            self.initialize_node(
                                &child_node_name,
                                NodeType::Skipped,
                                template_scope,
                                None,
                                boundary_id,
                                NodePhase::Skipped,
                                &format!("when '{when}' evaluated false"),
                            );
                            self.add_child_node(group_node_name, &child_node_name);
                        }
                        continue;
                    }
                    Err(err) => {
                        if self.wf.node_by_name(&child_node_name).is_none() {
                            self.initialize_node(
                                &child_node_name,
                                NodeType::Skipped,
                                template_scope,
                                None,
                                boundary_id,
                                NodePhase::Error,
                                &err.to_string(),
                            );
                            self.add_child_node(group_node_name, &child_node_name);
                        }
                        continue;
                    }
                }
            }
            let child_opts = ExecuteOpts {
                boundary_id: boundary_id.to_string(),
                on_exit_template: opts.on_exit_template,
                ..Default::default()
            };
            let outcome = self
                .execute_template(
                    child_node_name.clone(),
                    TemplateHolder::Step(step.clone()),
                    context.clone(),
                    step.arguments.clone(),
                    child_opts,
                )
                .await;
            match outcome {
                Ok(_) => self.add_child_node(group_node_name, &child_node_name),
                Err(OperateError::DeadlineExceeded) => return Err(OperateError::DeadlineExceeded),
                Err(OperateError::ParallelismReached) => {
                    debug!(group = %group_node_name, "parallelism reached, deferring remaining steps");
                    return Ok(self
                        .wf
                        .node_by_name(group_node_name)
                        .cloned()
                        .expect("group node initialized"));
                }
                Err(OperateError::Timeout(_)) => {
                    // the child was already failed by the timeout check
                    self.add_child_node(group_node_name, &child_node_name);
                }
                Err(err) => {
                    warn!(step = %step.name, error = %err, "step execution failed");
                    self.add_child_node(group_node_name, &child_node_name);
                    return self.mark_node_phase(
                        group_node_name,
                        NodePhase::Error,
                        Some(&err.to_string()),
                    );
                }
            }
        }

        // the group completes once every expanded step has fulfilled
        let mut failure: Option<(NodePhase, String)> = None;
        for step in &steps {
            let child_node_name = format!("{group_node_name}.{}", step.name);
            let Some(child) = self.wf.node_by_name(&child_node_name) else {
                return Ok(self
                    .wf
                    .node_by_name(group_node_name)
                    .cloned()
                    .expect("group node initialized"));
            };
            if !child.fulfilled() {
                return Ok(self
                    .wf
                    .node_by_name(group_node_name)
                    .cloned()
                    .expect("group node initialized"));
            }
            if child.failed_or_error()
                && !continue_on_tolerates(step.continue_on.as_ref(), child.phase)
                && failure.is_none()
            {
                failure = Some((
                    child.phase,
                    format!("child '{}' failed: {}", child.display_name, child.message),
                ));
            }
        }
        match failure {
            Some((phase, message)) => {
                self.mark_node_phase(group_node_name, phase, Some(&message))
            }
            None => self.mark_node_phase(group_node_name, NodePhase::Succeeded, None),
        }
    }

    /// Publishes each completed step's outputs under `steps.NAME.*`;
    /// item-expanded steps aggregate into JSON lists.
    fn add_group_outputs_to_scope(
        &mut self,
        group: &ParallelSteps,
        group_node_name: &str,
        scope: &mut Scope,
    ) -> Result<(), OperateError> {
        for step in &group.0 {
            let is_expanded = !step.with_items.is_empty()
                || step.with_param.is_some()
                || step.with_sequence.is_some();
            let prefix = format!("steps.{}", step.name);
            if is_expanded {
                let item_prefix = format!("{group_node_name}.{}(", step.name);
                let children: Vec<NodeStatus> = self
                    .wf
                    .status
                    .nodes
                    .values()
                    .filter(|node| node.name.starts_with(&item_prefix))
                    .cloned()
                    .collect();
                self.aggregate_child_outputs_to_scope(&prefix, children, scope)?;
            } else {
                let child_node_name = format!("{group_node_name}.{}", step.name);
                if let Some(child) = self.wf.node_by_name(&child_node_name).cloned() {
                    self.add_node_outputs_to_scope(&prefix, &child, scope);
                }
            }
        }
        Ok(())
    }
}

/// Substitutes each step through the scope, then expands fan-out items into
/// concrete, item-bound steps.
fn expand_group_steps(
    group: &ParallelSteps,
    scope: &Scope,
) -> Result<Vec<WorkflowStep>, OperateError> {
    let mut expanded = Vec::new();
    for step in &group.0 {
        let serialized = serde_json::to_string(step)?;
        let substituted = scope.substitute(&serialized, true)?;
        let step: WorkflowStep = serde_json::from_str(&substituted)?;
        match expand_items(
            &step.with_items,
            step.with_param.as_deref(),
            step.with_sequence.as_ref(),
        )? {
            Some(items) => {
                for (index, item) in items.iter().enumerate() {
                    let mut bound = process_item(&step, item)?;
                    bound.name = item_child_name(&step.name, index, &item.description());
                    bound.with_items.clear();
                    bound.with_param = None;
                    bound.with_sequence = None;
                    expanded.push(bound);
                }
            }
            None => expanded.push(step),
        }
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::Item;
    use serde_json::json;

    #[test]
    fn continue_on_matches_the_failure_class() {
        let tolerate_failed = ContinueOn {
            failed: Some(true),
            error: None,
        };
        assert!(continue_on_tolerates(Some(&tolerate_failed), NodePhase::Failed));
        assert!(!continue_on_tolerates(Some(&tolerate_failed), NodePhase::Error));
        assert!(!continue_on_tolerates(None, NodePhase::Failed));
    }

    #[test]
    fn expand_group_steps_binds_items_and_renames() {
        let group = ParallelSteps(vec![WorkflowStep {
            name: "fan".to_string(),
            template: Some("echo".to_string()),
            with_items: vec![Item(json!("a")), Item(json!("b"))],
            ..Default::default()
        }]);
        let expanded = expand_group_steps(&group, &Scope::default()).expect("expand");
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].name, "fan(0:a)");
        assert_eq!(expanded[1].name, "fan(1:b)");
        assert!(expanded[0].with_items.is_empty());
    }
}
