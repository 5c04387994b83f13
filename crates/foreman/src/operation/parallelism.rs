//! Workflow, template, and boundary parallelism limits.

use tracing::info;

use foreman_model::{NodeStatus, Template, TemplateType};

use crate::error::OperateError;

use super::WorkflowOperation;

impl<'a> WorkflowOperation<'a> {
    /// Refuses execution with `ParallelismReached` when a limit holds. A
    /// refusal leaves existing nodes untouched and creates nothing.
    pub(crate) fn check_parallelism(
        &mut self,
        template: &Template,
        node: Option<&NodeStatus>,
        boundary_id: &str,
    ) -> Result<(), OperateError> {
        if let Some(limit) = self.exec_spec.parallelism {
            if self.active_pods >= limit {
                info!(
                    active = self.active_pods,
                    limit, "workflow parallelism reached"
                );
                return Err(OperateError::ParallelismReached);
            }
        }

        let is_group = matches!(
            template.template_type(),
            TemplateType::Steps | TemplateType::Dag
        );
        if is_group {
            if let Some(node) = node {
                if template.fail_fast == Some(true) {
                    let has_failed_child = node
                        .children
                        .iter()
                        .filter_map(|child_id| self.wf.status.nodes.get(child_id))
                        .any(NodeStatus::failed_or_error);
                    if has_failed_child {
                        info!(node = %node.name, "fail-fast short-circuit");
                        return Err(OperateError::ParallelismReached);
                    }
                }
                if let Some(limit) = template.parallelism {
                    let active = self.count_active_children(node);
                    if active >= limit {
                        info!(node = %node.name, active, limit, "template parallelism reached");
                        return Err(OperateError::ParallelismReached);
                    }
                }
            }
        }

        // about to create work under a boundary: apply the enclosing
        // template's limits identically
        let starting_new_work = node.map_or(true, |node| !node.phase.active());
        if !boundary_id.is_empty() && starting_new_work {
            let Some(boundary_node) = self.wf.status.nodes.get(boundary_id) else {
                return Ok(());
            };
            let boundary_template = boundary_node
                .template_name
                .as_deref()
                .and_then(|name| self.exec_spec.template(name));
            if let Some(boundary_template) = boundary_template {
                if boundary_template.fail_fast == Some(true) {
                    let has_failed_child = boundary_node
                        .children
                        .iter()
                        .filter_map(|child_id| self.wf.status.nodes.get(child_id))
                        .any(NodeStatus::failed_or_error);
                    if has_failed_child {
                        info!(boundary = %boundary_node.name, "boundary fail-fast short-circuit");
                        return Err(OperateError::ParallelismReached);
                    }
                }
                if let Some(limit) = boundary_template.parallelism {
                    let active = self.count_active_pods(Some(boundary_id));
                    if active >= limit {
                        info!(
                            boundary = %boundary_node.name,
                            active,
                            limit,
                            "boundary parallelism reached"
                        );
                        return Err(OperateError::ParallelismReached);
                    }
                }
            }
        }

        Ok(())
    }
}
