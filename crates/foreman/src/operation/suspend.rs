//! Suspend nodes: hold a position in the tree until resumed or timed out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use foreman_model::{NodePhase, NodeStatus, NodeType, Template, TemplateBody, TemplateHolder};

use crate::config::parse_duration;
use crate::error::OperateError;

use super::{ExecuteOpts, WorkflowOperation};

impl<'a> WorkflowOperation<'a> {
    pub(crate) fn execute_suspend(
        &mut self,
        node_name: &str,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
    ) -> Result<NodeStatus, OperateError> {
        let TemplateBody::Suspend(spec) = &template.body else {
            return Err(OperateError::InvariantViolation(format!(
                "template {} is not a suspend template",
                template.name
            )));
        };
        if self.wf.node_by_name(node_name).is_none() {
            info!(node = %node_name, "node suspended");
            self.initialize_executable_node(
                node_name,
                NodeType::Suspend,
                template_scope,
                template,
                holder,
                &opts.boundary_id,
                NodePhase::Running,
                "",
            );
        }
        let node = self
            .wf
            .node_by_name(node_name)
            .cloned()
            .expect("suspend node initialized above");
        if node.fulfilled() {
            return Ok(node);
        }

        let now = self.now();
        let duration_deadline: Option<DateTime<Utc>> = match &spec.duration {
            Some(raw) => {
                let duration = parse_duration(raw)?;
                let started = node.started_at.unwrap_or(now);
                Some(started + chrono::Duration::from_std(duration).unwrap_or_default())
            }
            None => None,
        };

        if let Some(deadline) = duration_deadline {
            if now >= deadline {
                return self.mark_node_phase(node_name, NodePhase::Succeeded, None);
            }
        }

        // requeue at the earlier of the auto-resume point and the workflow
        // deadline
        let resume_at = match (duration_deadline, self.workflow_deadline) {
            (Some(duration), Some(workflow)) => Some(duration.min(workflow)),
            (duration, workflow) => duration.or(workflow),
        };
        if let Some(resume_at) = resume_at {
            let wait = (resume_at - now).to_std().unwrap_or(Duration::ZERO);
            self.requeue_after(wait);
        }
        Ok(node)
    }
}
