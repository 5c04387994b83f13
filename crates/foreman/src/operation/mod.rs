//! The reconciliation driver.
//!
//! `Operator::operate` runs one reconciliation: resolve the execution spec,
//! assess pods, walk the template tree, infer the workflow phase, persist.
//! The per-call state lives in `WorkflowOperation`, which the submodules
//! extend with the template execution pipeline, retry planning, pod
//! assessment, and persistence.

mod assess;
mod dag;
mod execute;
mod memoize;
mod metrics;
mod outputs;
mod parallelism;
mod persist;
mod retries;
mod steps;
mod suspend;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use foreman_backends_core::{
    ArtifactRepositories, CacheFactory, Clock, Estimator, EventRecorder, EventType, Hydrator,
    MetricsSink, PodManager, SyncManager, TemplateStore, WorkflowApi,
};
use foreman_model::{
    display_name, upsert_condition, Condition, ConditionType, NodePhase, NodeStatus, NodeType,
    PodPhase, TemplateHolder, Workflow, WorkflowPhase, WorkflowSpec, LABEL_COMPLETED, LABEL_PHASE,
};

use crate::config::OperatorConfig;
use crate::error::OperateError;
use crate::scope::Scope;
use crate::template::{merge_workflow_spec, TemplateContext, TemplateScope};

/// Everything the operator delegates side effects to.
#[derive(Clone)]
pub struct Collaborators {
    pub pods: Arc<dyn PodManager>,
    pub caches: Arc<dyn CacheFactory>,
    pub sync: Arc<dyn SyncManager>,
    pub artifacts: Arc<dyn ArtifactRepositories>,
    pub templates: Arc<dyn TemplateStore>,
    pub metrics: Arc<dyn MetricsSink>,
    pub events: Arc<dyn EventRecorder>,
    pub estimator: Arc<dyn Estimator>,
    pub api: Arc<dyn WorkflowApi>,
    pub hydrator: Arc<dyn Hydrator>,
    pub clock: Arc<dyn Clock>,
}

/// Outcome of one reconciliation.
pub struct OperationResult {
    pub workflow: Workflow,
    /// When set, the outer loop should requeue after this delay; zero means
    /// requeue immediately (rate-limited by the queue).
    pub requeue_after: Option<Duration>,
}

pub struct Operator {
    pub(crate) config: OperatorConfig,
    pub(crate) c: Collaborators,
}

impl Operator {
    pub fn new(config: OperatorConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            c: collaborators,
        }
    }

    /// Runs one reconciliation to completion, the soft deadline, or
    /// cancellation. Must not be called concurrently for the same workflow,
    /// nor twice on the same in-memory object.
    pub async fn operate(&self, workflow: Workflow, cancel: CancellationToken) -> OperationResult {
        let mut op = WorkflowOperation::new(self, workflow, cancel);
        let outcome = std::panic::AssertUnwindSafe(op.run()).catch_unwind().await;
        if let Err(panic) = outcome {
            let message = panic_message(panic);
            error!(panic = %message, "recovered from panic during reconciliation");
            self.c.metrics.operation_panic();
            op.mark_workflow_error(&message);
        }
        if op.wf.status.fulfilled() {
            op.shutdown_daemoned_children();
        }
        op.teardown_completed().await;
        op.persist_updates().await;
        OperationResult {
            workflow: op.wf,
            requeue_after: op.requeue_after,
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Options threaded through template execution.
#[derive(Clone, Debug, Default)]
pub(crate) struct ExecuteOpts {
    /// Enclosing Steps/DAG node ID; empty at top level.
    pub boundary_id: String,
    /// Executing as part of the exit handler.
    pub on_exit_template: bool,
    /// Deadline inherited from a retry max-duration window.
    pub execution_deadline: Option<DateTime<Utc>>,
    /// Hosts previous retry attempts failed on.
    pub avoid_hosts: Vec<String>,
}

/// Per-call reconciliation state.
pub(crate) struct WorkflowOperation<'a> {
    pub(crate) operator: &'a Operator,
    pub(crate) wf: Workflow,
    pub(crate) orig: Workflow,
    pub(crate) exec_spec: WorkflowSpec,
    pub(crate) scope: Scope,
    pub(crate) updated: bool,
    pub(crate) deadline: DateTime<Utc>,
    pub(crate) workflow_deadline: Option<DateTime<Utc>>,
    pub(crate) active_pods: i64,
    pub(crate) pre_execution_phases: FxHashMap<String, NodePhase>,
    pub(crate) completed_pods: BTreeMap<String, PodPhase>,
    pub(crate) requeue_after: Option<Duration>,
    pub(crate) cancel: CancellationToken,
}

impl<'a> WorkflowOperation<'a> {
    fn new(operator: &'a Operator, workflow: Workflow, cancel: CancellationToken) -> Self {
        let now = operator.c.clock.now();
        let deadline = now
            + chrono::Duration::from_std(operator.config.max_operation_time)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            operator,
            orig: workflow.clone(),
            wf: workflow,
            exec_spec: WorkflowSpec::default(),
            scope: Scope::default(),
            updated: false,
            deadline,
            workflow_deadline: None,
            active_pods: 0,
            pre_execution_phases: FxHashMap::default(),
            completed_pods: BTreeMap::new(),
            requeue_after: None,
            cancel,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.operator.c.clock.now()
    }

    pub(crate) fn requeue_after(&mut self, after: Duration) {
        self.requeue_after = Some(match self.requeue_after {
            Some(existing) => existing.min(after),
            None => after,
        });
    }

    pub(crate) fn requeue(&mut self) {
        self.requeue_after(Duration::ZERO);
    }

    async fn run(&mut self) {
        if self.wf.status.fulfilled() {
            debug!(workflow = %self.wf.name(), "workflow already fulfilled");
            return;
        }
        info!(workflow = %self.wf.name(), phase = %self.wf.status.phase, "processing workflow");

        if let Err(err) = self.set_exec_workflow().await {
            error!(error = %err, "unable to resolve execution spec");
            self.mark_workflow_failed(&err.to_string());
            return;
        }

        if self.wf.status.artifact_repository_ref.is_none() {
            match self
                .operator
                .c
                .artifacts
                .resolve(
                    self.exec_spec.artifact_repository_ref.as_ref(),
                    &self.wf.metadata.namespace,
                )
                .await
            {
                Ok(resolved) => {
                    self.wf.status.artifact_repository_ref = Some(resolved);
                    self.updated = true;
                }
                Err(err) => {
                    self.mark_workflow_error(&format!("failed to resolve artifact repository: {err}"));
                    return;
                }
            }
        }
        let repository_ref = self
            .wf
            .status
            .artifact_repository_ref
            .clone()
            .unwrap_or_default();
        if let Err(err) = self.operator.c.artifacts.get(&repository_ref).await {
            self.mark_workflow_error(&format!("failed to get artifact repository: {err}"));
            return;
        }

        if let Some(sync) = self.exec_spec.synchronization.clone() {
            let sync_manager = Arc::clone(&self.operator.c.sync);
            match sync_manager.try_acquire(&mut self.wf, "", &sync).await {
                Ok(result) => {
                    self.updated |= result.status_dirty;
                    if !result.acquired {
                        warn!(workflow = %self.wf.name(), "workflow processing postponed by concurrency limit");
                        if self.wf.status.message != result.message {
                            self.wf.status.message = result.message;
                            self.updated = true;
                        }
                        return;
                    }
                }
                Err(err) => {
                    self.mark_workflow_failed(&format!(
                        "Failed to acquire the synchronization lock. {err}"
                    ));
                    return;
                }
            }
        }

        self.set_global_parameters();

        for node in self.wf.status.nodes.values() {
            self.pre_execution_phases
                .insert(node.id.clone(), node.phase);
        }

        if self.wf.status.phase == WorkflowPhase::Unknown {
            self.mark_workflow_running();
            if let Some(pdb) = self.exec_spec.pod_disruption_budget.clone() {
                if let Err(err) = self
                    .operator
                    .c
                    .api
                    .create_pod_disruption_budget(&self.wf, &pdb)
                    .await
                {
                    self.mark_workflow_failed(&format!(
                        "Unable to create PDB resource for workflow, {} error: {err}",
                        self.wf.name()
                    ));
                    return;
                }
            }
            self.workflow_deadline = self.get_workflow_deadline();
            if let Some(deadline) = self.workflow_deadline {
                let until = (deadline - self.now()).to_std().unwrap_or(Duration::ZERO);
                self.requeue_after(until);
            }
            if let Some(metrics) = self.exec_spec.metrics.clone() {
                self.register_realtime_workflow_metrics(&metrics);
            }
            if self.wf.status.estimated_duration.is_none() {
                self.wf.status.estimated_duration = self
                    .operator
                    .c
                    .estimator
                    .estimate_workflow_duration(&self.wf);
                self.updated |= self.wf.status.estimated_duration.is_some();
            }
        } else {
            self.workflow_deadline = self.get_workflow_deadline();
            match self.reconcile_pods().await {
                Ok(()) => self.fail_suspended_and_pending_nodes_after_deadline_or_shutdown(),
                Err(err) => {
                    error!(workflow = %self.wf.name(), error = %err, "pod reconciliation failed");
                    self.operator.c.events.event(
                        &self.wf,
                        EventType::Warning,
                        "WorkflowTimedOut",
                        "Workflow timed out",
                    );
                    return;
                }
            }
        }

        if self.should_suspend() {
            info!(workflow = %self.wf.name(), "workflow suspended");
            if self.wf.status.phase == WorkflowPhase::Running {
                self.mark_workflow_phase(WorkflowPhase::Suspended, "");
            }
            return;
        }
        if self.wf.status.phase == WorkflowPhase::Suspended {
            self.mark_workflow_running();
        }

        if self.exec_spec.parallelism.is_some() {
            self.active_pods = self.count_active_pods(None);
        }

        let template_context =
            TemplateContext::new(TemplateScope::Local, self.exec_spec.templates.clone());

        match self.create_pvcs().await {
            Ok(()) => {
                if self.wf.status.phase == WorkflowPhase::Pending {
                    self.mark_workflow_running();
                }
            }
            Err(err) if err.is_transient() => {
                self.mark_workflow_phase(
                    WorkflowPhase::Pending,
                    &format!("Waiting for a PVC to be created. {err}"),
                );
                self.requeue();
                return;
            }
            Err(err) => {
                self.mark_workflow_error(&format!("pvc create error: {err}"));
                return;
            }
        }

        let entrypoint = TemplateHolder::direct(self.exec_spec.entrypoint.clone());
        let entry_args = self.exec_spec.arguments.clone();
        let entry_node = match self
            .execute_template(
                self.wf.name().to_string(),
                entrypoint,
                template_context.clone(),
                entry_args,
                ExecuteOpts::default(),
            )
            .await
        {
            Ok(node) => node,
            Err(err) => {
                match &err {
                    OperateError::DeadlineExceeded => {
                        self.operator.c.events.event(
                            &self.wf,
                            EventType::Warning,
                            "WorkflowTimedOut",
                            &format!("error in entry template execution: {err}"),
                        );
                    }
                    OperateError::ParallelismReached => {}
                    _ => {
                        if !err.is_transient()
                            && !self.wf.status.phase.completed()
                            && self.operator.config.bubble_entry_template_err
                        {
                            self.mark_workflow_error(&format!(
                                "error in entry template execution: {err}"
                            ));
                        }
                    }
                }
                return;
            }
        };
        let Some(entry_node) = entry_node else {
            return;
        };
        if !entry_node.fulfilled() {
            return;
        }

        let workflow_phase = workflow_phase_for(entry_node.phase);

        let mut on_exit_node: Option<NodeStatus> = None;
        let shutdown_allows_exit = self
            .exec_spec
            .shutdown
            .map_or(true, |strategy| strategy.should_execute(true));
        if let Some(on_exit) = self.exec_spec.on_exit.clone() {
            if shutdown_allows_exit {
                self.scope
                    .set_global("workflow.status", workflow_phase.to_string());
                self.scope
                    .set_global("workflow.failures", self.failed_nodes_json());
                let exit_node_name = self.exit_node_name();
                info!(workflow = %self.wf.name(), handler = %on_exit, "running exit handler");
                let exit_args = self.exec_spec.arguments.clone();
                match self
                    .execute_template(
                        exit_node_name,
                        TemplateHolder::direct(on_exit),
                        template_context,
                        exit_args,
                        ExecuteOpts {
                            on_exit_template: true,
                            ..Default::default()
                        },
                    )
                    .await
                {
                    Ok(Some(node)) if node.fulfilled() => on_exit_node = Some(node),
                    Ok(_) => return,
                    Err(err) => {
                        error!(error = %err, "error in exit template execution");
                        return;
                    }
                }
            }
        }

        let workflow_message = if entry_node.failed_or_error() && self.exec_spec.shutdown.is_some()
        {
            format!(
                "Stopped with strategy '{}'",
                self.exec_spec.shutdown.expect("shutdown set")
            )
        } else {
            entry_node.message.clone()
        };

        match workflow_phase {
            WorkflowPhase::Succeeded => match &on_exit_node {
                Some(exit_node) if exit_node.failed_or_error() => match exit_node.phase {
                    NodePhase::Failed => self.mark_workflow_failed(&exit_node.message.clone()),
                    _ => self.mark_workflow_error(&exit_node.message.clone()),
                },
                _ => self.mark_workflow_success(),
            },
            WorkflowPhase::Failed => self.mark_workflow_failed(&workflow_message),
            WorkflowPhase::Error => self.mark_workflow_phase(WorkflowPhase::Error, &workflow_message),
            other => {
                // entry node was fulfilled, so only terminal phases reach here
                self.mark_workflow_error(&format!(
                    "unexpected entry node phase {} for workflow phase {other}",
                    entry_node.phase
                ));
            }
        }

        if let Some(metrics) = self.exec_spec.metrics.clone() {
            self.scope
                .set_global("workflow.status", self.wf.status.phase.to_string());
            self.emit_workflow_metrics(&metrics, &entry_node);
        }
    }

    /// Resolves the execution spec, merging a referenced workflow template
    /// into the stored snapshot on first reconciliation. The stored spec is
    /// re-merged only when the shutdown strategy changes; any other live-spec
    /// drift is ignored in reference mode.
    async fn set_exec_workflow(&mut self) -> Result<(), OperateError> {
        if let Some(reference) = self.wf.spec.workflow_template_ref.clone() {
            if self.wf.status.stored_workflow_spec.is_none() {
                let document = if reference.cluster_scope {
                    self.operator
                        .c
                        .templates
                        .get_cluster_workflow_template(&reference.name)
                        .await?
                } else {
                    self.operator
                        .c
                        .templates
                        .get_workflow_template(&self.wf.metadata.namespace, &reference.name)
                        .await?
                };
                let merged = merge_workflow_spec(&document.spec, &self.wf.spec);
                validate_spec(&merged)?;
                self.wf.status.stored_workflow_spec = Some(Box::new(merged));
                self.updated = true;
            } else if self.needs_stored_spec_update() {
                let stored = self
                    .wf
                    .status
                    .stored_workflow_spec
                    .as_mut()
                    .expect("stored spec present");
                stored.shutdown = self.wf.spec.shutdown;
                self.updated = true;
            }
            self.exec_spec = self
                .wf
                .status
                .stored_workflow_spec
                .as_deref()
                .cloned()
                .expect("stored spec present");
            return Ok(());
        }
        validate_spec(&self.wf.spec)?;
        self.exec_spec = self.wf.spec.clone();
        Ok(())
    }

    fn needs_stored_spec_update(&self) -> bool {
        self.wf
            .status
            .stored_workflow_spec
            .as_deref()
            .is_some_and(|stored| stored.shutdown != self.wf.spec.shutdown)
    }

    fn set_global_parameters(&mut self) {
        self.scope
            .set_global("workflow.name", self.wf.name().to_string());
        self.scope
            .set_global("workflow.namespace", self.wf.namespace().to_string());
        self.scope
            .set_global("workflow.uid", self.wf.metadata.uid.clone());
        if let Some(created) = self.wf.metadata.creation_timestamp {
            self.scope
                .set_global("workflow.creationTimestamp", created.to_rfc3339());
        }
        if let Some(priority) = self.exec_spec.priority {
            self.scope
                .set_global("workflow.priority", priority.to_string());
        }
        if let Some(started) = self.wf.status.started_at {
            let duration = (self.now() - started).num_milliseconds() as f64 / 1000.0;
            self.scope
                .set_global("workflow.duration", format!("{duration:.6}"));
        }
        for parameter in &self.exec_spec.arguments.parameters {
            if let Some(value) = &parameter.value {
                self.scope.set_global(
                    format!("workflow.parameters.{}", parameter.name),
                    value.clone(),
                );
            }
        }
        for (key, value) in &self.wf.metadata.annotations {
            self.scope
                .set_global(format!("workflow.annotations.{key}"), value.clone());
        }
        for (key, value) in &self.wf.metadata.labels {
            self.scope
                .set_global(format!("workflow.labels.{key}"), value.clone());
        }
    }

    fn get_workflow_deadline(&self) -> Option<DateTime<Utc>> {
        let seconds = self.exec_spec.active_deadline_seconds?;
        let started = self.wf.status.started_at?;
        Some(started + chrono::Duration::seconds(seconds))
    }

    fn should_suspend(&self) -> bool {
        self.exec_spec.suspend == Some(true)
    }

    pub(crate) fn past_workflow_deadline(&self) -> bool {
        self.workflow_deadline
            .is_some_and(|deadline| self.now() > deadline)
    }

    /// Fails still-pending and suspended nodes once the workflow deadline has
    /// passed or a shutdown strategy is set.
    fn fail_suspended_and_pending_nodes_after_deadline_or_shutdown(&mut self) {
        let shutdown = self.exec_spec.shutdown;
        if shutdown.is_none() && !self.past_workflow_deadline() {
            return;
        }
        let message = match shutdown {
            Some(strategy) => format!("Stopped with strategy '{strategy}'"),
            None => format!(
                "Step exceeded its deadline {}",
                self.workflow_deadline.expect("deadline passed")
            ),
        };
        let to_fail: Vec<String> = self
            .wf
            .status
            .nodes
            .values()
            .filter(|node| {
                node.phase == NodePhase::Pending
                    || (node.node_type == NodeType::Suspend && node.phase == NodePhase::Running)
            })
            .map(|node| node.name.clone())
            .collect();
        for node_name in to_fail {
            if let Err(err) = self.mark_node_phase(&node_name, NodePhase::Failed, Some(&message)) {
                warn!(node = %node_name, error = %err, "failed to fail node after deadline");
            }
        }
    }

    pub(crate) fn count_active_pods(&self, boundary_id: Option<&str>) -> i64 {
        self.wf
            .status
            .nodes
            .values()
            .filter(|node| node.is_active_pod())
            .filter(|node| match boundary_id {
                Some(boundary) => node.boundary_id == boundary,
                None => true,
            })
            .count() as i64
    }

    pub(crate) fn count_active_children(&self, parent: &NodeStatus) -> i64 {
        parent
            .children
            .iter()
            .filter_map(|child_id| self.wf.status.nodes.get(child_id))
            .filter(|child| child.phase.active())
            .count() as i64
    }

    async fn create_pvcs(&mut self) -> Result<(), OperateError> {
        if !matches!(
            self.wf.status.phase,
            WorkflowPhase::Pending | WorkflowPhase::Running
        ) {
            return Ok(());
        }
        if self.exec_spec.volume_claim_templates.len()
            == self.wf.status.persistent_volume_claims.len()
        {
            return Ok(());
        }
        for template in self.exec_spec.volume_claim_templates.clone() {
            if self
                .wf
                .status
                .persistent_volume_claims
                .iter()
                .any(|claim| claim.name == template.name)
            {
                continue;
            }
            let claim = self
                .operator
                .c
                .api
                .create_persistent_volume_claim(&self.wf, &template)
                .await?;
            self.wf.status.persistent_volume_claims.push(claim);
            self.updated = true;
        }
        Ok(())
    }

    /// Deletes the PDB and PVCs once the workflow has completed.
    async fn teardown_completed(&mut self) {
        if !self.wf.status.fulfilled() {
            return;
        }
        if let Err(err) = self
            .operator
            .c
            .api
            .delete_pod_disruption_budget(&self.wf)
            .await
        {
            warn!(error = %err, "failed to delete pod disruption budget");
        }
        let claims = self.wf.status.persistent_volume_claims.clone();
        let mut remaining = Vec::new();
        for claim in claims {
            match self
                .operator
                .c
                .api
                .delete_persistent_volume_claim(&self.wf, &claim)
                .await
            {
                Ok(()) => self.updated = true,
                Err(err) => {
                    warn!(claim = %claim.claim_name, error = %err, "failed to delete PVC");
                    remaining.push(claim);
                }
            }
        }
        self.wf.status.persistent_volume_claims = remaining;
    }

    /// Queues daemoned children for deletion once the workflow is terminal.
    fn shutdown_daemoned_children(&mut self) {
        let daemoned: Vec<String> = self
            .wf
            .status
            .nodes
            .values()
            .filter(|node| node.is_daemoned())
            .map(|node| node.id.clone())
            .collect();
        for node_id in daemoned {
            self.operator.c.pods.queue_for_cleanup(
                self.wf.namespace(),
                &node_id,
                foreman_backends_core::PodCleanupAction::DeletePod,
            );
            if let Some(node) = self.wf.status.nodes.get_mut(&node_id) {
                node.daemoned = None;
            }
            self.updated = true;
        }
    }

    /// Name of the exit-handler node. Prefers the unique form, but bridges to
    /// a legacy display-named child of the entry node when one already exists.
    fn exit_node_name(&self) -> String {
        let unique = format!("{}.onExit", self.wf.name());
        if self.wf.node_by_name(&unique).is_some() {
            return unique;
        }
        if let Some(entry) = self.wf.node_by_name(self.wf.name()) {
            for child_id in &entry.children {
                if let Some(child) = self.wf.status.nodes.get(child_id) {
                    if child.display_name == "onExit" {
                        return child.name.clone();
                    }
                }
            }
        }
        unique
    }

    fn failed_nodes_json(&self) -> String {
        let mut failures: Vec<serde_json::Value> = self
            .wf
            .status
            .nodes
            .values()
            .filter(|node| node.failed_or_error())
            .map(|node| {
                json!({
                    "displayName": node.display_name,
                    "message": node.message,
                    "templateName": node.template_name,
                    "phase": node.phase.to_string(),
                    "podName": node.id,
                    "finishedAt": node.finished_at,
                })
            })
            .collect();
        failures.sort_by_key(|failure| failure["podName"].as_str().unwrap_or("").to_string());
        serde_json::to_string(&failures).unwrap_or_else(|_| "[]".to_string())
    }

    // --- workflow phase marking -------------------------------------------

    pub(crate) fn mark_workflow_phase(&mut self, phase: WorkflowPhase, message: &str) {
        if self.wf.status.phase != phase {
            if self.wf.status.phase.completed() {
                error!(
                    workflow = %self.wf.name(),
                    from = %self.wf.status.phase,
                    to = %phase,
                    "refusing phase change of a fulfilled workflow"
                );
                return;
            }
            info!(workflow = %self.wf.name(), from = %self.wf.status.phase, to = %phase, "workflow phase");
            self.wf.status.phase = phase;
            self.updated = true;
            self.wf
                .metadata
                .labels
                .insert(LABEL_PHASE.to_string(), phase.to_string());
        }
        if self.wf.status.started_at.is_none() && phase != WorkflowPhase::Unknown {
            self.wf.status.started_at = Some(self.now());
            self.updated = true;
        }
        if !message.is_empty() && self.wf.status.message != message {
            self.wf.status.message = message.to_string();
            self.updated = true;
        }
        if phase.completed() {
            if self.wf.status.finished_at.is_none() {
                self.wf.status.finished_at = Some(self.now());
                self.updated = true;
            }
            self.wf
                .metadata
                .labels
                .insert(LABEL_COMPLETED.to_string(), "true".to_string());
            upsert_condition(
                &mut self.wf.status.conditions,
                Condition {
                    condition_type: ConditionType::Completed,
                    status: true,
                    message: None,
                },
            );
            let (event_type, reason) = match phase {
                WorkflowPhase::Succeeded => (EventType::Normal, "WorkflowSucceeded"),
                WorkflowPhase::Failed => (EventType::Warning, "WorkflowFailed"),
                _ => (EventType::Warning, "WorkflowError"),
            };
            let event_message = if message.is_empty() {
                format!("Workflow completed with phase {phase}")
            } else {
                message.to_string()
            };
            self.operator
                .c
                .events
                .event(&self.wf, event_type, reason, &event_message);
        }
    }

    pub(crate) fn mark_workflow_running(&mut self) {
        self.mark_workflow_phase(WorkflowPhase::Running, "");
    }

    pub(crate) fn mark_workflow_success(&mut self) {
        self.mark_workflow_phase(WorkflowPhase::Succeeded, "");
    }

    pub(crate) fn mark_workflow_failed(&mut self, message: &str) {
        self.mark_workflow_phase(WorkflowPhase::Failed, message);
    }

    pub(crate) fn mark_workflow_error(&mut self, message: &str) {
        self.mark_workflow_phase(WorkflowPhase::Error, message);
    }

    // --- node initialization and phase marking ----------------------------

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn initialize_node(
        &mut self,
        node_name: &str,
        node_type: NodeType,
        template_scope: &str,
        holder: Option<&TemplateHolder>,
        boundary_id: &str,
        phase: NodePhase,
        message: &str,
    ) -> NodeStatus {
        let node_id = self.wf.node_id(node_name);
        if let Some(existing) = self.wf.status.nodes.get(&node_id) {
            return existing.clone();
        }
        let boundary_name = self
            .wf
            .status
            .nodes
            .get(boundary_id)
            .map(|node| node.name.clone());
        let node = NodeStatus {
            id: node_id.clone(),
            name: node_name.to_string(),
            display_name: display_name(node_name, boundary_name.as_deref()),
            node_type,
            template_name: holder
                .and_then(TemplateHolder::template_name)
                .map(str::to_string),
            template_ref: holder.and_then(TemplateHolder::template_ref).cloned(),
            template_scope: template_scope.to_string(),
            phase,
            boundary_id: boundary_id.to_string(),
            message: message.to_string(),
            started_at: Some(self.now()),
            estimated_duration: self
                .operator
                .c
                .estimator
                .estimate_node_duration(&self.wf, node_name),
            ..Default::default()
        };
        info!(
            node = %node_name,
            node_id = %node_id,
            node_type = %node_type,
            phase = %phase,
            "node initialized"
        );
        self.wf.status.nodes.insert(node.clone());
        self.updated = true;
        node
    }

    pub(crate) fn mark_node_phase(
        &mut self,
        node_name: &str,
        phase: NodePhase,
        message: Option<&str>,
    ) -> Result<NodeStatus, OperateError> {
        let node_id = self.wf.node_id(node_name);
        let now = self.now();
        let mut completed_node: Option<NodeStatus> = None;
        let node = self
            .wf
            .status
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| {
                OperateError::InvariantViolation(format!("node {node_name} uninitialized"))
            })?;
        if node.phase != phase {
            if node.phase.fulfilled() {
                error!(
                    node = %node_name,
                    from = %node.phase,
                    to = %phase,
                    "refusing phase change of a fulfilled node"
                );
                return Ok(node.clone());
            }
            debug!(node = %node_name, from = %node.phase, to = %phase, "node phase");
            node.phase = phase;
            self.updated = true;
        }
        if let Some(message) = message {
            if node.message != message {
                node.message = message.to_string();
                self.updated = true;
            }
        }
        if node.phase.fulfilled() && node.finished_at.is_none() {
            node.finished_at = Some(now);
            self.updated = true;
            completed_node = Some(node.clone());
        }
        let snapshot = node.clone();
        if let Some(completed) = completed_node {
            self.on_node_complete(&completed);
        }
        Ok(snapshot)
    }

    pub(crate) fn mark_node_error(&mut self, node_name: &str, err: &OperateError) -> NodeStatus {
        self.mark_node_phase(node_name, NodePhase::Error, Some(&err.to_string()))
            .unwrap_or_else(|_| NodeStatus {
                id: self.wf.node_id(node_name),
                name: node_name.to_string(),
                phase: NodePhase::Error,
                message: err.to_string(),
                ..Default::default()
            })
    }

    pub(crate) fn on_node_complete(&self, node: &NodeStatus) {
        let (event_type, reason) = match node.phase {
            NodePhase::Succeeded => (EventType::Normal, "WorkflowNodeSucceeded"),
            NodePhase::Error => (EventType::Warning, "WorkflowNodeError"),
            _ => (EventType::Warning, "WorkflowNodeFailed"),
        };
        let message = if node.message.is_empty() {
            format!("{} node {}", node.phase, node.display_name)
        } else {
            format!("{} node {}: {}", node.phase, node.display_name, node.message)
        };
        self.operator
            .c
            .events
            .event(&self.wf, event_type, reason, &message);
    }

    pub(crate) fn add_child_node(&mut self, parent_name: &str, child_name: &str) {
        let parent_id = self.wf.node_id(parent_name);
        let child_id = self.wf.node_id(child_name);
        let Some(parent) = self.wf.status.nodes.get_mut(&parent_id) else {
            error!(parent = %parent_name, child = %child_name, "parent node uninitialized");
            return;
        };
        if !parent.children.contains(&child_id) {
            parent.children.push(child_id);
            self.updated = true;
        }
    }

    /// Resolves a node to the leaf set downstream chaining connects to.
    pub(crate) fn outbound_nodes(&self, node_id: &str) -> Vec<String> {
        let Some(node) = self.wf.status.nodes.get(node_id) else {
            return Vec::new();
        };
        match node.node_type {
            NodeType::Pod | NodeType::Container | NodeType::Skipped | NodeType::Suspend => {
                vec![node.id.clone()]
            }
            NodeType::StepGroup | NodeType::TaskGroup | NodeType::Retry => {
                if node.children.is_empty() {
                    vec![node.id.clone()]
                } else {
                    node.children
                        .iter()
                        .flat_map(|child| self.outbound_nodes(child))
                        .collect()
                }
            }
            NodeType::Steps | NodeType::Dag => node.outbound_nodes.clone(),
        }
    }

    /// Fallback retry strategy lives on the workflow spec.
    pub(crate) fn retry_strategy(
        &self,
        template: &foreman_model::Template,
    ) -> Option<foreman_model::RetryStrategy> {
        template
            .retry_strategy
            .clone()
            .or_else(|| self.exec_spec.retry_strategy.clone())
    }
}

/// Entry/exit node phase to workflow phase.
pub(crate) fn workflow_phase_for(phase: NodePhase) -> WorkflowPhase {
    match phase {
        NodePhase::Pending => WorkflowPhase::Pending,
        NodePhase::Running => WorkflowPhase::Running,
        NodePhase::Succeeded | NodePhase::Skipped | NodePhase::Omitted => WorkflowPhase::Succeeded,
        NodePhase::Failed => WorkflowPhase::Failed,
        NodePhase::Error => WorkflowPhase::Error,
    }
}

fn validate_spec(spec: &WorkflowSpec) -> Result<(), OperateError> {
    if spec.entrypoint.is_empty() {
        return Err(OperateError::Validation("entrypoint is not set".to_string()));
    }
    if spec.templates.is_empty() {
        return Err(OperateError::Validation("no templates defined".to_string()));
    }
    let mut seen = std::collections::BTreeSet::new();
    for template in &spec.templates {
        if template.name.is_empty() {
            return Err(OperateError::Validation("unnamed template".to_string()));
        }
        if !seen.insert(template.name.as_str()) {
            return Err(OperateError::Validation(format!(
                "duplicate template name {}",
                template.name
            )));
        }
    }
    if spec.template(&spec.entrypoint).is_none() {
        return Err(OperateError::Validation(format!(
            "entrypoint template {} not found",
            spec.entrypoint
        )));
    }
    Ok(())
}
