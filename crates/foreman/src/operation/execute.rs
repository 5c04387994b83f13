//! The template execution pipeline.
//!
//! Resolve, substitute, memoize, gate (deadline, timeout, parallelism,
//! locks), wrap in retries, dispatch by template type, and swap back to the
//! retry parent.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, warn};

use foreman_backends_core::{PodCreateOptions, PodManager, SyncManager};
use foreman_model::{
    retry_child_name, Arguments, NodePhase, NodeStatus, NodeType, Template, TemplateHolder,
    TemplateType,
};

use crate::config::parse_duration;
use crate::error::OperateError;
use crate::scope::substitute_params;
use crate::template::{merge_template_defaults, process_args, TemplateContext};

use super::{ExecuteOpts, WorkflowOperation};

pub(crate) fn node_type_for(template: &Template) -> NodeType {
    match template.template_type() {
        TemplateType::Container
        | TemplateType::ContainerSet
        | TemplateType::Script
        | TemplateType::Resource
        | TemplateType::Data => NodeType::Pod,
        TemplateType::Steps => NodeType::Steps,
        TemplateType::Dag => NodeType::Dag,
        TemplateType::Suspend => NodeType::Suspend,
    }
}

/// Substitutes a map of local parameters through a template's serialized
/// form, leaving unknown references untouched.
fn substitute_template_locals(
    template: &Template,
    locals: &BTreeMap<String, String>,
) -> Result<Template, OperateError> {
    let serialized = serde_json::to_string(template)?;
    let substituted = substitute_params(&serialized, true, |key| locals.get(key).cloned())?;
    Ok(serde_json::from_str(&substituted)?)
}

impl<'a> WorkflowOperation<'a> {
    /// Executes a template at `node_name`, producing the node's latest
    /// snapshot. `None` only when execution could not produce a node at all.
    pub(crate) fn execute_template<'s>(
        &'s mut self,
        node_name: String,
        holder: TemplateHolder,
        context: TemplateContext,
        args: Arguments,
        opts: ExecuteOpts,
    ) -> Pin<Box<dyn Future<Output = Result<Option<NodeStatus>, OperateError>> + Send + 's>> {
        Box::pin(self.execute_template_inner(node_name, holder, context, args, opts))
    }

    async fn execute_template_inner(
        &mut self,
        node_name: String,
        holder: TemplateHolder,
        context: TemplateContext,
        args: Arguments,
        opts: ExecuteOpts,
    ) -> Result<Option<NodeStatus>, OperateError> {
        debug!(node = %node_name, boundary = %opts.boundary_id, "evaluating node");
        let template_scope = context.scope().to_string();

        let store = Arc::clone(&self.operator.c.templates);
        let namespace = self.wf.metadata.namespace.clone();
        let mut stored_templates = std::mem::take(&mut self.wf.status.stored_templates);
        let resolved = context
            .resolve(&holder, store.as_ref(), &namespace, &mut stored_templates)
            .await;
        self.wf.status.stored_templates = stored_templates;
        let (new_context, mut template, newly_stored) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                self.initialize_node_or_mark_error(&node_name, &template_scope, &holder, &opts, &err);
                return Err(err);
            }
        };
        if newly_stored {
            self.updated = true;
        }

        let mut local_params = BTreeMap::new();
        if template.is_pod_type() && self.retry_strategy(&template).is_none() {
            local_params.insert("pod.name".to_string(), self.wf.node_id(&node_name));
        }

        if let Some(defaults) = self.exec_spec.template_defaults.clone() {
            merge_template_defaults(&mut template, &defaults);
        }

        let mut processed = match process_args(&template, &args, &self.scope, &local_params) {
            Ok(processed) => processed,
            Err(err) => {
                self.initialize_node_or_mark_error(&node_name, &template_scope, &holder, &opts, &err);
                return Err(err);
            }
        };

        let node_id = self.wf.node_id(&node_name);
        let mut node = self.wf.status.nodes.get(&node_id).cloned();

        if node.is_none() && processed.memoize.is_some() {
            match self
                .consult_memoization_cache(&node_name, &template_scope, &processed, &holder, &opts)
                .await
            {
                Ok(initialized) => node = Some(initialized),
                Err(err) => {
                    self.initialize_node_or_mark_error(
                        &node_name,
                        &template_scope,
                        &holder,
                        &opts,
                        &err,
                    );
                    return Err(err);
                }
            }
        }

        if let Some(existing) = &node {
            if existing.fulfilled() {
                if let Some(sync) = &processed.synchronization {
                    let sync_manager = Arc::clone(&self.operator.c.sync);
                    sync_manager.release(&mut self.wf, &existing.id, sync);
                }
                debug!(node = %node_name, "node already completed");
                if processed.metrics.is_some()
                    && self
                        .pre_execution_phases
                        .get(&existing.id)
                        .is_some_and(|phase| !phase.fulfilled())
                {
                    // completed during this reconciliation's pod assessment
                    self.emit_node_completion_metrics(&processed, existing);
                }
                return Ok(Some(existing.clone()));
            }
        }

        if self.now() > self.deadline || self.cancel.is_cancelled() {
            warn!(node = %node_name, "operation deadline exceeded");
            self.requeue();
            return Err(OperateError::DeadlineExceeded);
        }

        if let (Some(existing), Some(timeout_raw)) = (&node, &processed.timeout) {
            let timeout = parse_duration(timeout_raw)?;
            if existing.phase == NodePhase::Pending {
                if let Some(started) = existing.started_at {
                    let deadline =
                        started + chrono::Duration::from_std(timeout).unwrap_or_default();
                    if self.now() > deadline {
                        warn!(node = %node_name, timeout = %timeout_raw, "template exceeded its deadline");
                        let message = format!("Step exceeded its deadline {timeout_raw}");
                        self.mark_node_phase(&node_name, NodePhase::Failed, Some(&message))?;
                        return Err(OperateError::Timeout(message));
                    }
                }
            }
        }

        self.check_parallelism(&processed, node.as_ref(), &opts.boundary_id)?;

        if let Some(sync) = processed.synchronization.clone() {
            let sync_manager = Arc::clone(&self.operator.c.sync);
            let acquire = sync_manager
                .try_acquire(&mut self.wf, &node_id, &sync)
                .await;
            let acquire = match acquire {
                Ok(acquire) => acquire,
                Err(err) => {
                    let err = OperateError::from(err);
                    self.initialize_node_or_mark_error(
                        &node_name,
                        &template_scope,
                        &holder,
                        &opts,
                        &err,
                    );
                    return Err(err);
                }
            };
            self.updated |= acquire.status_dirty;
            if !acquire.acquired {
                if node.is_none() {
                    self.initialize_executable_node(
                        &node_name,
                        node_type_for(&processed),
                        &template_scope,
                        &processed,
                        &holder,
                        &opts.boundary_id,
                        NodePhase::Pending,
                        &acquire.message,
                    );
                }
                let lock_name = sync.lock_name(&namespace);
                return Ok(Some(self.mark_node_waiting_for_lock(&node_name, &lock_name)?));
            }
            info!(node = %node_name, "node acquired synchronization lock");
            if node.is_some() {
                self.mark_node_waiting_for_lock(&node_name, "")?;
            }
        }

        // Retry wrap: the named node becomes a Retry parent and execution
        // descends into a freshly named child.
        let mut exec_node_name = node_name.clone();
        let mut exec_opts = opts.clone();
        let retry_strategy = self.retry_strategy(&processed);
        let retry_node_name = retry_strategy.is_some().then(|| node_name.clone());
        if let Some(strategy) = &retry_strategy {
            if node.is_none() {
                debug!(node = %node_name, "injecting retry node");
                self.initialize_executable_node(
                    &node_name,
                    NodeType::Retry,
                    &template_scope,
                    &processed,
                    &holder,
                    &opts.boundary_id,
                    NodePhase::Running,
                    "",
                );
            }
            let (retry_parent, proceed) = match self.process_node_retries(
                &node_name,
                strategy,
                &mut exec_opts,
            ) {
                Ok(outcome) => outcome,
                Err(err) => return Err(self.mark_node_error_and_return(&node_name, err)),
            };
            if !proceed {
                // waiting out a retry backoff
                return Ok(Some(retry_parent));
            }
            if retry_parent.fulfilled() {
                if processed.metrics.is_some()
                    && self
                        .pre_execution_phases
                        .get(&retry_parent.id)
                        .map_or(true, |phase| !phase.fulfilled())
                {
                    self.emit_node_completion_metrics(&processed, &retry_parent);
                }
                if let Some(sync) = &processed.synchronization {
                    let sync_manager = Arc::clone(&self.operator.c.sync);
                    sync_manager.release(&mut self.wf, &retry_parent.id, sync);
                }
                return Ok(Some(retry_parent));
            }
            let last_child = self.wf.status.nodes.child_at(&retry_parent, -1).cloned();
            match last_child {
                Some(child) if !child.fulfilled() => {
                    exec_node_name = child.name.clone();
                }
                last_child => {
                    let attempt = retry_parent.children.len();
                    exec_node_name = retry_child_name(&node_name, attempt);
                    self.add_child_node(&node_name, &exec_node_name);
                    if last_child.is_some() && strategy.retry_on_different_host == Some(true) {
                        exec_opts.avoid_hosts = self.failed_attempt_hosts(&retry_parent);
                    }
                    let mut retry_locals = BTreeMap::new();
                    if processed.is_pod_type() {
                        retry_locals
                            .insert("pod.name".to_string(), self.wf.node_id(&exec_node_name));
                    }
                    retry_locals.insert("retries".to_string(), attempt.to_string());
                    processed = substitute_template_locals(&processed, &retry_locals)?;
                }
            }
        }

        let dispatched = match processed.template_type() {
            TemplateType::Container
            | TemplateType::Script
            | TemplateType::Resource
            | TemplateType::Data => {
                self.execute_pod_template(&exec_node_name, &template_scope, &processed, &holder, &exec_opts)
                    .await
            }
            TemplateType::ContainerSet => {
                self.execute_container_set(&exec_node_name, &template_scope, &processed, &holder, &exec_opts)
                    .await
            }
            TemplateType::Steps => {
                self.execute_steps(
                    &exec_node_name,
                    new_context.clone(),
                    &template_scope,
                    &processed,
                    &holder,
                    &exec_opts,
                )
                .await
            }
            TemplateType::Dag => {
                self.execute_dag(
                    &exec_node_name,
                    new_context.clone(),
                    &template_scope,
                    &processed,
                    &holder,
                    &exec_opts,
                )
                .await
            }
            TemplateType::Suspend => {
                self.execute_suspend(&exec_node_name, &template_scope, &processed, &holder, &exec_opts)
            }
        };

        let mut result_node = match dispatched {
            Ok(node) => node,
            Err(OperateError::DeadlineExceeded) => return Err(OperateError::DeadlineExceeded),
            Err(OperateError::ParallelismReached) => return Err(OperateError::ParallelismReached),
            Err(err) if err.is_transient() => {
                // requeue and hold the node at Pending
                warn!(node = %exec_node_name, error = %err, "transient failure, requeueing");
                self.requeue();
                let pending = self.initialize_node_or_mark_pending(
                    &exec_node_name,
                    &template_scope,
                    &processed,
                    &holder,
                    &exec_opts,
                    &err,
                );
                return Ok(Some(pending));
            }
            Err(err) => {
                let marked = self.mark_node_error(&exec_node_name, &err);
                if let Some(sync) = &processed.synchronization {
                    let sync_manager = Arc::clone(&self.operator.c.sync);
                    sync_manager.release(&mut self.wf, &marked.id, sync);
                }
                // only retry policies that cover errors keep going
                let retries_errors = retry_strategy.as_ref().is_some_and(|strategy| {
                    matches!(
                        strategy.retry_policy.unwrap_or_default(),
                        foreman_model::RetryPolicy::Always
                            | foreman_model::RetryPolicy::OnError
                            | foreman_model::RetryPolicy::OnTransientError
                    )
                });
                if !retries_errors {
                    return Err(err);
                }
                marked
            }
        };

        if result_node.fulfilled() {
            if let Some(sync) = &processed.synchronization {
                let sync_manager = Arc::clone(&self.operator.c.sync);
                sync_manager.release(&mut self.wf, &result_node.id, sync);
            }
        }

        if processed.metrics.is_some() {
            if !self.pre_execution_phases.contains_key(&result_node.id) {
                self.emit_node_realtime_metrics(&processed, &result_node);
            }
            if self
                .pre_execution_phases
                .get(&result_node.id)
                .map_or(true, |phase| !phase.fulfilled())
                && result_node.fulfilled()
            {
                self.emit_node_completion_metrics(&processed, &result_node);
            }
        }

        if let Some(fresh) = self.wf.status.nodes.get(&result_node.id) {
            result_node = fresh.clone();
        }

        if let Some(retry_name) = retry_node_name {
            let retry_node = self
                .wf
                .node_by_name(&retry_name)
                .cloned()
                .ok_or_else(|| {
                    OperateError::InvariantViolation(format!("retry node {retry_name} missing"))
                })?;
            if !retry_node.fulfilled() && result_node.fulfilled() {
                // the child just finished; re-enter to settle the parent
                let settled = self
                    .execute_template(retry_name, holder, context, args, opts)
                    .await?;
                return Ok(settled);
            }
            return Ok(Some(retry_node));
        }

        Ok(Some(result_node))
    }

    /// Initializes the node with inputs captured from the processed template.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn initialize_executable_node(
        &mut self,
        node_name: &str,
        node_type: NodeType,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        boundary_id: &str,
        phase: NodePhase,
        message: &str,
    ) -> NodeStatus {
        let node_id = self.wf.node_id(node_name);
        let existed = self.wf.status.nodes.contains(&node_id);
        let mut node = self.initialize_node(
            node_name,
            node_type,
            template_scope,
            Some(holder),
            boundary_id,
            phase,
            message,
        );
        if !existed && !template.inputs.is_empty() {
            node.inputs = Some(template.inputs.clone());
            self.wf.status.nodes.insert(node.clone());
        }
        node
    }

    fn initialize_node_or_mark_error(
        &mut self,
        node_name: &str,
        template_scope: &str,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
        err: &OperateError,
    ) -> NodeStatus {
        if self.wf.node_by_name(node_name).is_some() {
            self.mark_node_error(node_name, err)
        } else {
            self.initialize_node(
                node_name,
                NodeType::Skipped,
                template_scope,
                Some(holder),
                &opts.boundary_id,
                NodePhase::Error,
                &err.to_string(),
            )
        }
    }

    fn initialize_node_or_mark_pending(
        &mut self,
        node_name: &str,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
        err: &OperateError,
    ) -> NodeStatus {
        if self.wf.node_by_name(node_name).is_none() {
            return self.initialize_executable_node(
                node_name,
                node_type_for(template),
                template_scope,
                template,
                holder,
                &opts.boundary_id,
                NodePhase::Pending,
                &err.to_string(),
            );
        }
        self.mark_node_phase(node_name, NodePhase::Pending, Some(&err.to_string()))
            .unwrap_or_else(|_| NodeStatus::default())
    }

    fn mark_node_error_and_return(&mut self, node_name: &str, err: OperateError) -> OperateError {
        self.mark_node_error(node_name, &err);
        err
    }

    pub(crate) fn mark_node_waiting_for_lock(
        &mut self,
        node_name: &str,
        lock_name: &str,
    ) -> Result<NodeStatus, OperateError> {
        let node_id = self.wf.node_id(node_name);
        let node = self.wf.status.nodes.get_mut(&node_id).ok_or_else(|| {
            OperateError::InvariantViolation(format!("node {node_name} uninitialized"))
        })?;
        if lock_name.is_empty() {
            node.synchronization_status = None;
            node.message = String::new();
        } else {
            node.synchronization_status = Some(foreman_model::NodeSynchronizationStatus {
                waiting: lock_name.to_string(),
            });
        }
        self.updated = true;
        Ok(node.clone())
    }

    fn failed_attempt_hosts(&self, retry_parent: &NodeStatus) -> Vec<String> {
        retry_parent
            .children
            .iter()
            .filter_map(|child_id| self.wf.status.nodes.get(child_id))
            .filter(|child| child.failed_or_error())
            .filter_map(|child| child.host_node_name.clone())
            .collect()
    }

    /// Container / Script / Resource / Data: ask the PodManager for a pod.
    async fn execute_pod_template(
        &mut self,
        node_name: &str,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
    ) -> Result<NodeStatus, OperateError> {
        let mut newly_created = false;
        if let Some(node) = self.wf.node_by_name(node_name) {
            if !node.pending() {
                return Ok(node.clone());
            }
        } else {
            self.initialize_executable_node(
                node_name,
                NodeType::Pod,
                template_scope,
                template,
                holder,
                &opts.boundary_id,
                NodePhase::Pending,
                "",
            );
            newly_created = true;
        }
        let create_opts = PodCreateOptions {
            on_exit_pod: opts.on_exit_template,
            execution_deadline: match (opts.execution_deadline, self.workflow_deadline) {
                (Some(execution), Some(workflow)) => Some(execution.min(workflow)),
                (execution, workflow) => execution.or(workflow),
            },
            avoid_hosts: opts.avoid_hosts.clone(),
        };
        let pods = Arc::clone(&self.operator.c.pods);
        pods.create(&self.wf, node_name, template, &create_opts)
            .await?;
        if newly_created {
            self.active_pods += 1;
        }
        debug!(node = %node_name, template = %template.name, "pod requested");
        Ok(self
            .wf
            .node_by_name(node_name)
            .cloned()
            .expect("pod node initialized above"))
    }

    /// ContainerSet: one pod plus a Container sub-node per member.
    async fn execute_container_set(
        &mut self,
        node_name: &str,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
    ) -> Result<NodeStatus, OperateError> {
        let node = self
            .execute_pod_template(node_name, template_scope, template, holder, opts)
            .await?;
        if let foreman_model::TemplateBody::ContainerSet(set) = &template.body {
            for container in &set.containers {
                let child_name = format!("{node_name}.{}", container.name);
                if self.wf.node_by_name(&child_name).is_none() {
                    self.initialize_node(
                        &child_name,
                        NodeType::Container,
                        template_scope,
                        Some(holder),
                        &node.id,
                        NodePhase::Pending,
                        "",
                    );
                    self.add_child_node(node_name, &child_name);
                }
            }
        }
        Ok(self
            .wf
            .node_by_name(node_name)
            .cloned()
            .expect("container set node initialized"))
    }
}
