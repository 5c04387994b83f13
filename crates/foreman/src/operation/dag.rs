//! DAG execution: dependency-ordered tasks.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use foreman_model::{
    item_child_name, DagSpec, DagTask, NodePhase, NodeStatus, NodeType, Template, TemplateBody,
    TemplateHolder,
};

use crate::conditions::eval_when;
use crate::error::OperateError;
use crate::items::{expand_items, process_item};
use crate::scope::Scope;
use crate::template::TemplateContext;

use super::steps::continue_on_tolerates;
use super::{ExecuteOpts, WorkflowOperation};

/// Whether a fulfilled dependency lets its dependents proceed.
fn dependency_satisfied(dependency: &DagTask, node: &NodeStatus) -> bool {
    match node.phase {
        NodePhase::Succeeded | NodePhase::Skipped | NodePhase::Omitted => true,
        NodePhase::Failed | NodePhase::Error => {
            continue_on_tolerates(dependency.continue_on.as_ref(), node.phase)
        }
        _ => false,
    }
}

fn target_task_names(dag: &DagSpec) -> Vec<String> {
    if let Some(target) = &dag.target {
        return target
            .split([' ', ','])
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
    }
    // default targets: tasks nothing else depends on
    let depended_on: BTreeSet<&str> = dag
        .tasks
        .iter()
        .flat_map(|task| task.dependencies.iter().map(String::as_str))
        .collect();
    dag.tasks
        .iter()
        .filter(|task| !depended_on.contains(task.name.as_str()))
        .map(|task| task.name.clone())
        .collect()
}

enum TaskReadiness {
    Ready,
    Blocked,
    /// A dependency failed in a way the task does not tolerate; the task can
    /// never run.
    Unreachable(String),
}

impl<'a> WorkflowOperation<'a> {
    pub(crate) async fn execute_dag(
        &mut self,
        node_name: &str,
        context: TemplateContext,
        template_scope: &str,
        template: &Template,
        holder: &TemplateHolder,
        opts: &ExecuteOpts,
    ) -> Result<NodeStatus, OperateError> {
        let TemplateBody::Dag(dag) = &template.body else {
            return Err(OperateError::InvariantViolation(format!(
                "template {} is not a dag template",
                template.name
            )));
        };
        let dag = dag.clone();

        if self.wf.node_by_name(node_name).is_none() {
            self.initialize_executable_node(
                node_name,
                NodeType::Dag,
                template_scope,
                template,
                holder,
                &opts.boundary_id,
                NodePhase::Running,
                "",
            );
        }
        let dag_node_id = self.wf.node_id(node_name);
        let mut scope = self.scope.clone();

        // publish outputs of already-completed tasks before scheduling more
        for task in &dag.tasks {
            let task_node_name = format!("{node_name}.{}", task.name);
            let is_expanded = !task.with_items.is_empty()
                || task.with_param.is_some()
                || task.with_sequence.is_some();
            let prefix = format!("tasks.{}", task.name);
            if is_expanded {
                let item_prefix = format!("{task_node_name}(");
                let children: Vec<NodeStatus> = self
                    .wf
                    .status
                    .nodes
                    .values()
                    .filter(|node| node.name.starts_with(&item_prefix))
                    .filter(|node| node.fulfilled())
                    .cloned()
                    .collect();
                if !children.is_empty() {
                    self.aggregate_child_outputs_to_scope(&prefix, children, &mut scope)?;
                }
            } else if let Some(node) = self.wf.node_by_name(&task_node_name).cloned() {
                if node.fulfilled() {
                    self.add_node_outputs_to_scope(&prefix, &node, &mut scope);
                }
            }
        }

        for task in &dag.tasks {
            let task_node_name = format!("{node_name}.{}", task.name);
            if self
                .wf
                .node_by_name(&task_node_name)
                .is_some_and(NodeStatus::fulfilled)
            {
                continue;
            }
            match self.task_readiness(&dag, task, node_name) {
                TaskReadiness::Blocked => continue,
                TaskReadiness::Unreachable(reason) => {
                    if self.wf.node_by_name(&task_node_name).is_none() {
                        self.initialize_node(
                            &task_node_name,
                            NodeType::Skipped,
                            template_scope,
                            None,
                            &dag_node_id,
                            NodePhase::Omitted,
                            &reason,
                        );
                        self.connect_task_node(node_name, task, &task_node_name);
                    }
                    continue;
                }
                TaskReadiness::Ready => {}
            }
            self.execute_dag_task(
                node_name,
                &dag_node_id,
                task,
                &context,
                template_scope,
                &mut scope,
                opts,
            )
            .await?;
        }

        // completion: every task node fulfilled (scheduled or omitted)
        let mut failure: Option<(NodePhase, String)> = None;
        for task in &dag.tasks {
            let task_node_name = format!("{node_name}.{}", task.name);
            let Some(task_node) = self.wf.node_by_name(&task_node_name) else {
                return Ok(self
                    .wf
                    .node_by_name(node_name)
                    .cloned()
                    .expect("dag node initialized"));
            };
            if !task_node.fulfilled() {
                return Ok(self
                    .wf
                    .node_by_name(node_name)
                    .cloned()
                    .expect("dag node initialized"));
            }
            if task_node.failed_or_error()
                && !continue_on_tolerates(task.continue_on.as_ref(), task_node.phase)
                && failure.is_none()
            {
                failure = Some((
                    task_node.phase,
                    format!(
                        "task '{}' failed: {}",
                        task_node.display_name, task_node.message
                    ),
                ));
            }
        }

        if let Some((phase, message)) = failure {
            return self.mark_node_phase(node_name, phase, Some(&message));
        }

        let outputs = self.template_outputs_from_scope(&template.outputs, &scope)?;
        let outbound: Vec<String> = target_task_names(&dag)
            .iter()
            .flat_map(|target| {
                let target_id = self.wf.node_id(&format!("{node_name}.{target}"));
                self.outbound_nodes(&target_id)
            })
            .collect();
        if let Some(node) = self.wf.status.nodes.get_mut(&dag_node_id) {
            if let Some(outputs) = outputs {
                node.outputs = Some(outputs);
            }
            node.outbound_nodes = outbound;
            self.updated = true;
        }
        self.mark_node_phase(node_name, NodePhase::Succeeded, None)
    }

    fn task_readiness(&self, dag: &DagSpec, task: &DagTask, node_name: &str) -> TaskReadiness {
        for dependency_name in &task.dependencies {
            let Some(dependency) = dag
                .tasks
                .iter()
                .find(|candidate| candidate.name == *dependency_name)
            else {
                return TaskReadiness::Unreachable(format!(
                    "dependency '{dependency_name}' does not exist"
                ));
            };
            let dependency_node_name = format!("{node_name}.{dependency_name}");
            let Some(dependency_node) = self.wf.node_by_name(&dependency_node_name) else {
                return TaskReadiness::Blocked;
            };
            if !dependency_node.fulfilled() {
                return TaskReadiness::Blocked;
            }
            if !dependency_satisfied(dependency, dependency_node) {
                return TaskReadiness::Unreachable(format!(
                    "omitted: depends on '{dependency_name}' which {}",
                    dependency_node.phase
                ));
            }
        }
        TaskReadiness::Ready
    }

    /// Wires the task node under its dependencies, or under the DAG node for
    /// roots.
    fn connect_task_node(&mut self, node_name: &str, task: &DagTask, task_node_name: &str) {
        if task.dependencies.is_empty() {
            self.add_child_node(node_name, task_node_name);
            return;
        }
        for dependency_name in &task.dependencies {
            let dependency_id = self.wf.node_id(&format!("{node_name}.{dependency_name}"));
            let outbound_names: Vec<String> = self
                .outbound_nodes(&dependency_id)
                .into_iter()
                .filter_map(|id| self.wf.status.nodes.get(&id).map(|n| n.name.clone()))
                .collect();
            for outbound in outbound_names {
                self.add_child_node(&outbound, task_node_name);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_dag_task(
        &mut self,
        node_name: &str,
        dag_node_id: &str,
        task: &DagTask,
        context: &TemplateContext,
        template_scope: &str,
        scope: &mut Scope,
        opts: &ExecuteOpts,
    ) -> Result<(), OperateError> {
        let task_node_name = format!("{node_name}.{}", task.name);

        let serialized = serde_json::to_string(task)?;
        let substituted = scope.substitute(&serialized, true)?;
        let task: DagTask = serde_json::from_str(&substituted)?;

        if let Some(when) = &task.when {
            match eval_when(when) {
                Ok(true) => {}
                Ok(false) => {
                    if self.wf.node_by_name(&task_node_name).is_none() {
                        self.initialize_node(
                            &task_node_name,
                            NodeType::Skipped,
                            template_scope,
                            None,
                            dag_node_id,
                            NodePhase::Skipped,
                            &format!("when '{when}' evaluated false"),
                        );
                        self.connect_task_node(node_name, &task, &task_node_name);
                    }
                    return Ok(());
                }
                Err(err) => {
                    if self.wf.node_by_name(&task_node_name).is_none() {
                        self.initialize_node(
                            &task_node_name,
                            NodeType::Skipped,
                            template_scope,
                            None,
                            dag_node_id,
                            NodePhase::Error,
                            &err.to_string(),
                        );
                        self.connect_task_node(node_name, &task, &task_node_name);
                    }
                    return Ok(());
                }
            }
        }

        let expanded = expand_items(
            &task.with_items,
            task.with_param.as_deref(),
            task.with_sequence.as_ref(),
        )?;
        let child_opts = ExecuteOpts {
            boundary_id: dag_node_id.to_string(),
            on_exit_template: opts.on_exit_template,
            ..Default::default()
        };

        match expanded {
            None => {
                let outcome = self
                    .execute_template(
                        task_node_name.clone(),
                        TemplateHolder::Task(task.clone()),
                        context.clone(),
                        task.arguments.clone(),
                        child_opts,
                    )
                    .await;
                self.handle_task_outcome(outcome, node_name, &task, &task_node_name)?;
            }
            Some(items) => {
                // expanded tasks hang off a TaskGroup parent
                if self.wf.node_by_name(&task_node_name).is_none() {
                    self.initialize_node(
                        &task_node_name,
                        NodeType::TaskGroup,
                        template_scope,
                        None,
                        dag_node_id,
                        NodePhase::Running,
                        "",
                    );
                    self.connect_task_node(node_name, &task, &task_node_name);
                }
                let mut all_fulfilled = true;
                let mut failure: Option<(NodePhase, String)> = None;
                for (index, item) in items.iter().enumerate() {
                    let mut bound = process_item(&task, item)?;
                    bound.with_items.clear();
                    bound.with_param = None;
                    bound.with_sequence = None;
                    let child_node_name = format!(
                        "{node_name}.{}",
                        item_child_name(&task.name, index, &item.description())
                    );
                    let outcome = self
                        .execute_template(
                            child_node_name.clone(),
                            TemplateHolder::Task(bound.clone()),
                            context.clone(),
                            bound.arguments.clone(),
                            ExecuteOpts {
                                boundary_id: dag_node_id.to_string(),
                                on_exit_template: opts.on_exit_template,
                                ..Default::default()
                            },
                        )
                        .await;
                    match outcome {
                        Ok(child) => {
                            self.add_child_node(&task_node_name, &child_node_name);
                            match child {
                                Some(child) if child.fulfilled() => {
                                    if child.failed_or_error()
                                        && !continue_on_tolerates(
                                            task.continue_on.as_ref(),
                                            child.phase,
                                        )
                                        && failure.is_none()
                                    {
                                        failure = Some((
                                            child.phase,
                                            format!(
                                                "child '{}' failed: {}",
                                                child.display_name, child.message
                                            ),
                                        ));
                                    }
                                }
                                _ => all_fulfilled = false,
                            }
                        }
                        Err(OperateError::DeadlineExceeded) => {
                            return Err(OperateError::DeadlineExceeded)
                        }
                        Err(OperateError::ParallelismReached) => {
                            all_fulfilled = false;
                            break;
                        }
                        Err(OperateError::Timeout(_)) => {
                            self.add_child_node(&task_node_name, &child_node_name);
                        }
                        Err(err) => {
                            warn!(task = %task.name, error = %err, "task item execution failed");
                            self.add_child_node(&task_node_name, &child_node_name);
                            self.mark_node_phase(
                                &task_node_name,
                                NodePhase::Error,
                                Some(&err.to_string()),
                            )?;
                            return Ok(());
                        }
                    }
                }
                if all_fulfilled {
                    match failure {
                        Some((phase, message)) => {
                            self.mark_node_phase(&task_node_name, phase, Some(&message))?;
                        }
                        None => {
                            self.mark_node_phase(&task_node_name, NodePhase::Succeeded, None)?;
                        }
                    }
                } else {
                    debug!(task = %task.name, "task group still running");
                }
            }
        }
        Ok(())
    }

    fn handle_task_outcome(
        &mut self,
        outcome: Result<Option<NodeStatus>, OperateError>,
        node_name: &str,
        task: &DagTask,
        task_node_name: &str,
    ) -> Result<(), OperateError> {
        match outcome {
            Ok(_) => {
                self.connect_task_node(node_name, task, task_node_name);
                Ok(())
            }
            Err(OperateError::DeadlineExceeded) => Err(OperateError::DeadlineExceeded),
            Err(OperateError::ParallelismReached) => Ok(()),
            Err(OperateError::Timeout(_)) => {
                self.connect_task_node(node_name, task, task_node_name);
                Ok(())
            }
            Err(err) => {
                warn!(task = %task.name, error = %err, "task execution failed");
                if self.wf.node_by_name(task_node_name).is_some() {
                    self.mark_node_phase(task_node_name, NodePhase::Error, Some(&err.to_string()))?;
                    self.connect_task_node(node_name, task, task_node_name);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, dependencies: &[&str]) -> DagTask {
        DagTask {
            name: name.to_string(),
            template: Some("echo".to_string()),
            dependencies: dependencies.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn default_targets_are_the_undepended_tasks() {
        let dag = DagSpec {
            target: None,
            fail_fast: None,
            tasks: vec![task("a", &[]), task("b", &["a"]), task("c", &["a"])],
        };
        assert_eq!(target_task_names(&dag), vec!["b", "c"]);
    }

    #[test]
    fn explicit_target_list_is_split() {
        let dag = DagSpec {
            target: Some("b c".to_string()),
            fail_fast: None,
            tasks: vec![task("a", &[]), task("b", &["a"]), task("c", &["a"])],
        };
        assert_eq!(target_task_names(&dag), vec!["b", "c"]);
    }

    #[test]
    fn failed_dependency_blocks_unless_tolerated() {
        let dependency = task("a", &[]);
        let failed_node = NodeStatus {
            phase: NodePhase::Failed,
            ..Default::default()
        };
        assert!(!dependency_satisfied(&dependency, &failed_node));

        let mut tolerant = dependency.clone();
        tolerant.continue_on = Some(foreman_model::ContinueOn {
            failed: Some(true),
            error: None,
        });
        assert!(dependency_satisfied(&tolerant, &failed_node));
    }
}
