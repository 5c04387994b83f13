//! Pod assessment: observed pod snapshots drive node phase transitions.
//!
//! Assessment fans out across pods with bounded concurrency; all node-graph
//! writes serialize through a single workflow-scoped read-write lock. The
//! same pod snapshot applied twice yields the same transitions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info, warn};

use foreman_backends_core::{Cache, CacheFactory, Clock, MetricsSink, PodCleanupAction, PodManager};
use foreman_model::{
    node_id, upsert_condition, Condition, ConditionType, ContainerState, NodePhase, NodeStatus,
    NodeType, Nodes, Outputs, PodGC, PodPhase, PodSnapshot, Template, ANNOTATION_NODE_NAME,
    ANNOTATION_OUTPUTS, ANNOTATION_TEMPLATE, INIT_CONTAINER_NAME, LABEL_COMPLETED,
    MAIN_CONTAINER_NAME, POD_REASON_UNSCHEDULABLE, SIDECAR_INTERNAL_EXIT_CODE,
    WAIT_CONTAINER_NAME,
};

use crate::error::OperateError;

use super::WorkflowOperation;

struct SeenPod {
    host: Option<String>,
}

struct AssessShared {
    workflow_name: String,
    namespace: String,
    nodes: RwLock<Nodes>,
    clock: Arc<dyn Clock>,
    caches: Arc<dyn CacheFactory>,
    pods: Arc<dyn PodManager>,
    pod_gc: Option<PodGC>,
    updated: AtomicBool,
    any_pod_running: AtomicBool,
    seen: Mutex<BTreeMap<String, SeenPod>>,
    completed_pods: Mutex<BTreeMap<String, PodPhase>>,
    global_outputs: Mutex<Vec<Outputs>>,
}

impl<'a> WorkflowOperation<'a> {
    /// Examines every observed pod and folds its state into the node graph,
    /// then sweeps for pods that disappeared without a final event.
    pub(crate) async fn reconcile_pods(&mut self) -> Result<(), OperateError> {
        let pods = Arc::clone(&self.operator.c.pods);
        let pod_list = pods.list_workflow_pods(&self.wf).await?;

        let shared = Arc::new(AssessShared {
            workflow_name: self.wf.name().to_string(),
            namespace: self.wf.namespace().to_string(),
            nodes: RwLock::new(std::mem::take(&mut self.wf.status.nodes)),
            clock: Arc::clone(&self.operator.c.clock),
            caches: Arc::clone(&self.operator.c.caches),
            pods,
            pod_gc: self.exec_spec.pod_gc.clone(),
            updated: AtomicBool::new(false),
            any_pod_running: AtomicBool::new(false),
            seen: Mutex::new(BTreeMap::new()),
            completed_pods: Mutex::new(BTreeMap::new()),
            global_outputs: Mutex::new(Vec::new()),
        });
        let semaphore = Arc::new(Semaphore::new(
            self.operator.config.pod_assessment_concurrency.max(1),
        ));

        join_all(pod_list.into_iter().map(|pod| {
            let shared = Arc::clone(&shared);
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                assess_one(&shared, pod).await;
            }
        }))
        .await;

        let shared = Arc::try_unwrap(shared).map_err(|_| {
            OperateError::InvariantViolation("pod assessment still referenced".to_string())
        })?;
        self.wf.status.nodes = shared.nodes.into_inner();
        self.updated |= shared.updated.into_inner();
        for outputs in shared
            .global_outputs
            .into_inner()
            .expect("global outputs poisoned")
        {
            self.add_outputs_to_global_scope(&outputs);
        }
        for (pod_name, phase) in shared
            .completed_pods
            .into_inner()
            .expect("completed pods poisoned")
        {
            self.completed_pods.insert(pod_name, phase);
        }

        let any_running = shared.any_pod_running.into_inner();
        let condition_unchanged = self
            .wf
            .status
            .conditions
            .iter()
            .any(|condition| {
                condition.condition_type == ConditionType::PodRunning
                    && condition.status == any_running
            });
        upsert_condition(
            &mut self.wf.status.conditions,
            Condition {
                condition_type: ConditionType::PodRunning,
                status: any_running,
                message: None,
            },
        );
        self.updated |= !condition_unchanged;

        // node completion events for transitions made during assessment
        let completed_now: Vec<NodeStatus> = self
            .wf
            .status
            .nodes
            .values()
            .filter(|node| node.node_type == NodeType::Pod && node.phase.fulfilled())
            .filter(|node| {
                self.pre_execution_phases
                    .get(&node.id)
                    .is_some_and(|phase| !phase.fulfilled())
            })
            .cloned()
            .collect();
        for node in &completed_now {
            self.on_node_complete(node);
        }

        self.sweep_missing_pods(&shared.seen.into_inner().expect("seen pods poisoned"));
        Ok(())
    }

    /// A node whose pod disappeared can no longer be inferred from events:
    /// error it after a grace window, requeue inside the window.
    fn sweep_missing_pods(&mut self, seen: &BTreeMap<String, SeenPod>) {
        let grace =
            chrono::Duration::from_std(self.operator.config.recently_started_pod_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let now = self.now();

        let mut host_updates: Vec<(String, Option<String>)> = Vec::new();
        let mut to_error: Vec<String> = Vec::new();
        let mut requeue = false;
        for node in self.wf.status.nodes.values() {
            if node.node_type != NodeType::Pod
                || node.phase.fulfilled()
                || node.started_at.is_none()
            {
                continue;
            }
            match seen.get(&node.id) {
                Some(seen_pod) => {
                    if node.host_node_name != seen_pod.host {
                        host_updates.push((node.id.clone(), seen_pod.host.clone()));
                    }
                }
                None => {
                    let started = node.started_at.expect("checked above");
                    let recently_started = now - started <= grace;
                    info!(
                        pod = %node.id,
                        phase = %node.phase,
                        recently_started,
                        "workflow pod is missing"
                    );
                    self.operator
                        .c
                        .metrics
                        .pod_missing(recently_started, node.phase);
                    if node.pending() && node.is_waiting_for_lock() {
                        continue;
                    }
                    if recently_started {
                        requeue = true;
                        continue;
                    }
                    to_error.push(node.name.clone());
                }
            }
        }
        if requeue {
            self.requeue();
        }
        for (node_id, host) in host_updates {
            if let Some(node) = self.wf.status.nodes.get_mut(&node_id) {
                node.host_node_name = host;
                self.updated = true;
            }
        }
        for node_name in to_error {
            let node_id = self.wf.node_id(&node_name);
            if let Some(node) = self.wf.status.nodes.get_mut(&node_id) {
                if node.daemoned.is_some() {
                    node.daemoned = None;
                    self.updated = true;
                }
            }
            if let Err(err) = self.mark_node_phase(&node_name, NodePhase::Error, Some("pod deleted"))
            {
                warn!(node = %node_name, error = %err, "failed to mark deleted pod");
            }
        }
    }
}

async fn assess_one(shared: &AssessShared, pod: PodSnapshot) {
    let node_name = pod
        .annotations
        .get(ANNOTATION_NODE_NAME)
        .cloned()
        .unwrap_or_else(|| pod.name.clone());
    let nid = node_id(&shared.workflow_name, &node_name);
    shared.seen.lock().expect("seen pods poisoned").insert(
        nid.clone(),
        SeenPod {
            host: pod.host_node_name.clone(),
        },
    );

    let template: Option<Template> = pod
        .annotations
        .get(ANNOTATION_TEMPLATE)
        .and_then(|raw| serde_json::from_str(raw).ok());
    let now = shared.clock.now();

    let mut nodes = shared.nodes.write().await;
    let Some(old_node) = nodes.get(&nid).cloned() else {
        return;
    };

    let assessment = assess_node_status(&pod, &old_node, template.as_ref(), now);

    for (child_name, phase, message) in assessment.container_children {
        let child_id = node_id(&shared.workflow_name, &child_name);
        let Some(child) = nodes.get_mut(&child_id) else {
            continue;
        };
        if child.phase.fulfilled() {
            continue;
        }
        if child.phase != phase || child.message != message {
            child.phase = phase;
            child.message = message;
            if phase.fulfilled() && child.finished_at.is_none() {
                child.finished_at = Some(now);
            }
            shared.updated.store(true, Ordering::SeqCst);
        }
    }

    if let Some(mut new_node) = assessment.node {
        if new_node.fulfilled() && !old_node.fulfilled() {
            if let Some(memo) = new_node.memoization_status.clone() {
                if let Some(cache) = shared.caches.cache(&memo.cache_name) {
                    let outputs = new_node.outputs.clone().unwrap_or_default();
                    if let Err(err) = cache.save(&memo.key, &new_node.id, &outputs).await {
                        error!(node_id = %new_node.id, error = %err, "failed to save node outputs to cache");
                        new_node.phase = NodePhase::Error;
                        new_node.message = err.to_string();
                    }
                }
            }
        }
        if let Some(outputs) = &new_node.outputs {
            shared
                .global_outputs
                .lock()
                .expect("global outputs poisoned")
                .push(outputs.clone());
        }
        if new_node.phase == NodePhase::Running {
            shared.any_pod_running.store(true, Ordering::SeqCst);
        }
        nodes.insert(new_node);
        shared.updated.store(true, Ordering::SeqCst);
    } else if old_node.phase == NodePhase::Running {
        shared.any_pod_running.store(true, Ordering::SeqCst);
    }

    let node = nodes.get(&nid).cloned().expect("node present above");
    let gc_match = shared
        .pod_gc
        .as_ref()
        .map_or(true, |gc| gc.matches(&pod.labels));
    if node.fulfilled() && !node.is_daemoned() {
        let already_labeled = pod.labels.get(LABEL_COMPLETED).map(String::as_str) == Some("true");
        if !already_labeled && gc_match {
            shared
                .completed_pods
                .lock()
                .expect("completed pods poisoned")
                .insert(pod.name.clone(), pod.phase);
        }
    }

    drop(nodes);

    // if the wait sidecar finished while other containers linger, ask for
    // their termination
    let wait_terminated = pod
        .container(WAIT_CONTAINER_NAME)
        .is_some_and(|wait| matches!(wait.state, ContainerState::Terminated { .. }));
    let any_lingering = pod
        .container_statuses
        .iter()
        .any(|container| !matches!(container.state, ContainerState::Terminated { .. }));
    if wait_terminated && any_lingering {
        shared.pods.queue_for_cleanup(
            &shared.namespace,
            &pod.name,
            PodCleanupAction::TerminateContainers,
        );
    }
}

struct Assessment {
    /// Updated node, when anything changed.
    node: Option<NodeStatus>,
    /// Phase updates for per-container sub-nodes (`NAME.CONTAINER`).
    container_children: Vec<(String, NodePhase, String)>,
}

/// Maps one pod snapshot onto its node. Pure over (pod, node, template, now).
fn assess_node_status(
    pod: &PodSnapshot,
    node: &NodeStatus,
    template: Option<&Template>,
    now: DateTime<Utc>,
) -> Assessment {
    let mut new_node = node.clone();
    let mut updated = false;
    let mut message = String::new();

    let new_phase = match pod.phase {
        PodPhase::Pending => {
            message = pending_reason(pod);
            NodePhase::Pending
        }
        PodPhase::Succeeded => NodePhase::Succeeded,
        PodPhase::Failed => {
            if node.is_daemoned() {
                // daemons are expected to be torn down, not to exit cleanly
                NodePhase::Succeeded
            } else {
                let (phase, failure_message) = infer_failed_reason(pod);
                info!(
                    display_name = %node.display_name,
                    pod = %pod.name,
                    message = %failure_message,
                    "pod failed"
                );
                message = failure_message;
                phase
            }
        }
        PodPhase::Running => {
            if template.is_some_and(Template::is_daemon) {
                if !pod.container_statuses.iter().all(|container| container.ready) {
                    return Assessment {
                        node: None,
                        container_children: container_children(pod, node),
                    };
                }
                if !new_node.is_daemoned() {
                    new_node.daemoned = Some(true);
                    updated = true;
                }
                if let Some(ip) = &pod.pod_ip {
                    if new_node.pod_ip.as_ref() != Some(ip) {
                        new_node.pod_ip = Some(ip.clone());
                        updated = true;
                    }
                }
            }
            NodePhase::Running
        }
        PodPhase::Unknown => {
            message = format!("Unexpected pod phase for {}: Unknown", pod.name);
            NodePhase::Error
        }
    };

    let mut new_phase = new_phase;
    if !node.phase.fulfilled() && new_phase.fulfilled() {
        if let Some(exit_code) = pod.main_exit_code() {
            let mut outputs = Outputs {
                exit_code: Some(exit_code.to_string()),
                ..Default::default()
            };
            match pod.annotations.get(ANNOTATION_OUTPUTS) {
                Some(raw) => match serde_json::from_str::<Outputs>(raw) {
                    Ok(mut parsed) => {
                        parsed.exit_code = Some(exit_code.to_string());
                        outputs = parsed;
                    }
                    Err(err) => {
                        new_phase = NodePhase::Error;
                        message = format!("failed to parse pod outputs: {err}");
                    }
                },
                None => {}
            }
            new_node.outputs = Some(outputs);
            updated = true;
        }
    }

    if new_node.phase != new_phase {
        if new_node.phase == NodePhase::Pending {
            new_node.message.clear();
        }
        new_node.phase = new_phase;
        updated = true;
    }
    if !message.is_empty() && new_node.message != message {
        new_node.message = message;
        updated = true;
    }

    if new_node.fulfilled() && new_node.finished_at.is_none() {
        new_node.finished_at = if new_node.is_daemoned() {
            Some(now)
        } else {
            pod.latest_finished_at().or(Some(now))
        };
        new_node.resources_duration = pod.resources_duration.clone();
        updated = true;
    }

    if new_node.host_node_name != pod.host_node_name && pod.host_node_name.is_some() {
        new_node.host_node_name = pod.host_node_name.clone();
        updated = true;
    }

    Assessment {
        node: updated.then_some(new_node),
        container_children: container_children(pod, node),
    }
}

fn container_children(pod: &PodSnapshot, node: &NodeStatus) -> Vec<(String, NodePhase, String)> {
    pod.container_statuses
        .iter()
        .map(|container| {
            let child_name = format!("{}.{}", node.name, container.name);
            match &container.state {
                ContainerState::Waiting { .. } => (child_name, NodePhase::Pending, String::new()),
                ContainerState::Running { .. } => (child_name, NodePhase::Running, String::new()),
                ContainerState::Terminated {
                    exit_code,
                    reason,
                    message,
                    ..
                } => {
                    let detail = format!("{reason} (exit code {exit_code}): {message}");
                    match *exit_code {
                        0 => (child_name, NodePhase::Succeeded, String::new()),
                        code if code == SIDECAR_INTERNAL_EXIT_CODE => {
                            (child_name, NodePhase::Error, detail)
                        }
                        _ => (child_name, NodePhase::Failed, detail),
                    }
                }
            }
        })
        .collect()
}

/// Why a pending pod has not started.
fn pending_reason(pod: &PodSnapshot) -> String {
    for container in &pod.container_statuses {
        if let ContainerState::Waiting { reason, message } = &container.state {
            if !message.is_empty() {
                return format!("{reason}: {message}");
            }
            return reason.clone();
        }
    }
    for condition in &pod.conditions {
        if condition.reason == POD_REASON_UNSCHEDULABLE {
            if !condition.message.is_empty() {
                return format!("{}: {}", condition.reason, condition.message);
            }
            return condition.reason.clone();
        }
    }
    String::new()
}

fn container_rank(name: &str) -> usize {
    match name {
        INIT_CONTAINER_NAME => 0,
        MAIN_CONTAINER_NAME => 1,
        WAIT_CONTAINER_NAME => 2,
        _ => 3,
    }
}

/// Infers the phase and message for a Failed pod from its containers.
pub(crate) fn infer_failed_reason(pod: &PodSnapshot) -> (NodePhase, String) {
    if !pod.message.is_empty() {
        return (NodePhase::Failed, pod.message.clone());
    }

    let mut containers: Vec<_> = pod
        .init_container_statuses
        .iter()
        .chain(pod.container_statuses.iter())
        .collect();
    containers.sort_by_key(|container| container_rank(&container.name));

    for container in containers {
        let (exit_code, reason, term_message) = match &container.state {
            ContainerState::Waiting { .. } => {
                return (
                    NodePhase::Error,
                    format!("Pod failed before {} container starts", container.name),
                );
            }
            ContainerState::Running { .. } => {
                warn!(
                    pod = %pod.name,
                    container = %container.name,
                    "failed pod has a non-terminated container"
                );
                continue;
            }
            ContainerState::Terminated {
                exit_code,
                reason,
                message,
                ..
            } => (*exit_code, reason.clone(), message.clone()),
        };
        if exit_code == 0 {
            continue;
        }
        let mut detail = format!("{reason} (exit code {exit_code})");
        if !term_message.is_empty() {
            detail = format!("{detail}: {term_message}");
        }
        match container_rank(&container.name) {
            0 | 2 => return (NodePhase::Error, detail),
            1 => return (NodePhase::Failed, detail),
            _ => {
                if exit_code == 137 || exit_code == 143 {
                    // sidecar SIGKILL/SIGTERM on forced teardown
                    info!(
                        container = %container.name,
                        exit_code,
                        "ignoring forced sidecar termination"
                    );
                } else {
                    return (NodePhase::Failed, detail);
                }
            }
        }
    }

    // every non-zero exit was a tolerated sidecar kill
    (NodePhase::Succeeded, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_model::ContainerStatus;

    fn terminated(name: &str, exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready: false,
            state: ContainerState::Terminated {
                exit_code,
                reason: "Error".to_string(),
                message: String::new(),
                finished_at: None,
            },
        }
    }

    fn failed_pod(containers: Vec<ContainerStatus>) -> PodSnapshot {
        PodSnapshot {
            name: "pod".to_string(),
            phase: PodPhase::Failed,
            container_statuses: containers,
            ..Default::default()
        }
    }

    #[test]
    fn pod_message_wins_when_present() {
        let mut pod = failed_pod(vec![terminated(MAIN_CONTAINER_NAME, 1)]);
        pod.message = "evicted".to_string();
        assert_eq!(infer_failed_reason(&pod), (NodePhase::Failed, "evicted".to_string()));
    }

    #[test]
    fn main_failure_is_failed_wait_failure_is_error() {
        let pod = failed_pod(vec![
            terminated(WAIT_CONTAINER_NAME, 0),
            terminated(MAIN_CONTAINER_NAME, 2),
        ]);
        let (phase, message) = infer_failed_reason(&pod);
        assert_eq!(phase, NodePhase::Failed);
        assert!(message.contains("exit code 2"));

        let pod = failed_pod(vec![
            terminated(WAIT_CONTAINER_NAME, 3),
            terminated(MAIN_CONTAINER_NAME, 0),
        ]);
        assert_eq!(infer_failed_reason(&pod).0, NodePhase::Error);
    }

    #[test]
    fn forced_sidecar_kills_are_tolerated() {
        let pod = failed_pod(vec![
            terminated(MAIN_CONTAINER_NAME, 0),
            terminated("metrics-proxy", 137),
        ]);
        assert_eq!(infer_failed_reason(&pod), (NodePhase::Succeeded, String::new()));

        let pod = failed_pod(vec![
            terminated(MAIN_CONTAINER_NAME, 0),
            terminated("metrics-proxy", 5),
        ]);
        assert_eq!(infer_failed_reason(&pod).0, NodePhase::Failed);
    }

    #[test]
    fn waiting_container_on_failed_pod_is_an_error() {
        let pod = failed_pod(vec![ContainerStatus {
            name: MAIN_CONTAINER_NAME.to_string(),
            ready: false,
            state: ContainerState::Waiting {
                reason: "ImagePullBackOff".to_string(),
                message: String::new(),
            },
        }]);
        let (phase, message) = infer_failed_reason(&pod);
        assert_eq!(phase, NodePhase::Error);
        assert!(message.contains("before main container starts"));
    }

    #[test]
    fn assessment_is_idempotent() {
        let node = NodeStatus {
            id: "wf-1".to_string(),
            name: "wf.step".to_string(),
            node_type: NodeType::Pod,
            phase: NodePhase::Pending,
            ..Default::default()
        };
        let pod = PodSnapshot {
            name: "wf-1".to_string(),
            phase: PodPhase::Succeeded,
            container_statuses: vec![terminated(MAIN_CONTAINER_NAME, 0)],
            ..Default::default()
        };
        let now = Utc::now();
        let first = assess_node_status(&pod, &node, None, now);
        let settled = first.node.expect("node updated");
        assert_eq!(settled.phase, NodePhase::Succeeded);
        // applying the same snapshot to the settled node changes nothing
        let second = assess_node_status(&pod, &settled, None, now);
        assert!(second.node.is_none());
    }

    #[test]
    fn daemon_pod_waits_for_readiness() {
        let mut template = Template::new(
            "daemon",
            foreman_model::TemplateBody::Container(Default::default()),
        );
        template.daemon = Some(true);
        let node = NodeStatus {
            name: "wf.daemon".to_string(),
            node_type: NodeType::Pod,
            phase: NodePhase::Pending,
            ..Default::default()
        };
        let mut pod = PodSnapshot {
            name: "wf-2".to_string(),
            phase: PodPhase::Running,
            pod_ip: Some("10.0.0.9".to_string()),
            container_statuses: vec![ContainerStatus {
                name: MAIN_CONTAINER_NAME.to_string(),
                ready: false,
                state: ContainerState::Running { started_at: None },
            }],
            ..Default::default()
        };
        let not_ready = assess_node_status(&pod, &node, Some(&template), Utc::now());
        assert!(not_ready.node.is_none());

        pod.container_statuses[0].ready = true;
        let ready = assess_node_status(&pod, &node, Some(&template), Utc::now());
        let updated = ready.node.expect("node updated");
        assert_eq!(updated.daemoned, Some(true));
        assert_eq!(updated.pod_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(updated.phase, NodePhase::Running);
    }
}
