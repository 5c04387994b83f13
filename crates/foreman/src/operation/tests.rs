use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use foreman_backend_memory::{
    FixedEstimator, ManualClock, MemoryArtifactRepositories, MemoryCacheFactory,
    MemoryPodManager, MemorySyncManager, MemoryTemplateStore, MemoryWorkflowApi,
    PassthroughHydrator, RecordingEvents, RecordingMetrics,
};
use foreman_backends_core::{
    BackendError, CacheEntry, PodCleanupAction, StoredWorkflowTemplate,
};
use foreman_model::{
    Arguments, Backoff, ContainerSpec, ContainerState, ContainerStatus, DagSpec, DagTask,
    Memoize, MutexRef, NodePhase, NodeType, ObjectMeta, Outputs, ParallelSteps, Parameter,
    PodDisruptionBudgetSpec, PodPhase, RetryPolicy, RetryStrategy, SuspendSpec, Synchronization,
    Template, TemplateBody, ValueFrom, Workflow, WorkflowPhase, WorkflowSpec, WorkflowStep,
    WorkflowTemplateRef, MAIN_CONTAINER_NAME,
};

use crate::config::OperatorConfig;

use super::{Collaborators, OperationResult, Operator};

struct Harness {
    operator: Operator,
    api: Arc<MemoryWorkflowApi>,
    pods: Arc<MemoryPodManager>,
    clock: Arc<ManualClock>,
    sync: Arc<MemorySyncManager>,
    caches: Arc<MemoryCacheFactory>,
    templates: Arc<MemoryTemplateStore>,
    events: Arc<RecordingEvents>,
    metrics: Arc<RecordingMetrics>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::starting_at_epoch());
        let api = Arc::new(MemoryWorkflowApi::new());
        let pods = Arc::new(MemoryPodManager::new());
        let sync = Arc::new(MemorySyncManager::new());
        let caches = Arc::new(MemoryCacheFactory::new(clock.clone()));
        let templates = Arc::new(MemoryTemplateStore::new());
        let events = Arc::new(RecordingEvents::new());
        let metrics = Arc::new(RecordingMetrics::new());
        let collaborators = Collaborators {
            pods: pods.clone(),
            caches: caches.clone(),
            sync: sync.clone(),
            artifacts: Arc::new(MemoryArtifactRepositories::default()),
            templates: templates.clone(),
            metrics: metrics.clone(),
            events: events.clone(),
            estimator: Arc::new(FixedEstimator::default()),
            api: api.clone(),
            hydrator: Arc::new(PassthroughHydrator),
            clock: clock.clone(),
        };
        Self {
            operator: Operator::new(OperatorConfig::default(), collaborators),
            api,
            pods,
            clock,
            sync,
            caches,
            templates,
            events,
            metrics,
        }
    }

    fn submit(&self, workflow: Workflow) -> Workflow {
        self.api.put(workflow)
    }

    async fn reconcile(&self, name: &str) -> OperationResult {
        let workflow = self.api.stored("default", name).expect("workflow stored");
        self.operator
            .operate(workflow, CancellationToken::new())
            .await
    }

    fn stored(&self, name: &str) -> Workflow {
        self.api.stored("default", name).expect("workflow stored")
    }

    fn now(&self) -> DateTime<Utc> {
        use foreman_backends_core::Clock;
        self.clock.now()
    }

    fn pod_id(&self, workflow: &str, node_name: &str) -> String {
        foreman_model::node_id(workflow, node_name)
    }

    fn set_pod_running(&self, pod_name: &str) {
        self.pods.update_pod(pod_name, |pod| {
            pod.phase = PodPhase::Running;
            pod.container_statuses = vec![ContainerStatus {
                name: MAIN_CONTAINER_NAME.to_string(),
                ready: true,
                state: ContainerState::Running { started_at: None },
            }];
        });
    }

    fn set_pod_finished(&self, pod_name: &str, exit_code: i32, finished_at: DateTime<Utc>) {
        self.pods.update_pod(pod_name, |pod| {
            pod.phase = if exit_code == 0 {
                PodPhase::Succeeded
            } else {
                PodPhase::Failed
            };
            pod.container_statuses = vec![ContainerStatus {
                name: MAIN_CONTAINER_NAME.to_string(),
                ready: false,
                state: ContainerState::Terminated {
                    exit_code,
                    reason: "Error".to_string(),
                    message: String::new(),
                    finished_at: Some(finished_at),
                },
            }];
        });
    }

    fn set_pod_outputs(&self, pod_name: &str, outputs: &Outputs) {
        let raw = serde_json::to_string(outputs).expect("outputs serialize");
        self.pods.update_pod(pod_name, |pod| {
            pod.annotations
                .insert(foreman_model::ANNOTATION_OUTPUTS.to_string(), raw.clone());
        });
    }
}

fn workflow(name: &str, spec: WorkflowSpec) -> Workflow {
    Workflow {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: format!("uid-{name}"),
            ..Default::default()
        },
        spec,
        ..Default::default()
    }
}

fn container_template(name: &str) -> Template {
    Template::new(
        name,
        TemplateBody::Container(ContainerSpec {
            image: "alpine:3.19".to_string(),
            command: vec!["sh".to_string(), "-c".to_string()],
            args: vec!["true".to_string()],
        }),
    )
}

fn echo_template(name: &str) -> Template {
    let mut template = Template::new(
        name,
        TemplateBody::Container(ContainerSpec {
            image: "alpine:3.19".to_string(),
            command: vec!["echo".to_string()],
            args: vec!["{{inputs.parameters.message}}".to_string()],
        }),
    );
    template.inputs.parameters.push(Parameter {
        name: "message".to_string(),
        ..Default::default()
    });
    template
}

fn single_container_spec() -> WorkflowSpec {
    WorkflowSpec {
        entrypoint: "main".to_string(),
        templates: vec![container_template("main")],
        ..Default::default()
    }
}

#[tokio::test]
async fn single_container_success_end_to_end() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.pod_disruption_budget = Some(PodDisruptionBudgetSpec {
        min_available: Some("1".to_string()),
    });
    h.submit(workflow("hello", spec));

    h.reconcile("hello").await;
    let stored = h.stored("hello");
    assert_eq!(stored.status.phase, WorkflowPhase::Running);
    assert!(stored.status.started_at.is_some());
    assert!(h.api.has_pdb(&stored));
    let entry = stored.node_by_name("hello").expect("entry node");
    assert_eq!(entry.node_type, NodeType::Pod);
    assert_eq!(entry.phase, NodePhase::Pending);
    assert_eq!(h.pods.pod_count(), 1);

    let pod = h.pod_id("hello", "hello");
    h.set_pod_running(&pod);
    h.reconcile("hello").await;
    let stored = h.stored("hello");
    assert_eq!(
        stored.node_by_name("hello").expect("entry node").phase,
        NodePhase::Running
    );

    h.clock.advance(Duration::from_secs(10));
    h.set_pod_finished(&pod, 0, h.now());
    h.reconcile("hello").await;
    let stored = h.stored("hello");
    assert_eq!(stored.status.phase, WorkflowPhase::Succeeded);
    assert!(stored.status.finished_at.is_some());
    let entry = stored.node_by_name("hello").expect("entry node");
    assert_eq!(entry.phase, NodePhase::Succeeded);
    assert_eq!(
        entry.outputs.as_ref().and_then(|o| o.exit_code.as_deref()),
        Some("0")
    );
    assert!(!h.api.has_pdb(&stored));
    assert!(h
        .pods
        .cleanup_actions()
        .contains(&(pod, PodCleanupAction::LabelPodCompleted)));
    assert!(h.events.reasons().contains(&"WorkflowSucceeded".to_string()));
    assert_eq!(stored.status.progress, "1/1");
}

#[tokio::test]
async fn reconciling_a_fulfilled_workflow_changes_nothing() {
    let h = Harness::new();
    h.submit(workflow("done", single_container_spec()));
    h.reconcile("done").await;
    let pod = h.pod_id("done", "done");
    h.set_pod_finished(&pod, 0, h.now());
    h.reconcile("done").await;
    assert_eq!(h.stored("done").status.phase, WorkflowPhase::Succeeded);

    let updates_before = h.api.update_calls();
    h.reconcile("done").await;
    assert_eq!(h.api.update_calls(), updates_before);
}

#[tokio::test]
async fn retry_on_failure_with_exponential_backoff() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.templates[0].retry_strategy = Some(RetryStrategy {
        limit: Some(3),
        retry_policy: Some(RetryPolicy::OnFailure),
        backoff: Some(Backoff {
            duration: Some("10s".to_string()),
            factor: Some(2),
            max_duration: None,
        }),
        retry_on_different_host: None,
    });
    h.submit(workflow("retry", spec));

    // attempt 0 spawns immediately
    h.reconcile("retry").await;
    let stored = h.stored("retry");
    assert_eq!(
        stored.node_by_name("retry").expect("retry node").node_type,
        NodeType::Retry
    );
    assert!(stored.node_by_name("retry(0)").is_some());

    // child 0 fails at T=5; reconcile at T=6 waits out a 10s backoff
    h.clock.advance(Duration::from_secs(5));
    let child0 = h.pod_id("retry", "retry(0)");
    h.set_pod_finished(&child0, 1, h.now());
    h.clock.advance(Duration::from_secs(1));
    let result = h.reconcile("retry").await;
    let stored = h.stored("retry");
    let retry_node = stored.node_by_name("retry").expect("retry node");
    assert_eq!(retry_node.phase, NodePhase::Running);
    assert!(retry_node.message.starts_with("Backoff for"));
    assert_eq!(result.requeue_after, Some(Duration::from_secs(10)));
    assert!(stored.node_by_name("retry(1)").is_none());

    // past the backoff, attempt 1 spawns with a fresh pod name
    h.clock.advance(Duration::from_secs(10));
    h.reconcile("retry").await;
    let stored = h.stored("retry");
    assert!(stored.node_by_name("retry(1)").is_some());
    let child1 = h.pod_id("retry", "retry(1)");
    assert!(h.pods.pod(&child1).is_some());

    // child 1 fails; the next wait doubles to 20s
    h.clock.advance(Duration::from_secs(14));
    h.set_pod_finished(&child1, 1, h.now());
    h.clock.advance(Duration::from_secs(1));
    let result = h.reconcile("retry").await;
    assert_eq!(result.requeue_after, Some(Duration::from_secs(20)));

    // attempt 2 succeeds and the retry node succeeds with it
    h.clock.advance(Duration::from_secs(21));
    h.reconcile("retry").await;
    let child2 = h.pod_id("retry", "retry(2)");
    assert!(h.pods.pod(&child2).is_some());
    h.set_pod_finished(&child2, 0, h.now());
    h.reconcile("retry").await;
    let stored = h.stored("retry");
    assert_eq!(stored.status.phase, WorkflowPhase::Succeeded);
    assert_eq!(
        stored.node_by_name("retry").expect("retry node").phase,
        NodePhase::Succeeded
    );
}

#[tokio::test]
async fn retry_policy_does_not_retry_mismatched_phase() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.templates[0].retry_strategy = Some(RetryStrategy {
        limit: Some(3),
        retry_policy: Some(RetryPolicy::OnError),
        ..Default::default()
    });
    h.submit(workflow("policy", spec));
    h.reconcile("policy").await;
    let child0 = h.pod_id("policy", "policy(0)");
    h.set_pod_finished(&child0, 1, h.now());
    h.reconcile("policy").await;
    let stored = h.stored("policy");
    assert_eq!(stored.status.phase, WorkflowPhase::Failed);
    assert!(stored.node_by_name("policy(1)").is_none());
}

#[tokio::test]
async fn memoization_hit_skips_pod_creation() {
    let h = Harness::new();
    let memoize = Memoize {
        key: "K".to_string(),
        cache_name: "shared".to_string(),
        max_age: None,
    };
    let mut spec = single_container_spec();
    spec.templates[0].memoize = Some(memoize.clone());
    spec.templates[0].outputs.parameters.push(Parameter {
        name: "x".to_string(),
        value_from: Some(ValueFrom {
            path: Some("/tmp/x".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });

    // first workflow runs for real and writes the cache on completion
    h.submit(workflow("first", spec.clone()));
    h.reconcile("first").await;
    let pod = h.pod_id("first", "first");
    h.set_pod_outputs(
        &pod,
        &Outputs {
            parameters: vec![Parameter {
                name: "x".to_string(),
                value: Some("1".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        },
    );
    h.set_pod_finished(&pod, 0, h.now());
    h.reconcile("first").await;
    assert_eq!(h.stored("first").status.phase, WorkflowPhase::Succeeded);
    let cache = h.caches.memory_cache("shared");
    assert_eq!(cache.saved_keys(), vec!["K".to_string()]);

    // second workflow hits the cache; no pod, immediately Succeeded
    let pods_before = h.pods.pod_count();
    h.submit(workflow("second", spec));
    h.reconcile("second").await;
    let stored = h.stored("second");
    assert_eq!(stored.status.phase, WorkflowPhase::Succeeded);
    assert_eq!(h.pods.pod_count(), pods_before);
    let node = stored.node_by_name("second").expect("entry node");
    let memo = node.memoization_status.as_ref().expect("memo status");
    assert!(memo.hit);
    assert_eq!(
        node.outputs
            .as_ref()
            .and_then(|outputs| outputs.parameter("x"))
            .and_then(|parameter| parameter.value.as_deref()),
        Some("1")
    );
}

#[tokio::test]
async fn memoization_entry_past_max_age_is_a_miss() {
    let h = Harness::new();
    let cache = h.caches.memory_cache("shared");
    cache.seed(
        "K",
        CacheEntry {
            node_id: "other".to_string(),
            outputs: Outputs::default(),
            created_at: h.now(),
        },
    );
    h.clock.advance(Duration::from_secs(3600));

    let mut spec = single_container_spec();
    spec.templates[0].memoize = Some(Memoize {
        key: "K".to_string(),
        cache_name: "shared".to_string(),
        max_age: Some("10m".to_string()),
    });
    h.submit(workflow("stale", spec));
    h.reconcile("stale").await;
    let stored = h.stored("stale");
    let node = stored.node_by_name("stale").expect("entry node");
    assert_eq!(node.phase, NodePhase::Pending);
    assert!(!node.memoization_status.as_ref().expect("memo status").hit);
    assert_eq!(h.pods.pod_count(), 1);
}

#[tokio::test]
async fn exit_handler_failure_overrides_a_succeeded_entry() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.templates.push(container_template("cleanup"));
    spec.on_exit = Some("cleanup".to_string());
    h.submit(workflow("exit", spec));

    h.reconcile("exit").await;
    let main_pod = h.pod_id("exit", "exit");
    h.set_pod_finished(&main_pod, 0, h.now());
    h.reconcile("exit").await;
    // entry succeeded, exit handler pod launched
    let stored = h.stored("exit");
    assert_eq!(stored.status.phase, WorkflowPhase::Running);
    let exit_node = stored.node_by_name("exit.onExit").expect("exit node");
    assert_eq!(exit_node.phase, NodePhase::Pending);

    let exit_pod = h.pod_id("exit", "exit.onExit");
    h.set_pod_finished(&exit_pod, 1, h.now());
    h.reconcile("exit").await;
    let stored = h.stored("exit");
    assert_eq!(stored.status.phase, WorkflowPhase::Failed);
}

#[tokio::test]
async fn exit_handler_sees_failure_context_of_a_failed_entry() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    let mut cleanup = echo_template("cleanup");
    cleanup.inputs.parameters[0].value = Some("{{workflow.status}}".to_string());
    spec.templates.push(cleanup);
    spec.on_exit = Some("cleanup".to_string());
    h.submit(workflow("boom", spec));

    h.reconcile("boom").await;
    let main_pod = h.pod_id("boom", "boom");
    h.set_pod_finished(&main_pod, 1, h.now());
    h.reconcile("boom").await;

    let exit_pod = h.pod_id("boom", "boom.onExit");
    let pod = h.pods.pod(&exit_pod).expect("exit pod created");
    let template_annotation = pod
        .annotations
        .get(foreman_model::ANNOTATION_TEMPLATE)
        .expect("template annotation");
    assert!(template_annotation.contains("Failed"));

    h.set_pod_finished(&exit_pod, 0, h.now());
    h.reconcile("boom").await;
    // exit handler succeeded but the entry's failure class wins
    let stored = h.stored("boom");
    assert_eq!(stored.status.phase, WorkflowPhase::Failed);
    assert!(stored
        .node_by_name("boom")
        .expect("entry node")
        .message
        .contains("exit code 1"));
}

#[tokio::test]
async fn missing_pod_is_tolerated_inside_the_grace_window() {
    let h = Harness::new();
    h.submit(workflow("ghost", single_container_spec()));
    h.reconcile("ghost").await;
    let pod = h.pod_id("ghost", "ghost");
    h.set_pod_running(&pod);
    h.reconcile("ghost").await;
    h.pods.delete_pod(&pod);

    // inside the grace window: requeue, node untouched
    h.clock.advance(Duration::from_secs(2));
    let result = h.reconcile("ghost").await;
    let stored = h.stored("ghost");
    assert_eq!(
        stored.node_by_name("ghost").expect("entry node").phase,
        NodePhase::Running
    );
    assert!(result.requeue_after.is_some());
    assert!(h.metrics.pod_missing_count() >= 1);

    // past the grace window: the node errors out
    h.clock.advance(Duration::from_secs(13));
    h.reconcile("ghost").await;
    let stored = h.stored("ghost");
    let node = stored.node_by_name("ghost").expect("entry node");
    assert_eq!(node.phase, NodePhase::Error);
    assert_eq!(node.message, "pod deleted");
    assert_eq!(stored.status.phase, WorkflowPhase::Error);
}

#[tokio::test]
async fn conflicting_update_is_reapplied_onto_the_latest_version() {
    let h = Harness::new();
    h.submit(workflow("clash", single_container_spec()));
    h.reconcile("clash").await;
    let pod = h.pod_id("clash", "clash");
    h.set_pod_finished(&pod, 0, h.now());

    // read a copy, then let a third party touch the stored object before the
    // operator writes back
    let stale = h.stored("clash");
    h.api.mutate_stored("default", "clash", |stored| {
        stored
            .metadata
            .labels
            .insert("team".to_string(), "data".to_string());
    });
    let version_before: u64 = h
        .stored("clash")
        .metadata
        .resource_version
        .parse()
        .expect("numeric version");
    h.operator.operate(stale, CancellationToken::new()).await;

    let stored = h.stored("clash");
    assert_eq!(stored.status.phase, WorkflowPhase::Succeeded);
    // the reapplied update kept the third-party change
    assert_eq!(stored.metadata.labels.get("team").map(String::as_str), Some("data"));
    let version_after: u64 = stored
        .metadata
        .resource_version
        .parse()
        .expect("numeric version");
    assert!(version_after > version_before);
}

#[tokio::test]
async fn reapply_gives_up_when_the_latest_version_is_fulfilled() {
    let h = Harness::new();
    h.submit(workflow("raced", single_container_spec()));
    h.reconcile("raced").await;
    let pod = h.pod_id("raced", "raced");
    h.set_pod_finished(&pod, 0, h.now());

    let stale = h.stored("raced");
    h.api.mutate_stored("default", "raced", |stored| {
        stored.status.phase = WorkflowPhase::Failed;
        stored.status.finished_at = Some(Utc::now());
    });
    h.operator.operate(stale, CancellationToken::new()).await;
    // the stale reconciliation must not overwrite the fulfilled object
    assert_eq!(h.stored("raced").status.phase, WorkflowPhase::Failed);
}

#[tokio::test]
async fn size_limit_failure_resets_and_marks_error() {
    let h = Harness::new();
    h.submit(workflow("huge", single_container_spec()));
    h.api.fail_next_update(BackendError::RequestEntityTooLarge(
        "object too big".to_string(),
    ));
    h.reconcile("huge").await;
    let stored = h.stored("huge");
    assert_eq!(stored.status.phase, WorkflowPhase::Error);
    assert!(stored.status.message.contains("too large"));
    // the oversized node graph was discarded with the reset
    assert!(stored.status.nodes.is_empty());
}

#[tokio::test]
async fn steps_chain_outputs_between_groups() {
    let h = Harness::new();
    let steps_template = Template::new(
        "main",
        TemplateBody::Steps(vec![
            ParallelSteps(vec![WorkflowStep {
                name: "one".to_string(),
                template: Some("produce".to_string()),
                ..Default::default()
            }]),
            ParallelSteps(vec![WorkflowStep {
                name: "two".to_string(),
                template: Some("consume".to_string()),
                arguments: Arguments {
                    parameters: vec![Parameter {
                        name: "message".to_string(),
                        value: Some("{{steps.one.outputs.result}}".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            }]),
        ]),
    );
    let spec = WorkflowSpec {
        entrypoint: "main".to_string(),
        templates: vec![
            steps_template,
            container_template("produce"),
            echo_template("consume"),
        ],
        ..Default::default()
    };
    h.submit(workflow("chain", spec));

    h.reconcile("chain").await;
    let stored = h.stored("chain");
    assert_eq!(
        stored.node_by_name("chain").expect("steps node").node_type,
        NodeType::Steps
    );
    assert!(stored.node_by_name("chain[0]").is_some());
    let one_pod = h.pod_id("chain", "chain[0].one");
    assert!(h.pods.pod(&one_pod).is_some());
    // the second group must not start before the first completes
    assert!(stored.node_by_name("chain[1]").is_none());

    h.set_pod_outputs(
        &one_pod,
        &Outputs {
            result: Some("42".to_string()),
            ..Default::default()
        },
    );
    h.set_pod_finished(&one_pod, 0, h.now());
    h.reconcile("chain").await;

    let two_pod = h.pod_id("chain", "chain[1].two");
    let pod = h.pods.pod(&two_pod).expect("second step pod");
    let annotation = pod
        .annotations
        .get(foreman_model::ANNOTATION_TEMPLATE)
        .expect("template annotation");
    assert!(annotation.contains("42"), "output should flow into the next step");

    h.set_pod_finished(&two_pod, 0, h.now());
    h.reconcile("chain").await;
    let stored = h.stored("chain");
    assert_eq!(stored.status.phase, WorkflowPhase::Succeeded);
    let group = stored.node_by_name("chain[0]").expect("group node");
    assert_eq!(group.node_type, NodeType::StepGroup);
    assert_eq!(group.phase, NodePhase::Succeeded);
}

#[tokio::test]
async fn steps_skip_children_whose_when_is_false() {
    let h = Harness::new();
    let steps_template = Template::new(
        "main",
        TemplateBody::Steps(vec![ParallelSteps(vec![
            WorkflowStep {
                name: "yes".to_string(),
                template: Some("work".to_string()),
                when: Some("a == a".to_string()),
                ..Default::default()
            },
            WorkflowStep {
                name: "no".to_string(),
                template: Some("work".to_string()),
                when: Some("a == b".to_string()),
                ..Default::default()
            },
        ])]),
    );
    let spec = WorkflowSpec {
        entrypoint: "main".to_string(),
        templates: vec![steps_template, container_template("work")],
        ..Default::default()
    };
    h.submit(workflow("when", spec));
    h.reconcile("when").await;
    let stored = h.stored("when");
    let skipped = stored.node_by_name("when[0].no").expect("skipped node");
    assert_eq!(skipped.phase, NodePhase::Skipped);
    assert!(skipped.message.contains("evaluated false"));
    assert!(h.pods.pod(&h.pod_id("when", "when[0].yes")).is_some());
    assert!(h.pods.pod(&h.pod_id("when", "when[0].no")).is_none());

    h.set_pod_finished(&h.pod_id("when", "when[0].yes"), 0, h.now());
    h.reconcile("when").await;
    assert_eq!(h.stored("when").status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn steps_fan_out_over_items_and_aggregate() {
    let h = Harness::new();
    let steps_template = Template::new(
        "main",
        TemplateBody::Steps(vec![ParallelSteps(vec![WorkflowStep {
            name: "fan".to_string(),
            template: Some("consume".to_string()),
            arguments: Arguments {
                parameters: vec![Parameter {
                    name: "message".to_string(),
                    value: Some("{{item}}".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            with_items: vec![
                foreman_model::Item(serde_json::json!("apple")),
                foreman_model::Item(serde_json::json!("banana")),
            ],
            ..Default::default()
        }])]),
    );
    let spec = WorkflowSpec {
        entrypoint: "main".to_string(),
        templates: vec![steps_template, echo_template("consume")],
        ..Default::default()
    };
    h.submit(workflow("fan", spec));
    h.reconcile("fan").await;
    let stored = h.stored("fan");
    assert!(stored.node_by_name("fan[0].fan(0:apple)").is_some());
    assert!(stored.node_by_name("fan[0].fan(1:banana)").is_some());
    assert_eq!(h.pods.pod_count(), 2);

    for child in ["fan[0].fan(0:apple)", "fan[0].fan(1:banana)"] {
        h.set_pod_finished(&h.pod_id("fan", child), 0, h.now());
    }
    h.reconcile("fan").await;
    assert_eq!(h.stored("fan").status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn dag_runs_dependencies_before_dependents_and_omits_after_failure() {
    let h = Harness::new();
    let dag_template = Template::new(
        "main",
        TemplateBody::Dag(DagSpec {
            target: None,
            fail_fast: None,
            tasks: vec![
                DagTask {
                    name: "a".to_string(),
                    template: Some("work".to_string()),
                    ..Default::default()
                },
                DagTask {
                    name: "b".to_string(),
                    template: Some("work".to_string()),
                    dependencies: vec!["a".to_string()],
                    ..Default::default()
                },
            ],
        }),
    );
    let spec = WorkflowSpec {
        entrypoint: "main".to_string(),
        templates: vec![dag_template, container_template("work")],
        ..Default::default()
    };
    h.submit(workflow("dag", spec));

    h.reconcile("dag").await;
    let stored = h.stored("dag");
    assert_eq!(
        stored.node_by_name("dag").expect("dag node").node_type,
        NodeType::Dag
    );
    assert!(h.pods.pod(&h.pod_id("dag", "dag.a")).is_some());
    // b waits on a
    assert!(stored.node_by_name("dag.b").is_none());

    h.set_pod_finished(&h.pod_id("dag", "dag.a"), 1, h.now());
    h.reconcile("dag").await;
    let stored = h.stored("dag");
    let b = stored.node_by_name("dag.b").expect("b node");
    assert_eq!(b.phase, NodePhase::Omitted);
    assert_eq!(stored.status.phase, WorkflowPhase::Failed);
}

#[tokio::test]
async fn dag_diamond_completes() {
    let h = Harness::new();
    let dag_template = Template::new(
        "main",
        TemplateBody::Dag(DagSpec {
            target: None,
            fail_fast: None,
            tasks: vec![
                DagTask {
                    name: "a".to_string(),
                    template: Some("work".to_string()),
                    ..Default::default()
                },
                DagTask {
                    name: "b".to_string(),
                    template: Some("work".to_string()),
                    dependencies: vec!["a".to_string()],
                    ..Default::default()
                },
                DagTask {
                    name: "c".to_string(),
                    template: Some("work".to_string()),
                    dependencies: vec!["a".to_string()],
                    ..Default::default()
                },
                DagTask {
                    name: "d".to_string(),
                    template: Some("work".to_string()),
                    dependencies: vec!["b".to_string(), "c".to_string()],
                    ..Default::default()
                },
            ],
        }),
    );
    let spec = WorkflowSpec {
        entrypoint: "main".to_string(),
        templates: vec![dag_template, container_template("work")],
        ..Default::default()
    };
    h.submit(workflow("diamond", spec));

    h.reconcile("diamond").await;
    h.set_pod_finished(&h.pod_id("diamond", "diamond.a"), 0, h.now());
    h.reconcile("diamond").await;
    assert!(h.pods.pod(&h.pod_id("diamond", "diamond.b")).is_some());
    assert!(h.pods.pod(&h.pod_id("diamond", "diamond.c")).is_some());
    h.set_pod_finished(&h.pod_id("diamond", "diamond.b"), 0, h.now());
    h.set_pod_finished(&h.pod_id("diamond", "diamond.c"), 0, h.now());
    h.reconcile("diamond").await;
    assert!(h.pods.pod(&h.pod_id("diamond", "diamond.d")).is_some());
    h.set_pod_finished(&h.pod_id("diamond", "diamond.d"), 0, h.now());
    h.reconcile("diamond").await;
    assert_eq!(h.stored("diamond").status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn workflow_parallelism_limits_active_pods() {
    let h = Harness::new();
    let steps_template = Template::new(
        "main",
        TemplateBody::Steps(vec![ParallelSteps(vec![
            WorkflowStep {
                name: "p1".to_string(),
                template: Some("work".to_string()),
                ..Default::default()
            },
            WorkflowStep {
                name: "p2".to_string(),
                template: Some("work".to_string()),
                ..Default::default()
            },
        ])]),
    );
    let spec = WorkflowSpec {
        entrypoint: "main".to_string(),
        parallelism: Some(1),
        templates: vec![steps_template, container_template("work")],
        ..Default::default()
    };
    h.submit(workflow("narrow", spec));

    h.reconcile("narrow").await;
    // first reconciliation launches nothing beyond the first pod
    assert!(h.pods.pod_count() <= 1);

    // drive to completion one pod at a time, checking the cap throughout
    for _ in 0..6 {
        let stored = h.stored("narrow");
        let active: Vec<String> = stored
            .status
            .nodes
            .values()
            .filter(|node| node.is_active_pod())
            .map(|node| node.id.clone())
            .collect();
        assert!(active.len() <= 1, "parallelism cap violated: {active:?}");
        if stored.status.phase.completed() {
            break;
        }
        for pod_id in active {
            h.set_pod_finished(&pod_id, 0, h.now());
        }
        h.reconcile("narrow").await;
    }
    assert_eq!(h.stored("narrow").status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn suspend_auto_resumes_after_its_duration() {
    let h = Harness::new();
    let suspend = Template::new(
        "main",
        TemplateBody::Suspend(SuspendSpec {
            duration: Some("5s".to_string()),
        }),
    );
    let spec = WorkflowSpec {
        entrypoint: "main".to_string(),
        templates: vec![suspend],
        ..Default::default()
    };
    h.submit(workflow("nap", spec));

    let result = h.reconcile("nap").await;
    let stored = h.stored("nap");
    let node = stored.node_by_name("nap").expect("suspend node");
    assert_eq!(node.node_type, NodeType::Suspend);
    assert_eq!(node.phase, NodePhase::Running);
    assert_eq!(result.requeue_after, Some(Duration::from_secs(5)));

    h.clock.advance(Duration::from_secs(6));
    h.reconcile("nap").await;
    let stored = h.stored("nap");
    assert_eq!(stored.status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn workflow_level_lock_denial_postpones_processing() {
    let h = Harness::new();
    let sync = Synchronization {
        mutex: Some(MutexRef {
            name: "one-at-a-time".to_string(),
        }),
        semaphore: None,
    };
    let mut spec_a = single_container_spec();
    spec_a.synchronization = Some(sync.clone());
    let mut spec_b = single_container_spec();
    spec_b.synchronization = Some(sync);
    h.submit(workflow("holder", spec_a));
    h.submit(workflow("waiter", spec_b));

    h.reconcile("holder").await;
    h.reconcile("waiter").await;
    let waiter = h.stored("waiter");
    assert_eq!(waiter.status.phase, WorkflowPhase::Unknown);
    assert!(waiter.status.message.contains("Waiting for"));
    assert!(waiter.status.nodes.is_empty());

    // the holder finishing releases the lock for the waiter
    let pod = h.pod_id("holder", "holder");
    h.set_pod_finished(&pod, 0, h.now());
    h.reconcile("holder").await;
    assert_eq!(h.stored("holder").status.phase, WorkflowPhase::Succeeded);
    assert_eq!(h.sync.acquired_total(), h.sync.released_total());

    h.reconcile("waiter").await;
    assert_eq!(h.stored("waiter").status.phase, WorkflowPhase::Running);
}

#[tokio::test]
async fn template_level_lock_is_released_exactly_once() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.templates[0].synchronization = Some(Synchronization {
        mutex: Some(MutexRef {
            name: "tmpl-lock".to_string(),
        }),
        semaphore: None,
    });
    h.submit(workflow("locked", spec));

    h.reconcile("locked").await;
    assert_eq!(h.sync.acquired_total(), 1);
    let pod = h.pod_id("locked", "locked");
    h.set_pod_finished(&pod, 0, h.now());
    h.reconcile("locked").await;
    assert_eq!(h.stored("locked").status.phase, WorkflowPhase::Succeeded);
    assert_eq!(h.sync.acquired_total(), h.sync.released_total());
    assert_eq!(h.sync.held("default/mutex/tmpl-lock"), 0);
}

#[tokio::test]
async fn workflow_template_ref_is_frozen_into_stored_spec() {
    let h = Harness::new();
    h.templates.put_workflow_template(StoredWorkflowTemplate {
        name: "library".to_string(),
        namespace: "default".to_string(),
        spec: single_container_spec(),
    });
    let spec = WorkflowSpec {
        workflow_template_ref: Some(WorkflowTemplateRef {
            name: "library".to_string(),
            cluster_scope: false,
        }),
        ..Default::default()
    };
    h.submit(workflow("ref", spec));

    h.reconcile("ref").await;
    let stored = h.stored("ref");
    assert_eq!(stored.status.phase, WorkflowPhase::Running);
    let frozen = stored
        .status
        .stored_workflow_spec
        .as_deref()
        .expect("stored spec");
    assert_eq!(frozen.entrypoint, "main");
    assert!(h.pods.pod(&h.pod_id("ref", "ref")).is_some());

    h.set_pod_finished(&h.pod_id("ref", "ref"), 0, h.now());
    h.reconcile("ref").await;
    assert_eq!(h.stored("ref").status.phase, WorkflowPhase::Succeeded);
}

#[tokio::test]
async fn shutdown_terminate_fails_pending_work() {
    let h = Harness::new();
    h.submit(workflow("halt", single_container_spec()));
    h.reconcile("halt").await;
    assert_eq!(
        h.stored("halt").node_by_name("halt").expect("entry").phase,
        NodePhase::Pending
    );

    h.api.mutate_stored("default", "halt", |stored| {
        stored.spec.shutdown = Some(foreman_model::ShutdownStrategy::Terminate);
    });
    h.reconcile("halt").await;
    let stored = h.stored("halt");
    let entry = stored.node_by_name("halt").expect("entry");
    assert_eq!(entry.phase, NodePhase::Failed);
    assert!(entry.message.contains("Terminate"));
    assert_eq!(stored.status.phase, WorkflowPhase::Failed);
}

#[tokio::test]
async fn workflow_deadline_fails_pending_nodes() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.active_deadline_seconds = Some(30);
    h.submit(workflow("late", spec));
    h.reconcile("late").await;

    h.clock.advance(Duration::from_secs(60));
    h.reconcile("late").await;
    let stored = h.stored("late");
    let entry = stored.node_by_name("late").expect("entry");
    assert_eq!(entry.phase, NodePhase::Failed);
    assert!(entry.message.contains("deadline"));
    assert_eq!(stored.status.phase, WorkflowPhase::Failed);
}

#[tokio::test]
async fn suspended_workflow_holds_and_resumes() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.suspend = Some(true);
    h.submit(workflow("pause", spec));

    h.reconcile("pause").await;
    let stored = h.stored("pause");
    // suspension blocks the tree before any node is created
    assert!(stored.status.nodes.is_empty());
    assert_eq!(stored.status.phase, WorkflowPhase::Suspended);

    h.api.mutate_stored("default", "pause", |stored| {
        stored.spec.suspend = None;
    });
    h.reconcile("pause").await;
    let stored = h.stored("pause");
    assert_eq!(stored.status.phase, WorkflowPhase::Running);
    assert!(stored.node_by_name("pause").is_some());
}

#[tokio::test]
async fn template_timeout_fails_a_pending_node() {
    let h = Harness::new();
    let mut spec = single_container_spec();
    spec.templates[0].timeout = Some("5s".to_string());
    h.submit(workflow("slow", spec));
    h.reconcile("slow").await;

    h.clock.advance(Duration::from_secs(6));
    h.reconcile("slow").await;
    let stored = h.stored("slow");
    let entry = stored.node_by_name("slow").expect("entry node");
    assert_eq!(entry.phase, NodePhase::Failed);
    assert!(entry.message.contains("deadline"));
    assert_eq!(stored.status.phase, WorkflowPhase::Error);
}

#[tokio::test]
async fn assessment_applied_twice_is_idempotent() {
    let h = Harness::new();
    h.submit(workflow("twice", single_container_spec()));
    h.reconcile("twice").await;
    let pod = h.pod_id("twice", "twice");
    h.set_pod_running(&pod);
    h.reconcile("twice").await;
    let first = h.stored("twice");

    let updates_before = h.api.update_calls();
    h.reconcile("twice").await;
    let second = h.stored("twice");
    assert_eq!(first.status.nodes, second.status.nodes);
    // nothing changed, so nothing was persisted
    assert_eq!(h.api.update_calls(), updates_before);
}
