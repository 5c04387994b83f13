//! Retry planning: succeed, fail, wait out a backoff, or spawn another child.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use foreman_model::{NodePhase, NodeStatus, RetryPolicy, RetryStrategy};

use crate::config::parse_duration;
use crate::error::{message_is_transient, OperateError};

use super::{ExecuteOpts, WorkflowOperation};

/// Wait before the K-th retry: `duration * factor^(K-1)`; factor 0 keeps the
/// wait constant.
pub(crate) fn backoff_wait(base: Duration, factor: u32, attempts: usize) -> Duration {
    if factor == 0 || attempts <= 1 {
        return base;
    }
    let multiplier = (factor as u64).saturating_pow((attempts - 1) as u32);
    base.saturating_mul(multiplier.min(u32::MAX as u64) as u32)
}

fn classify_retry(policy: RetryPolicy, last_child: &NodeStatus) -> (bool, bool) {
    match policy {
        RetryPolicy::Always => (true, true),
        RetryPolicy::OnFailure => (true, false),
        RetryPolicy::OnError => (false, true),
        RetryPolicy::OnTransientError => {
            if last_child.failed_or_error() && message_is_transient(&last_child.message) {
                (true, true)
            } else {
                (false, false)
            }
        }
    }
}

impl<'a> WorkflowOperation<'a> {
    /// Decides the fate of a Retry node from its children and the strategy.
    ///
    /// Returns the parent's latest snapshot and whether execution should
    /// continue. `false` means the node is waiting out a backoff and the
    /// caller returns immediately; a finalized parent comes back with
    /// `true` and a terminal phase on the snapshot.
    pub(crate) fn process_node_retries(
        &mut self,
        node_name: &str,
        strategy: &RetryStrategy,
        opts: &mut ExecuteOpts,
    ) -> Result<(NodeStatus, bool), OperateError> {
        let node_id = self.wf.node_id(node_name);
        let node = self
            .wf
            .status
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or_else(|| {
                OperateError::InvariantViolation(format!("retry node {node_name} uninitialized"))
            })?;
        if node.fulfilled() {
            return Ok((node, true));
        }
        let Some(last_child) = self.wf.status.nodes.child_at(&node, -1).cloned() else {
            // first attempt not spawned yet
            return Ok((node, true));
        };
        if !last_child.fulfilled() {
            return Ok((node, true));
        }

        if !last_child.failed_or_error() {
            let node_id = node.id.clone();
            if let Some(parent) = self.wf.status.nodes.get_mut(&node_id) {
                parent.outputs = last_child.outputs.clone();
                self.updated = true;
            }
            let marked = self.mark_node_phase(node_name, NodePhase::Succeeded, None)?;
            return Ok((marked, true));
        }

        if self.exec_spec.shutdown.is_some() || self.past_workflow_deadline() {
            let message = match self.exec_spec.shutdown {
                Some(strategy) => format!("Stopped with strategy '{strategy}'"),
                None => format!(
                    "retry exceeded workflow deadline {}",
                    self.workflow_deadline.expect("deadline passed")
                ),
            };
            info!(node = %node_name, message = %message, "halting retries");
            let marked = self.mark_node_phase(node_name, last_child.phase, Some(&message))?;
            return Ok((marked, true));
        }

        if let Some(backoff) = &strategy.backoff {
            let mut max_duration_deadline: Option<DateTime<Utc>> = None;
            if let Some(max_raw) = &backoff.max_duration {
                if !node.children.is_empty() {
                    let max_duration = parse_duration(max_raw)?;
                    let first_child =
                        self.wf.status.nodes.child_at(&node, 0).ok_or_else(|| {
                            OperateError::InvariantViolation(format!(
                                "retry node {node_name} has children but no first child"
                            ))
                        })?;
                    let started = first_child.started_at.ok_or_else(|| {
                        OperateError::InvariantViolation(format!(
                            "retry child {} has no start time",
                            first_child.name
                        ))
                    })?;
                    let deadline =
                        started + chrono::Duration::from_std(max_duration).unwrap_or_default();
                    if self.now() > deadline {
                        info!(node = %node_name, "max duration limit exceeded, failing");
                        let marked = self.mark_node_phase(
                            node_name,
                            last_child.phase,
                            Some("Max duration limit exceeded"),
                        )?;
                        return Ok((marked, true));
                    }
                    max_duration_deadline = Some(deadline);
                }
            }

            let base_raw = backoff.duration.as_deref().ok_or_else(|| {
                OperateError::Validation("no base duration specified for retry backoff".to_string())
            })?;
            let base = parse_duration(base_raw)?;
            let wait = backoff_wait(base, backoff.factor.unwrap_or(0), node.children.len());
            let finished = last_child.finished_at.unwrap_or_else(|| self.now());
            let waiting_deadline =
                finished + chrono::Duration::from_std(wait).unwrap_or_default();

            if let Some(max_deadline) = max_duration_deadline {
                if waiting_deadline > max_deadline {
                    info!(node = %node_name, "backoff would exceed max duration limit, failing");
                    let marked = self.mark_node_phase(
                        node_name,
                        last_child.phase,
                        Some("Backoff would exceed max duration limit"),
                    )?;
                    return Ok((marked, true));
                }
            }

            if self.now() < waiting_deadline {
                self.requeue_after(wait);
                let message = format!("Backoff for {}s", wait.as_secs());
                let marked = self.mark_node_phase(node_name, node.phase, Some(&message))?;
                return Ok((marked, false));
            }

            if let Some(max_deadline) = max_duration_deadline {
                opts.execution_deadline = Some(max_deadline);
            }
            self.mark_node_phase(node_name, node.phase, Some(""))?;
        }

        let policy = strategy.retry_policy.unwrap_or_default();
        let (retry_on_failed, retry_on_error) = classify_retry(policy, &last_child);
        if (last_child.phase == NodePhase::Failed && !retry_on_failed)
            || (last_child.phase == NodePhase::Error && !retry_on_error)
        {
            info!(node = %node_name, phase = %last_child.phase, "policy does not retry this phase");
            let marked =
                self.mark_node_phase(node_name, last_child.phase, Some(&last_child.message))?;
            return Ok((marked, true));
        }

        if !last_child.can_retry() {
            let marked =
                self.mark_node_phase(node_name, last_child.phase, Some(&last_child.message))?;
            return Ok((marked, true));
        }

        if let Some(limit) = strategy.limit {
            if node.children.len() as u32 > limit {
                info!(node = %node_name, limit, "no more retries left");
                let marked = self.mark_node_phase(
                    node_name,
                    last_child.phase,
                    Some("No more retries left"),
                )?;
                return Ok((marked, true));
            }
        }

        info!(
            node = %node_name,
            failed_children = node.children.len(),
            "spawning another retry attempt"
        );
        Ok((node, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically() {
        let base = Duration::from_secs(10);
        assert_eq!(backoff_wait(base, 2, 1), Duration::from_secs(10));
        assert_eq!(backoff_wait(base, 2, 2), Duration::from_secs(20));
        assert_eq!(backoff_wait(base, 2, 3), Duration::from_secs(40));
    }

    #[test]
    fn zero_factor_keeps_the_wait_constant() {
        let base = Duration::from_secs(7);
        for attempts in 1..5 {
            assert_eq!(backoff_wait(base, 0, attempts), base);
        }
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn wait_follows_the_geometric_formula(
                base_secs in 1u64..3600,
                factor in 0u32..5,
                attempts in 1usize..8,
            ) {
                let wait = backoff_wait(Duration::from_secs(base_secs), factor, attempts);
                let expected = if factor == 0 {
                    base_secs
                } else {
                    base_secs * (factor as u64).pow((attempts - 1) as u32)
                };
                prop_assert_eq!(wait, Duration::from_secs(expected));
            }

            #[test]
            fn wait_never_shrinks_with_more_attempts(
                base_secs in 1u64..600,
                factor in 1u32..4,
                attempts in 1usize..6,
            ) {
                let earlier = backoff_wait(Duration::from_secs(base_secs), factor, attempts);
                let later = backoff_wait(Duration::from_secs(base_secs), factor, attempts + 1);
                prop_assert!(later >= earlier);
            }
        }
    }

    #[test]
    fn classify_on_transient_error_requires_a_transient_message() {
        let mut child = NodeStatus {
            phase: NodePhase::Error,
            message: "connection refused".to_string(),
            ..Default::default()
        };
        assert_eq!(
            classify_retry(RetryPolicy::OnTransientError, &child),
            (true, true)
        );
        child.message = "exit status 1".to_string();
        assert_eq!(
            classify_retry(RetryPolicy::OnTransientError, &child),
            (false, false)
        );
    }
}
