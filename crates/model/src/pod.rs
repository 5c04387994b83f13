//! Observed pod snapshots, as delivered by the PodManager.
//!
//! The operator never talks to a cluster; it sees pods only through this
//! narrow snapshot shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const INIT_CONTAINER_NAME: &str = "init";
pub const MAIN_CONTAINER_NAME: &str = "main";
pub const WAIT_CONTAINER_NAME: &str = "wait";

/// Exit code the wait sidecar uses for its own internal failures, as opposed
/// to the sub-process failing.
pub const SIDECAR_INTERNAL_EXIT_CODE: i32 = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerState {
    Waiting {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        message: String,
    },
    Running {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        exit_code: i32,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished_at: Option<DateTime<Utc>>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
    pub state: ContainerState,
}

impl ContainerStatus {
    pub fn terminated_exit_code(&self) -> Option<i32> {
        match &self.state {
            ContainerState::Terminated { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn terminated_finished_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            ContainerState::Terminated { finished_at, .. } => *finished_at,
            _ => None,
        }
    }
}

/// Unschedulable condition reason surfaced on pending pods.
pub const POD_REASON_UNSCHEDULABLE: &str = "Unschedulable";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSnapshot {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PodCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_container_statuses: Vec<ContainerStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,
    /// Per-resource seconds consumed, reported by the runtime.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources_duration: BTreeMap<String, i64>,
}

impl PodSnapshot {
    pub fn container(&self, name: &str) -> Option<&ContainerStatus> {
        self.container_statuses
            .iter()
            .find(|status| status.name == name)
    }

    /// Exit code of the main container, once terminated.
    pub fn main_exit_code(&self) -> Option<i32> {
        self.container(MAIN_CONTAINER_NAME)
            .and_then(ContainerStatus::terminated_exit_code)
    }

    /// Latest terminated-at across every container of the pod.
    pub fn latest_finished_at(&self) -> Option<DateTime<Utc>> {
        self.init_container_statuses
            .iter()
            .chain(self.container_statuses.iter())
            .filter_map(ContainerStatus::terminated_finished_at)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminated(name: &str, exit_code: i32, finished_at: Option<DateTime<Utc>>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready: false,
            state: ContainerState::Terminated {
                exit_code,
                reason: String::new(),
                message: String::new(),
                finished_at,
            },
        }
    }

    #[test]
    fn latest_finished_at_spans_init_and_app_containers() {
        let early = "2026-01-01T00:00:00Z".parse().expect("timestamp");
        let late = "2026-01-01T00:05:00Z".parse().expect("timestamp");
        let pod = PodSnapshot {
            name: "p".to_string(),
            init_container_statuses: vec![terminated(INIT_CONTAINER_NAME, 0, Some(late))],
            container_statuses: vec![terminated(MAIN_CONTAINER_NAME, 0, Some(early))],
            ..Default::default()
        };
        assert_eq!(pod.latest_finished_at(), Some(late));
        assert_eq!(pod.main_exit_code(), Some(0));
    }
}
