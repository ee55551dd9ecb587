mod client;
mod error;

pub use self::client::*;
pub use self::error::Error as NodeRefreshError;
use self::error::Result;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::fmt;
use validator::{Validate, ValidationError};

#[cfg(feature = "mockall")]
pub use self::client::MockPolicyClient;

/// RefreshPhase tracks a refresh cycle's position in the node-refresh state machine.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
pub enum RefreshPhase {
    /// No cycle is running. This is both the starting state and the state between cycles.
    Idle,
    /// A cycle is due and the controller is querying the cluster for eligible target nodes.
    FindingNodes,
    /// One node has been selected and is being cordoned and drained.
    ProcessingNode,
    /// The selected node has been refreshed; the controller is pausing before the next node.
    WaitingCooldown,
    /// All eligible nodes have been refreshed in this cycle.
    Succeeded,
    /// The cycle hit a fatal error and requires operator intervention or a policy edit.
    Failed,
}

impl Default for RefreshPhase {
    fn default() -> Self {
        RefreshPhase::Idle
    }
}

impl RefreshPhase {
    /// Returns whether a node is expected to be held in `targetNode` while in this phase.
    pub fn holds_target(&self) -> bool {
        matches!(self, Self::ProcessingNode | Self::WaitingCooldown)
    }
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Idle => "Idle",
            Self::FindingNodes => "FindingNodes",
            Self::ProcessingNode => "ProcessingNode",
            Self::WaitingCooldown => "WaitingCooldown",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        write!(f, "{}", phase)
    }
}

/// One entry in the append-only observability log kept in a NodeRefresh's status.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCondition {
    /// RFC 3339 timestamp at which the condition was recorded.
    pub timestamp: String,
    /// The phase the cycle was in when the condition was recorded.
    pub phase: RefreshPhase,
    /// Human-readable description of what happened.
    pub message: String,
}

impl RefreshCondition {
    pub fn new(timestamp: DateTime<Utc>, phase: RefreshPhase, message: String) -> Self {
        RefreshCondition {
            timestamp: timestamp.to_rfc3339(),
            phase,
            message,
        }
    }

    /// The recorded timestamp as a DateTime. JsonSchema cannot appropriately handle DateTime
    /// objects, so conditions store RFC 3339 strings.
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|ts| ts.into())
            .context(error::TimestampFormatSnafu)
    }
}

/// The `NodeRefreshSpec` declares a refresh intent: which nodes to cycle, how often a cycle
/// runs, and how long to pause between consecutive nodes within one cycle. The controller
/// drives matching nodes through cordon, drain and uncordon and records its progress in
/// `NodeRefreshStatus`.
#[derive(
    Clone,
    CustomResource,
    Serialize,
    Deserialize,
    Debug,
    Default,
    Eq,
    PartialEq,
    JsonSchema,
    Validate,
)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "stable.example.com",
    kind = "NodeRefresh",
    namespaced,
    plural = "noderefreshes",
    shortname = "nrf",
    singular = "noderefresh",
    status = "NodeRefreshStatus",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Target Node", "type":"string", "jsonPath":".status.targetNode"}"#,
    printcolumn = r#"{"name":"Last Refresh", "type":"string", "jsonPath":".status.lastRefreshAt"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshSpec {
    /// Labels a node must carry to be eligible for refreshing.
    #[validate(custom = "validate_target_labels")]
    pub target_node_labels: BTreeMap<String, String>,
    /// Days between refresh cycles.
    #[validate(range(min = 1))]
    pub refresh_schedule_days: u32,
    /// Seconds to pause between consecutive node refreshes within one cycle.
    pub node_cooldown_seconds: u64,
}

fn validate_target_labels(labels: &BTreeMap<String, String>) -> std::result::Result<(), ValidationError> {
    if labels.is_empty() {
        return Err(ValidationError::new("targetNodeLabels must not be empty"));
    }
    if labels.keys().any(|key| key.is_empty()) {
        return Err(ValidationError::new("targetNodeLabels keys must not be empty"));
    }
    Ok(())
}

impl NodeRefreshSpec {
    /// The duration between refresh cycles.
    pub fn cadence(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.refresh_schedule_days))
    }

    /// The pause between consecutive node refreshes.
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.node_cooldown_seconds as i64)
    }
}

impl NodeRefresh {
    /// Returns the status, or the starting status for an object that has never been reconciled.
    pub fn status_or_default(&self) -> NodeRefreshStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// `NodeRefreshStatus` is the single record of a refresh cycle's progress. It is mutated only
/// by the controller; everything needed to resume a cycle after a restart is persisted here.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeRefreshStatus {
    pub phase: RefreshPhase,
    /// The node currently being processed. Set exactly while the phase is ProcessingNode or
    /// WaitingCooldown.
    pub target_node: Option<String>,
    /// RFC 3339 timestamp of the last completed cycle; the next cycle is due at
    /// `lastRefreshAt + refreshScheduleDays`.
    pub last_refresh_at: Option<String>,
    /// Eligible nodes not yet refreshed in the current cycle.
    #[serde(default)]
    pub remaining_nodes: Vec<String>,
    /// Append-only log of cycle progress.
    #[serde(default)]
    pub conditions: Vec<RefreshCondition>,
    /// The policy generation most recently acted upon.
    pub observed_generation: Option<i64>,
}

impl NodeRefreshStatus {
    /// The last completed cycle's timestamp as a DateTime.
    pub fn last_refresh_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.last_refresh_at
            .as_ref()
            .map(|ts_str| {
                DateTime::parse_from_rfc3339(ts_str)
                    .map(|ts| ts.into())
                    .context(error::TimestampFormatSnafu)
            })
            .transpose()
    }

    /// The instant the current cooldown began, taken from the most recent WaitingCooldown
    /// condition entry. Conditions are append-only, so the entry survives for the lifetime
    /// of the object.
    pub fn cooldown_started_at(&self) -> Option<DateTime<Utc>> {
        self.conditions
            .iter()
            .rev()
            .find(|condition| condition.phase == RefreshPhase::WaitingCooldown)
            .and_then(|condition| condition.timestamp().ok())
    }

    /// The message of the most recently appended condition, if any.
    pub fn latest_condition_message(&self) -> Option<&str> {
        self.conditions
            .last()
            .map(|condition| condition.message.as_str())
    }
}
