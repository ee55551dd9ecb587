use crate::error::{self, Result};

use models::node::DrainObserver;
use models::policy::{NodeRefresh, NodeRefreshStatus, PolicyClient, RefreshCondition, RefreshPhase};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::ResultExt;
use tracing::{event, Level};

/// A change to apply to a policy's status. The constructors maintain the status invariants:
/// a target node is carried exactly in ProcessingNode and WaitingCooldown, and the working set
/// is carried only while a cycle is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    phase: RefreshPhase,
    target_node: Option<String>,
    remaining_nodes: Vec<String>,
    set_last_refresh: bool,
    message: String,
}

impl Transition {
    /// Return to Idle: a finished cycle, a reset after failure, or a fresh object.
    pub fn idle(message: String) -> Self {
        Transition {
            phase: RefreshPhase::Idle,
            target_node: None,
            remaining_nodes: vec![],
            set_last_refresh: false,
            message,
        }
    }

    /// A cycle is due and node discovery begins.
    pub fn finding_nodes(message: String) -> Self {
        Transition {
            phase: RefreshPhase::FindingNodes,
            target_node: None,
            remaining_nodes: vec![],
            set_last_refresh: false,
            message,
        }
    }

    /// A node was selected and is being refreshed.
    pub fn processing(target: String, remaining: Vec<String>, message: String) -> Self {
        Transition {
            phase: RefreshPhase::ProcessingNode,
            target_node: Some(target),
            remaining_nodes: remaining,
            set_last_refresh: false,
            message,
        }
    }

    /// The target node was refreshed; the cycle pauses before the next one.
    pub fn cooldown(target: String, remaining: Vec<String>, message: String) -> Self {
        Transition {
            phase: RefreshPhase::WaitingCooldown,
            target_node: Some(target),
            remaining_nodes: remaining,
            set_last_refresh: false,
            message,
        }
    }

    /// Every eligible node was refreshed; stamps the completion time.
    pub fn succeeded(message: String) -> Self {
        Transition {
            phase: RefreshPhase::Succeeded,
            target_node: None,
            remaining_nodes: vec![],
            set_last_refresh: true,
            message,
        }
    }

    /// The cycle hit a fatal error and stops until externally remediated.
    pub fn failed(message: String) -> Self {
        Transition {
            phase: RefreshPhase::Failed,
            target_node: None,
            remaining_nodes: vec![],
            set_last_refresh: false,
            message,
        }
    }
}

/// Projects a transition onto the current status, appending one condition entry. Pure; the
/// caller persists the result.
pub fn project(
    current: &NodeRefreshStatus,
    transition: &Transition,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> NodeRefreshStatus {
    let mut next = current.clone();
    next.phase = transition.phase;
    next.target_node = transition.target_node.clone();
    next.remaining_nodes = transition.remaining_nodes.clone();
    if transition.set_last_refresh {
        next.last_refresh_at = Some(now.to_rfc3339());
    }
    next.observed_generation = observed_generation;
    next.conditions.push(RefreshCondition::new(
        now,
        transition.phase,
        transition.message.clone(),
    ));
    next
}

/// Appends a condition without changing anything else about the cycle.
pub fn annotate(
    current: &NodeRefreshStatus,
    message: String,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) -> NodeRefreshStatus {
    let mut next = current.clone();
    next.observed_generation = observed_generation;
    next.conditions
        .push(RefreshCondition::new(now, current.phase, message));
    next
}

/// Renders the reconciler's decisions into the externally visible status record. Owns the most
/// recently persisted copy of the policy so that consecutive writes within one reconciliation
/// carry the right resourceVersion. Never decides transitions itself.
pub struct StatusReporter<P: PolicyClient> {
    client: P,
    policy: NodeRefresh,
}

impl<P: PolicyClient> StatusReporter<P> {
    pub fn new(client: P, policy: NodeRefresh) -> Self {
        StatusReporter { client, policy }
    }

    /// The most recently persisted status.
    pub fn status(&self) -> NodeRefreshStatus {
        self.policy.status_or_default()
    }

    /// Applies a phase transition and persists it.
    pub async fn transition(&mut self, transition: Transition) -> Result<()> {
        let next = project(
            &self.status(),
            &transition,
            self.policy.metadata.generation,
            Utc::now(),
        );
        event!(Level::INFO, phase = %next.phase, "NodeRefresh phase transition");
        self.persist(next).await
    }

    /// Appends a condition describing progress within the current phase.
    pub async fn note(&mut self, message: String) -> Result<()> {
        let next = annotate(
            &self.status(),
            message,
            self.policy.metadata.generation,
            Utc::now(),
        );
        self.persist(next).await
    }

    /// Appends a condition only if it differs from the most recent entry, keeping a repeated
    /// failure from growing the log without bound.
    pub async fn note_once(&mut self, message: String) -> Result<()> {
        if self.status().latest_condition_message() == Some(message.as_str()) {
            return Ok(());
        }
        self.note(message).await
    }

    async fn persist(&mut self, next: NodeRefreshStatus) -> Result<()> {
        self.policy = self
            .client
            .update_status(&self.policy, &next)
            .await
            .context(error::UpdateStatusSnafu)?;
        Ok(())
    }
}

#[async_trait]
impl<P: PolicyClient> DrainObserver for StatusReporter<P> {
    async fn observe(&mut self, message: String) {
        // Drain progress is best-effort observability; a failed write must not abort the
        // drain mid-node.
        if let Err(err) = self.note(message).await {
            event!(Level::WARN, "Unable to record drain progress: '{}'", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_status() -> NodeRefreshStatus {
        NodeRefreshStatus {
            phase: RefreshPhase::ProcessingNode,
            target_node: Some("node-a".to_string()),
            remaining_nodes: vec!["node-a".to_string(), "node-b".to_string()],
            conditions: vec![RefreshCondition::new(
                Utc::now(),
                RefreshPhase::FindingNodes,
                "searching".to_string(),
            )],
            ..Default::default()
        }
    }

    fn all_transitions() -> Vec<Transition> {
        vec![
            Transition::idle("idle".to_string()),
            Transition::finding_nodes("finding".to_string()),
            Transition::processing(
                "node-a".to_string(),
                vec!["node-a".to_string()],
                "processing".to_string(),
            ),
            Transition::cooldown(
                "node-a".to_string(),
                vec!["node-a".to_string()],
                "cooling".to_string(),
            ),
            Transition::succeeded("done".to_string()),
            Transition::failed("broken".to_string()),
        ]
    }

    #[test]
    fn target_node_is_set_exactly_in_processing_phases() {
        let now = Utc::now();
        for transition in all_transitions() {
            let next = project(&base_status(), &transition, Some(1), now);
            assert_eq!(
                next.target_node.is_some(),
                next.phase.holds_target(),
                "phase {} must carry a target iff it processes a node",
                next.phase
            );
        }
    }

    #[test]
    fn working_set_is_empty_outside_running_phases() {
        let now = Utc::now();
        for transition in all_transitions() {
            let next = project(&base_status(), &transition, Some(1), now);
            match next.phase {
                RefreshPhase::Idle | RefreshPhase::Succeeded | RefreshPhase::Failed => {
                    assert!(next.remaining_nodes.is_empty())
                }
                _ => {}
            }
        }
    }

    #[test]
    fn conditions_are_append_only() {
        let now = Utc::now();
        let current = base_status();
        let next = project(
            &current,
            &Transition::succeeded("done".to_string()),
            Some(1),
            now,
        );

        assert_eq!(next.conditions.len(), current.conditions.len() + 1);
        assert_eq!(next.conditions[..current.conditions.len()], current.conditions[..]);
        let appended = next.conditions.last().unwrap();
        assert_eq!(appended.phase, RefreshPhase::Succeeded);
        assert_eq!(appended.message, "done");
    }

    #[test]
    fn only_success_stamps_last_refresh() {
        let now = Utc::now();
        for transition in all_transitions() {
            let next = project(&base_status(), &transition, Some(1), now);
            match next.phase {
                RefreshPhase::Succeeded => assert_eq!(next.last_refresh_at, Some(now.to_rfc3339())),
                _ => assert_eq!(next.last_refresh_at, None),
            }
        }
    }

    #[test]
    fn observed_generation_is_stamped_on_every_projection() {
        let next = project(
            &base_status(),
            &Transition::failed("broken".to_string()),
            Some(7),
            Utc::now(),
        );
        assert_eq!(next.observed_generation, Some(7));
    }

    #[test]
    fn annotate_changes_nothing_but_conditions() {
        let now = Utc::now();
        let current = base_status();
        let next = annotate(&current, "drain progress".to_string(), Some(1), now);

        assert_eq!(next.phase, current.phase);
        assert_eq!(next.target_node, current.target_node);
        assert_eq!(next.remaining_nodes, current.remaining_nodes);
        assert_eq!(next.conditions.len(), current.conditions.len() + 1);
        assert_eq!(next.conditions.last().unwrap().phase, current.phase);
    }
}
