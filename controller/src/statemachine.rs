use models::policy::{NodeRefresh, NodeRefreshStatus, RefreshPhase};

use chrono::{DateTime, Utc};
use tracing::instrument;
use validator::Validate;

/// The action the reconciler should take for a policy, computed purely from the policy's
/// persisted state and the current time. Exactly one step is determined per reconciliation,
/// so a restart mid-cycle resumes from whatever was last persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// No cycle is due yet; check again later.
    AwaitSchedule { next_due: DateTime<Utc> },
    /// The policy cannot start a cycle until it is corrected.
    SurfaceInvalid { reason: String },
    /// A cycle is due; begin searching for target nodes.
    BeginCycle,
    /// Query the gateway for eligible nodes and populate the working set.
    FindNodes,
    /// Drain the persisted target node.
    DrainTarget { node: String },
    /// The phase claims a node is being processed but none is persisted; select one from the
    /// working set instead of wedging.
    SelectTarget,
    /// The cooldown is still running; check again at `until`.
    AwaitCooldown { until: DateTime<Utc> },
    /// The cooldown has elapsed; retire the processed node and move on.
    CompleteCooldown,
    /// The finished cycle returns to Idle.
    FinishCycle,
    /// The cycle failed and the policy has not been edited since.
    HoldFailed,
    /// The policy was edited while Failed; return to Idle.
    ResetFromEdit,
}

/// Determines the next step for a policy given its persisted phase and the current time.
#[instrument(skip(policy, now))]
pub fn determine_step(policy: &NodeRefresh, now: DateTime<Utc>) -> Step {
    let status = policy.status_or_default();

    match status.phase {
        RefreshPhase::Idle => determine_idle_step(policy, &status, now),
        RefreshPhase::FindingNodes => Step::FindNodes,
        RefreshPhase::ProcessingNode => match status.target_node.clone() {
            Some(node) => Step::DrainTarget { node },
            None => Step::SelectTarget,
        },
        RefreshPhase::WaitingCooldown => {
            let cooldown = policy.spec.cooldown();
            match status.cooldown_started_at() {
                Some(started) if now < started + cooldown => Step::AwaitCooldown {
                    until: started + cooldown,
                },
                // A missing or unreadable cooldown entry counts as elapsed; the cycle keeps
                // its progress rather than being abandoned.
                _ => Step::CompleteCooldown,
            }
        }
        RefreshPhase::Succeeded => Step::FinishCycle,
        RefreshPhase::Failed => {
            if policy.metadata.generation != status.observed_generation {
                Step::ResetFromEdit
            } else {
                Step::HoldFailed
            }
        }
    }
}

fn determine_idle_step(policy: &NodeRefresh, status: &NodeRefreshStatus, now: DateTime<Utc>) -> Step {
    if let Err(errors) = policy.spec.validate() {
        return Step::SurfaceInvalid {
            reason: errors.to_string(),
        };
    }

    match status.last_refresh_time() {
        Ok(Some(last_refresh)) => {
            let next_due = last_refresh + policy.spec.cadence();
            if now >= next_due {
                Step::BeginCycle
            } else {
                Step::AwaitSchedule { next_due }
            }
        }
        // Never refreshed, or an unreadable timestamp: a refresh is due.
        Ok(None) | Err(_) => Step::BeginCycle,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use models::policy::{NodeRefreshSpec, RefreshCondition};

    use chrono::Duration;
    use maplit::btreemap;

    pub(crate) fn policy_with_status(status: Option<NodeRefreshStatus>) -> NodeRefresh {
        let spec = NodeRefreshSpec {
            target_node_labels: btreemap! {
                "role".to_string() => "worker".to_string(),
            },
            refresh_schedule_days: 3,
            node_cooldown_seconds: 60,
        };
        let mut policy = NodeRefresh::new("refresh-workers", spec);
        policy.metadata.generation = Some(1);
        policy.status = status;
        policy
    }

    fn status_in_phase(phase: RefreshPhase) -> NodeRefreshStatus {
        NodeRefreshStatus {
            phase,
            observed_generation: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_policy_begins_cycle() {
        let policy = policy_with_status(None);
        assert_eq!(determine_step(&policy, Utc::now()), Step::BeginCycle);
    }

    #[test]
    fn cycle_is_due_only_after_cadence_elapses() {
        let now = Utc::now();
        let cadence = Duration::days(3);

        let mut not_due = status_in_phase(RefreshPhase::Idle);
        not_due.last_refresh_at = Some((now - cadence + Duration::minutes(1)).to_rfc3339());
        let policy = policy_with_status(Some(not_due));
        assert!(matches!(
            determine_step(&policy, now),
            Step::AwaitSchedule { .. }
        ));

        let mut due = status_in_phase(RefreshPhase::Idle);
        due.last_refresh_at = Some((now - cadence - Duration::minutes(1)).to_rfc3339());
        let policy = policy_with_status(Some(due));
        assert_eq!(determine_step(&policy, now), Step::BeginCycle);
    }

    #[test]
    fn unreadable_last_refresh_counts_as_due() {
        let mut status = status_in_phase(RefreshPhase::Idle);
        status.last_refresh_at = Some("not-a-timestamp".to_string());
        let policy = policy_with_status(Some(status));
        assert_eq!(determine_step(&policy, Utc::now()), Step::BeginCycle);
    }

    #[test]
    fn invalid_spec_never_leaves_idle() {
        let mut policy = policy_with_status(None);
        policy.spec.refresh_schedule_days = 0;
        assert!(matches!(
            determine_step(&policy, Utc::now()),
            Step::SurfaceInvalid { .. }
        ));

        let mut policy = policy_with_status(None);
        policy.spec.target_node_labels.clear();
        assert!(matches!(
            determine_step(&policy, Utc::now()),
            Step::SurfaceInvalid { .. }
        ));
    }

    #[test]
    fn finding_nodes_queries_the_gateway() {
        let policy = policy_with_status(Some(status_in_phase(RefreshPhase::FindingNodes)));
        assert_eq!(determine_step(&policy, Utc::now()), Step::FindNodes);
    }

    #[test]
    fn persisted_target_is_drained_on_resume() {
        let mut status = status_in_phase(RefreshPhase::ProcessingNode);
        status.target_node = Some("node-a".to_string());
        status.remaining_nodes = vec!["node-a".to_string(), "node-b".to_string()];
        let policy = policy_with_status(Some(status));

        assert_eq!(
            determine_step(&policy, Utc::now()),
            Step::DrainTarget {
                node: "node-a".to_string()
            }
        );
    }

    #[test]
    fn missing_target_is_repaired_by_reselection() {
        let mut status = status_in_phase(RefreshPhase::ProcessingNode);
        status.remaining_nodes = vec!["node-a".to_string()];
        let policy = policy_with_status(Some(status));
        assert_eq!(determine_step(&policy, Utc::now()), Step::SelectTarget);
    }

    #[test]
    fn cooldown_holds_until_elapsed() {
        let now = Utc::now();

        let mut status = status_in_phase(RefreshPhase::WaitingCooldown);
        status.target_node = Some("node-a".to_string());
        status.remaining_nodes = vec!["node-a".to_string()];
        status.conditions = vec![RefreshCondition::new(
            now - Duration::seconds(30),
            RefreshPhase::WaitingCooldown,
            "cooling down".to_string(),
        )];
        let policy = policy_with_status(Some(status.clone()));
        assert!(matches!(
            determine_step(&policy, now),
            Step::AwaitCooldown { .. }
        ));

        status.conditions = vec![RefreshCondition::new(
            now - Duration::seconds(90),
            RefreshPhase::WaitingCooldown,
            "cooling down".to_string(),
        )];
        let policy = policy_with_status(Some(status));
        assert_eq!(determine_step(&policy, now), Step::CompleteCooldown);
    }

    #[test]
    fn cooldown_without_bookkeeping_counts_as_elapsed() {
        let mut status = status_in_phase(RefreshPhase::WaitingCooldown);
        status.target_node = Some("node-a".to_string());
        status.remaining_nodes = vec!["node-a".to_string()];
        let policy = policy_with_status(Some(status));
        assert_eq!(determine_step(&policy, Utc::now()), Step::CompleteCooldown);
    }

    #[test]
    fn succeeded_returns_to_idle() {
        let policy = policy_with_status(Some(status_in_phase(RefreshPhase::Succeeded)));
        assert_eq!(determine_step(&policy, Utc::now()), Step::FinishCycle);
    }

    #[test]
    fn failed_holds_until_the_policy_is_edited() {
        let policy = policy_with_status(Some(status_in_phase(RefreshPhase::Failed)));
        assert_eq!(determine_step(&policy, Utc::now()), Step::HoldFailed);

        let mut policy = policy_with_status(Some(status_in_phase(RefreshPhase::Failed)));
        policy.metadata.generation = Some(2);
        assert_eq!(determine_step(&policy, Utc::now()), Step::ResetFromEdit);
    }
}
