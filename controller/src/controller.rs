use crate::error::{self, Error, Result};
use crate::metrics::RefreshControllerMetrics;
use crate::statemachine::{determine_step, Step};
use crate::status::{StatusReporter, Transition};

use models::node::{drain_node, NodeGateway};
use models::policy::{NodeRefresh, PolicyClient};

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use rand::seq::SliceRandom;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

// The fallback interval at which a policy is re-examined when nothing else triggers a
// reconciliation. Much shorter than any valid cadence.
const REQUEUE_INTERVAL: Duration = Duration::from_secs(60);

// Requeue delay after an errored reconciliation.
const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// State shared by every reconciliation: the cluster-facing seams, the identity of the node
/// hosting this controller, and metrics.
pub struct Context<G, P> {
    pub gateway: G,
    pub policy_client: P,
    pub own_node_name: String,
    pub metrics: RefreshControllerMetrics,
}

/// The serialized reconciliation entry point for one NodeRefresh policy.
///
/// Both trigger sources (watch events on the policy object and requeue timers) funnel into
/// this function; the controller runtime guarantees that no two invocations for the same
/// policy run concurrently, while distinct policies reconcile independently.
///
/// At most one phase transition is performed per invocation. The status write itself raises a
/// watch event, which drives the next invocation; waits (cadence, cooldown) are realized as
/// requeues rather than in-process sleeps.
#[instrument(skip(policy, ctx), fields(name = %policy.name_any()))]
pub async fn reconcile<G, P>(policy: Arc<NodeRefresh>, ctx: Arc<Context<G, P>>) -> Result<Action>
where
    G: NodeGateway,
    P: PolicyClient,
{
    ctx.metrics.observe_policy(&policy);
    let step = determine_step(&policy, Utc::now());
    let mut reporter = StatusReporter::new(ctx.policy_client.clone(), (*policy).clone());

    match step {
        Step::AwaitSchedule { next_due } => {
            event!(Level::INFO, next_due = %next_due.to_rfc3339(), "Refresh not yet due.");
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::SurfaceInvalid { reason } => {
            reporter
                .note_once(format!("Refresh cycle not started: {}", reason))
                .await?;
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::BeginCycle => {
            reporter
                .transition(Transition::finding_nodes(
                    "Refresh cycle is due; finding eligible target nodes.".to_string(),
                ))
                .await?;
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::FindNodes => {
            find_nodes(&mut reporter, &policy, &ctx).await?;
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::SelectTarget => {
            let remaining = reporter.status().remaining_nodes;
            match select_target(&remaining) {
                Some(target) => {
                    let message = format!("Re-selected node '{}' for refresh.", target);
                    reporter
                        .transition(Transition::processing(target, remaining, message))
                        .await?;
                }
                None => {
                    reporter
                        .transition(Transition::finding_nodes(
                            "Working set was empty while processing; finding target nodes again."
                                .to_string(),
                        ))
                        .await?;
                }
            }
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::DrainTarget { node } => {
            event!(Level::INFO, node = %node, "Refreshing node.");
            match drain_node(&ctx.gateway, &node, &mut reporter).await {
                Ok(()) => {
                    let remaining = reporter.status().remaining_nodes;
                    let cooldown = policy.spec.cooldown().to_std().unwrap_or_default();
                    reporter
                        .transition(Transition::cooldown(
                            node.clone(),
                            remaining,
                            format!(
                                "Node '{}' refreshed; cooling down for {}s.",
                                node, policy.spec.node_cooldown_seconds
                            ),
                        ))
                        .await?;
                    Ok(Action::requeue(cooldown.max(Duration::from_secs(1))))
                }
                Err(drain_error) => {
                    reporter
                        .transition(Transition::failed(format!(
                            "Refresh of node '{}' failed: {}",
                            node, drain_error
                        )))
                        .await?;
                    Ok(Action::requeue(REQUEUE_INTERVAL))
                }
            }
        }
        Step::AwaitCooldown { until } => {
            let wait = (until - Utc::now())
                .to_std()
                .unwrap_or_default()
                .max(Duration::from_secs(1));
            Ok(Action::requeue(wait))
        }
        Step::CompleteCooldown => {
            let status = reporter.status();
            let processed = status.target_node;
            let remaining: Vec<String> = status
                .remaining_nodes
                .into_iter()
                .filter(|name| processed.as_deref() != Some(name.as_str()))
                .collect();

            match select_target(&remaining) {
                None => {
                    reporter
                        .transition(Transition::succeeded(
                            "All eligible nodes refreshed; cycle complete.".to_string(),
                        ))
                        .await?;
                }
                Some(target) => {
                    let message = format!(
                        "Cooldown finished; selected node '{}' for refresh ({} nodes remaining).",
                        target,
                        remaining.len()
                    );
                    reporter
                        .transition(Transition::processing(target, remaining, message))
                        .await?;
                }
            }
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::FinishCycle => {
            let next_due = reporter
                .status()
                .last_refresh_time()
                .ok()
                .flatten()
                .map(|last_refresh| last_refresh + policy.spec.cadence());
            let message = match next_due {
                Some(due) => format!("Cycle complete; next refresh due at {}.", due.to_rfc3339()),
                None => "Cycle complete.".to_string(),
            };
            reporter.transition(Transition::idle(message)).await?;
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::ResetFromEdit => {
            reporter
                .transition(Transition::idle(
                    "Policy was updated; leaving Failed state.".to_string(),
                ))
                .await?;
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
        Step::HoldFailed => {
            event!(
                Level::DEBUG,
                "Cycle is Failed; waiting for the policy to be edited."
            );
            Ok(Action::requeue(REQUEUE_INTERVAL))
        }
    }
}

/// Called by the controller runtime when `reconcile` errors; the tick is retried with freshly
/// observed state after a short delay.
pub fn error_policy<G, P>(policy: Arc<NodeRefresh>, error: &Error, _ctx: Arc<Context<G, P>>) -> Action
where
    G: NodeGateway,
    P: PolicyClient,
{
    event!(
        Level::WARN,
        name = %policy.name_any(),
        "Reconciliation failed: '{}'. Retrying.",
        error
    );
    Action::requeue(ERROR_RETRY_INTERVAL)
}

/// Queries the gateway for eligible nodes and either starts processing one or completes the
/// cycle immediately when nothing matches.
async fn find_nodes<G, P>(
    reporter: &mut StatusReporter<P>,
    policy: &NodeRefresh,
    ctx: &Context<G, P>,
) -> Result<()>
where
    G: NodeGateway,
    P: PolicyClient,
{
    let found = ctx
        .gateway
        .list_target_nodes(&policy.spec.target_node_labels)
        .await
        .context(error::ListTargetNodesSnafu)?;

    // The node hosting this controller is never refreshed.
    let remaining: Vec<String> = found
        .into_iter()
        .map(|node| node.name)
        .filter(|name| name != &ctx.own_node_name)
        .collect();

    match select_target(&remaining) {
        None => {
            reporter
                .transition(Transition::succeeded(
                    "No eligible target nodes; refresh cycle complete.".to_string(),
                ))
                .await
        }
        Some(target) => {
            let message = format!(
                "Cycle covers {} nodes; selected node '{}' for refresh.",
                remaining.len(),
                target
            );
            reporter
                .transition(Transition::processing(target, remaining, message))
                .await
        }
    }
}

/// Uniformly chooses the next node from the working set, spreading refresh load without bias
/// toward any particular node identity.
fn select_target(remaining: &[String]) -> Option<String> {
    remaining.choose(&mut rand::thread_rng()).cloned()
}
