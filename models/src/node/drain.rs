//! Provides an implementation for draining Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! Draining in Kubernetes is done client side, and is typically a combination of "cordoning" a
//! Node by marking it as unschedulable, followed by evicting Pods from the Node. Evictions are
//! used (rather than deletions) so that PodDisruptionBudgets (PDBs) are respected.
//!
//! The whole sequence runs here: cordon, evict with a bounded retry budget, wait for the pods
//! to be deleted, and uncordon. The node is uncordoned even when the drain fails, so that a
//! failed cycle never leaves a node stuck unschedulable.
use super::{NodeGateway, PodRef};
use crate::constants;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::ResultExt;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{event, instrument, Level};

use async_trait::async_trait;

// When an eviction is rejected (a PodDisruptionBudget currently disallows it, or the budget is
// misconfigured), we retry with exponential backoff starting at this delay.
// `kubectl drain` similarly waits 5 seconds between eviction attempts.
const EVICTION_BASE_DELAY: Duration = Duration::from_secs(5);
const EVICTION_MAX_DELAY: Duration = Duration::from_secs(60);

// The maximum number of retries for a single pod's eviction. Exhausting this budget fails the
// whole drain attempt; the stuck pod is named in the resulting error.
const EVICTION_RETRY_LIMIT: usize = 10;

// After evictions are accepted, we wait for the Pods to be deleted by Kubernetes.
// These constants define the poll interval for checking the node's pods, and the number of
// polls performed before the drain attempt is marked failed.
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const DELETION_CHECK_BUDGET: usize = 60;

/// The backoff schedule for retrying rejected evictions: 5s, 10s, 20s, ... capped at
/// [`EVICTION_MAX_DELAY`], with jitter applied.
fn eviction_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(2)
        .factor(EVICTION_BASE_DELAY.as_millis() as u64 / 2)
        .max_delay(EVICTION_MAX_DELAY)
        .map(jitter)
        .take(EVICTION_RETRY_LIMIT)
}

#[async_trait]
/// Receives one message per major drain step (cordon done, pods targeted, drain outcome,
/// uncordon done) for external observability.
pub trait DrainObserver: Send {
    async fn observe(&mut self, message: String);
}

/// Drains a node of all evictable pods.
///
/// The Kubernetes API does not provide an implementation of drain; the Eviction API is used
/// per pod so that Pod Disruption Budgets are respected. The implementation of `kubectl drain`
/// can be used as inspiration, with slightly different behavior:
///
/// By default, we ignore:
/// * DaemonSet Pods - The DaemonSet controller will not respect node cordons, so we don't battle it.
/// * Mirror Pods - These are static and cannot be controlled.
/// * Pods already in a terminal phase, and the pod hosting this operator.
///
/// Otherwise, we evict pods that kubectl gives special care:
/// - Pods with local storage that will be deleted when drained (emptyDir).
/// - Unreplicated pods (Pods without a controller.)
///
/// PodDisruptionBudgets can be used to protect these workloads from being unduly interrupted.
#[instrument(skip(gateway, observer), err)]
pub async fn drain_node<G, O>(
    gateway: &G,
    node_name: &str,
    observer: &mut O,
) -> Result<(), error::DrainError>
where
    G: NodeGateway,
    O: DrainObserver,
{
    gateway
        .cordon_node(node_name)
        .await
        .context(error::CordonSnafu { node_name })?;
    observer
        .observe(format!("Node '{}' cordoned.", node_name))
        .await;

    let targets = find_target_pods(gateway, node_name).await?;
    observer
        .observe(format!(
            "Targeting {} pods for eviction on node '{}'.",
            targets.len(),
            node_name
        ))
        .await;

    let drain_result = evict_all(gateway, node_name, &targets).await;
    match &drain_result {
        Ok(()) => {
            observer
                .observe(format!(
                    "Drained {} pods from node '{}'.",
                    targets.len(),
                    node_name
                ))
                .await
        }
        Err(err) => {
            observer
                .observe(format!("Drain of node '{}' failed: {}", node_name, err))
                .await
        }
    }

    // Uncordon is attempted whether or not the drain succeeded; the drain error, if any,
    // still decides the overall outcome.
    let uncordon_result = gateway.uncordon_node(node_name).await;
    match &uncordon_result {
        Ok(()) => {
            observer
                .observe(format!("Node '{}' uncordoned.", node_name))
                .await
        }
        Err(err) => {
            observer
                .observe(format!("Failed to uncordon node '{}': {}", node_name, err))
                .await
        }
    }

    match (drain_result, uncordon_result) {
        (Err(drain_err), _) => Err(drain_err),
        (Ok(()), Err(err)) => Err(err).context(error::UncordonSnafu { node_name }),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Finds all pods on a given node that are targeted for eviction during a drain.
/// See documentation on [`drain_node`] for more information about which pods are selected.
#[instrument(skip(gateway), err)]
async fn find_target_pods<G: NodeGateway>(
    gateway: &G,
    node_name: &str,
) -> Result<Vec<PodRef>, error::DrainError> {
    let pods = gateway
        .list_pods(node_name)
        .await
        .context(error::FindTargetPodsSnafu { node_name })?;

    Ok(filter_pods(pods.into_iter()).filter_map(pod_ref).collect())
}

fn pod_ref(pod: Pod) -> Option<PodRef> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    Some(PodRef { name, namespace })
}

/// Given a list of all pods for a given node, this filters out pods which we do not want to
/// attempt to drain.
fn filter_pods<F: Iterator<Item = Pod>>(pods: F) -> impl Iterator<Item = Pod> {
    pods.filter(|pod| {
        // Pods already in a terminal phase have nothing left to evict.
        if let Some(status) = pod.status.as_ref() {
            if let Some(phase) = status.phase.as_ref() {
                if phase == "Failed" || phase == "Succeeded" {
                    return false;
                }
            }
        }

        // Ignore daemonset pods, as the DaemonSet controller ignores node cordons.
        if let Some(owner_references) = pod.metadata.owner_references.as_ref() {
            if owner_references.iter().any(|reference| {
                reference.controller == Some(true) && reference.kind == "DaemonSet"
            }) {
                event!(
                    Level::INFO,
                    "Not draining Pod '{}': Pod is member of a DaemonSet",
                    pod.name_any()
                );
                return false;
            }
        }

        // Ignore static mirror pods, they cannot be controlled.
        if let Some(annotations) = pod.metadata.annotations.as_ref() {
            if annotations.contains_key("kubernetes.io/config.mirror") {
                event!(
                    Level::INFO,
                    "Not draining Pod '{}': Pod is a static Mirror Pod",
                    pod.name_any()
                );
                return false;
            }
        }

        // The operator never evicts its own pod.
        if let Some(labels) = pod.metadata.labels.as_ref() {
            if labels.get(constants::APP_NAME).map(String::as_str) == Some(constants::OPERATOR) {
                event!(
                    Level::INFO,
                    "Not draining Pod '{}': Pod hosts this operator",
                    pod.name_any()
                );
                return false;
            }
        }

        true
    })
}

/// Evicts every targeted pod, then waits for Kubernetes to delete them all.
async fn evict_all<G: NodeGateway>(
    gateway: &G,
    node_name: &str,
    targets: &[PodRef],
) -> Result<(), error::DrainError> {
    for pod in targets {
        evict_pod_with_backoff(gateway, node_name, pod).await?;
    }
    wait_for_deletion(gateway, node_name, targets).await
}

/// Create an eviction for the desired Pod, retrying rejections with increasing delays until
/// the attempt budget is exhausted.
async fn evict_pod_with_backoff<G: NodeGateway>(
    gateway: &G,
    node_name: &str,
    pod: &PodRef,
) -> Result<(), error::DrainError> {
    let mut delays = eviction_backoff();
    let mut attempt: usize = 1;
    loop {
        event!(Level::INFO, %pod, attempt, "Attempting to evict pod");
        match gateway.evict_pod(pod).await {
            Ok(()) => {
                event!(Level::INFO, %pod, "Eviction accepted for pod");
                return Ok(());
            }
            Err(err) if err.should_retry() => match delays.next() {
                Some(delay) => {
                    event!(
                        Level::WARN,
                        %pod,
                        attempt,
                        delay_s = delay.as_secs_f64(),
                        "Eviction held off: '{}'. Retrying.",
                        err
                    );
                    attempt += 1;
                    sleep(delay).await;
                }
                None => {
                    return error::EvictionBudgetExhaustedSnafu {
                        node_name,
                        pod_name: pod.to_string(),
                        attempts: attempt,
                    }
                    .fail();
                }
            },
            Err(err) => {
                return Err(error::DrainError::Evict {
                    node_name: node_name.to_string(),
                    source: err,
                });
            }
        }
    }
}

/// Wait for the targeted pods to be deleted by Kubernetes, polling the node's pod list.
#[instrument(skip(gateway, targets), err)]
async fn wait_for_deletion<G: NodeGateway>(
    gateway: &G,
    node_name: &str,
    targets: &[PodRef],
) -> Result<(), error::DrainError> {
    if targets.is_empty() {
        return Ok(());
    }

    let mut last_remaining: Vec<String> = targets.iter().map(ToString::to_string).collect();
    for _ in 0..DELETION_CHECK_BUDGET {
        match remaining_targets(gateway, node_name, targets).await {
            Ok(remaining) => {
                if remaining.is_empty() {
                    return Ok(());
                }
                event!(
                    Level::DEBUG,
                    node_name,
                    remaining = remaining.len(),
                    "Pods not yet deleted. Waiting {}s.",
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
                last_remaining = remaining;
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    node_name,
                    "Could not determine whether pods were deleted: '{}'. Waiting {}s.",
                    err,
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
        }
        sleep(DELETION_CHECK_INTERVAL).await;
    }

    error::WaitForDeletionSnafu {
        node_name,
        stuck_pods: last_remaining.join(", "),
    }
    .fail()
}

/// The subset of the targeted pods still present on the node.
async fn remaining_targets<G: NodeGateway>(
    gateway: &G,
    node_name: &str,
    targets: &[PodRef],
) -> Result<Vec<String>, super::error::Error> {
    let pods = gateway.list_pods(node_name).await?;
    Ok(targets
        .iter()
        .filter(|target| {
            pods.iter().any(|pod| {
                pod.metadata.name.as_deref() == Some(target.name.as_str())
                    && pod.metadata.namespace.as_deref().unwrap_or("default") == target.namespace
            })
        })
        .map(ToString::to_string)
        .collect())
}

pub mod error {
    use crate::node::error::{Error as GatewayError, EvictionError};
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to cordon node '{}': '{}'", node_name, source))]
        Cordon {
            source: GatewayError,
            node_name: String,
        },

        #[snafu(display("Unable to find drainable pods for node '{}': '{}'", node_name, source))]
        FindTargetPods {
            source: GatewayError,
            node_name: String,
        },

        #[snafu(display(
            "Eviction of pod '{}' on node '{}' was held off through {} attempts; the disruption budget never allowed it",
            pod_name,
            node_name,
            attempts
        ))]
        EvictionBudgetExhausted {
            node_name: String,
            pod_name: String,
            attempts: usize,
        },

        #[snafu(display("Unable to evict pod on node '{}': '{}'", node_name, source))]
        Evict {
            node_name: String,
            source: EvictionError,
        },

        #[snafu(display(
            "Pods were not deleted from node '{}' in the time allocated; still present: {}",
            node_name,
            stuck_pods
        ))]
        WaitForDeletion {
            node_name: String,
            stuck_pods: String,
        },

        #[snafu(display("Unable to uncordon node '{}' after drain: '{}'", node_name, source))]
        Uncordon {
            source: GatewayError,
            node_name: String,
        },
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::error::DrainError;
    use super::*;
    use crate::node::error::{Error as GatewayError, EvictionError, Result as GatewayResult};
    use crate::node::NodeRef;

    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;
    use maplit::btreemap;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};

    /// Scripted NodeGateway double recording drain interactions.
    #[derive(Clone, Default)]
    struct FakeGateway {
        state: Arc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    struct FakeState {
        cordon_calls: usize,
        uncordon_calls: usize,
        fail_cordon: bool,
        pods: Vec<Pod>,
        // pod name -> number of rejections before the eviction is accepted
        rejections: HashMap<String, usize>,
        evict_calls: HashMap<String, usize>,
        // pods that stay bound to the node even after their eviction is accepted
        never_delete: Vec<String>,
    }

    impl FakeGateway {
        fn with_pods(pods: Vec<Pod>) -> Self {
            let gateway = FakeGateway::default();
            gateway.state.lock().unwrap().pods = pods;
            gateway
        }

        fn cordon_calls(&self) -> usize {
            self.state.lock().unwrap().cordon_calls
        }

        fn uncordon_calls(&self) -> usize {
            self.state.lock().unwrap().uncordon_calls
        }

        fn evict_calls(&self, pod_name: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .evict_calls
                .get(pod_name)
                .copied()
                .unwrap_or(0)
        }
    }

    fn opaque_error(message: &str) -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, message.to_string()))
    }

    #[async_trait]
    impl NodeGateway for FakeGateway {
        async fn list_target_nodes(
            &self,
            _selector: &BTreeMap<String, String>,
        ) -> GatewayResult<Vec<NodeRef>> {
            Ok(vec![])
        }

        async fn cordon_node(&self, node_name: &str) -> GatewayResult<()> {
            let mut state = self.state.lock().unwrap();
            state.cordon_calls += 1;
            if state.fail_cordon {
                return Err(GatewayError::CordonNode {
                    source: opaque_error("patch refused"),
                    node_name: node_name.to_string(),
                });
            }
            Ok(())
        }

        async fn uncordon_node(&self, _node_name: &str) -> GatewayResult<()> {
            self.state.lock().unwrap().uncordon_calls += 1;
            Ok(())
        }

        async fn list_pods(&self, _node_name: &str) -> GatewayResult<Vec<Pod>> {
            Ok(self.state.lock().unwrap().pods.clone())
        }

        async fn evict_pod(&self, pod: &PodRef) -> Result<(), EvictionError> {
            let mut state = self.state.lock().unwrap();
            let calls = {
                let calls = state.evict_calls.entry(pod.name.clone()).or_insert(0);
                *calls += 1;
                *calls
            };
            let rejections = state.rejections.get(&pod.name).copied().unwrap_or(0);
            if calls <= rejections {
                return Err(EvictionError::Rejected {
                    pod: pod.clone(),
                    reason: "disruption budget needs this pod".to_string(),
                });
            }
            if !state.never_delete.contains(&pod.name) {
                state
                    .pods
                    .retain(|p| p.metadata.name.as_deref() != Some(pod.name.as_str()));
            }
            Ok(())
        }
    }

    struct RecordingObserver {
        messages: Vec<String>,
    }

    impl RecordingObserver {
        fn new() -> Self {
            RecordingObserver { messages: vec![] }
        }
    }

    #[async_trait]
    impl DrainObserver for RecordingObserver {
        async fn observe(&mut self, message: String) {
            self.messages.push(message);
        }
    }

    pub(crate) fn running_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn daemon_pod(name: &str) -> Pod {
        let mut pod = running_pod(name);
        pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: "ds".to_string(),
            uid: "uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        pod
    }

    fn mirror_pod(name: &str) -> Pod {
        let mut pod = running_pod(name);
        pod.metadata.annotations = Some(btreemap! {
            "kubernetes.io/config.mirror".to_string() => "hash".to_string(),
        });
        pod
    }

    fn operator_pod(name: &str) -> Pod {
        let mut pod = running_pod(name);
        pod.metadata.labels = Some(btreemap! {
            constants::APP_NAME.to_string() => constants::OPERATOR.to_string(),
        });
        pod
    }

    fn completed_pod(name: &str) -> Pod {
        let mut pod = running_pod(name);
        pod.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn filter_skips_undrainable_pods() {
        let pods = vec![
            running_pod("app-1"),
            daemon_pod("logging-agent"),
            mirror_pod("static-web"),
            operator_pod("refresh-operator"),
            completed_pod("one-shot-job"),
        ];

        let drainable: Vec<String> = filter_pods(pods.into_iter())
            .filter_map(|pod| pod.metadata.name)
            .collect();
        assert_eq!(drainable, vec!["app-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_of_empty_node_is_a_noop_success() {
        let gateway = FakeGateway::default();
        let mut observer = RecordingObserver::new();

        drain_node(&gateway, "node-a", &mut observer).await.unwrap();

        assert_eq!(gateway.cordon_calls(), 1);
        assert_eq!(gateway.uncordon_calls(), 1);
        assert!(observer
            .messages
            .iter()
            .any(|message| message.contains("Targeting 0 pods")));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_is_idempotent() {
        let gateway = FakeGateway::with_pods(vec![running_pod("app-1")]);
        let mut observer = RecordingObserver::new();

        drain_node(&gateway, "node-a", &mut observer).await.unwrap();
        drain_node(&gateway, "node-a", &mut observer).await.unwrap();

        // The second pass sees an empty node and changes nothing further.
        assert_eq!(gateway.cordon_calls(), 2);
        assert_eq!(gateway.uncordon_calls(), 2);
        assert_eq!(gateway.evict_calls("app-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_evictions_are_retried_until_accepted() {
        let gateway = FakeGateway::with_pods(vec![running_pod("app-1")]);
        gateway
            .state
            .lock()
            .unwrap()
            .rejections
            .insert("app-1".to_string(), 4);
        let mut observer = RecordingObserver::new();

        drain_node(&gateway, "node-a", &mut observer).await.unwrap();

        assert_eq!(gateway.evict_calls("app-1"), 5);
        assert_eq!(gateway.uncordon_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_eviction_budget_fails_drain_and_uncordons() {
        let gateway = FakeGateway::with_pods(vec![running_pod("app-1")]);
        gateway
            .state
            .lock()
            .unwrap()
            .rejections
            .insert("app-1".to_string(), usize::MAX);
        let mut observer = RecordingObserver::new();

        let err = drain_node(&gateway, "node-a", &mut observer)
            .await
            .unwrap_err();

        match err {
            DrainError::EvictionBudgetExhausted { ref pod_name, .. } => {
                assert_eq!(pod_name, "default/app-1");
            }
            other => panic!("unexpected drain outcome: {}", other),
        }
        assert_eq!(gateway.evict_calls("app-1"), EVICTION_RETRY_LIMIT + 1);
        assert_eq!(gateway.uncordon_calls(), 1, "node must be uncordoned after a failed drain");
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_pod_fails_drain_after_wait_budget() {
        let gateway = FakeGateway::with_pods(vec![running_pod("app-1")]);
        gateway
            .state
            .lock()
            .unwrap()
            .never_delete
            .push("app-1".to_string());
        let mut observer = RecordingObserver::new();

        let err = drain_node(&gateway, "node-a", &mut observer)
            .await
            .unwrap_err();

        match err {
            DrainError::WaitForDeletion { ref stuck_pods, .. } => {
                assert!(stuck_pods.contains("default/app-1"));
            }
            other => panic!("unexpected drain outcome: {}", other),
        }
        assert_eq!(gateway.uncordon_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cordon_failure_aborts_before_evictions() {
        let gateway = FakeGateway::with_pods(vec![running_pod("app-1")]);
        gateway.state.lock().unwrap().fail_cordon = true;
        let mut observer = RecordingObserver::new();

        let err = drain_node(&gateway, "node-a", &mut observer)
            .await
            .unwrap_err();

        assert!(matches!(err, DrainError::Cordon { .. }));
        assert_eq!(gateway.evict_calls("app-1"), 0);
        // The node never became unschedulable, so there is nothing to undo.
        assert_eq!(gateway.uncordon_calls(), 0);
    }
}
