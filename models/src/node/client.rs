use super::error::{self, EvictionError, Result};
use super::{format_label_selector, NodeRef, PodRef};

use async_trait::async_trait;
use http::StatusCode;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams};
use kube::ResourceExt;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{event, instrument, Level};

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

#[async_trait]
/// A trait providing the cluster-facing operations the refresh engine needs: listing eligible
/// nodes, changing node schedulability, and removing pods. This is provided as a trait in
/// order to allow mocks to be used for testing purposes.
pub trait NodeGateway: Clone + Sized + Send + Sync {
    /// List nodes that match the label selector and are eligible for refreshing: in Ready
    /// condition and currently schedulable.
    async fn list_target_nodes(&self, selector: &BTreeMap<String, String>)
        -> Result<Vec<NodeRef>>;
    /// Marks the given node as unschedulable, preventing Pods from being deployed onto it.
    /// Cordoning an already-cordoned node succeeds as a no-op.
    async fn cordon_node(&self, node_name: &str) -> Result<()>;
    /// Marks the given node as schedulable, allowing Pods to be deployed onto it.
    async fn uncordon_node(&self, node_name: &str) -> Result<()>;
    /// List all pods currently bound to the given node.
    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>>;
    /// Request eviction of the given pod through the Eviction API, which enforces
    /// PodDisruptionBudgets server-side. A rejection is distinguishable from a fatal error
    /// through [`EvictionError`].
    async fn evict_pod(&self, pod: &PodRef) -> std::result::Result<(), EvictionError>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock NodeGateway for use in tests.
    pub NodeGateway {}
    #[async_trait]
    impl NodeGateway for NodeGateway {
        async fn list_target_nodes(
            &self,
            selector: &BTreeMap<String, String>,
        ) -> Result<Vec<NodeRef>>;
        async fn cordon_node(&self, node_name: &str) -> Result<()>;
        async fn uncordon_node(&self, node_name: &str) -> Result<()>;
        async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>>;
        async fn evict_pod(&self, pod: &PodRef) -> std::result::Result<(), EvictionError>;
    }

    impl Clone for NodeGateway {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> NodeGateway for Arc<T>
where
    T: NodeGateway,
{
    async fn list_target_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeRef>> {
        (**self).list_target_nodes(selector).await
    }

    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        (**self).cordon_node(node_name).await
    }

    async fn uncordon_node(&self, node_name: &str) -> Result<()> {
        (**self).uncordon_node(node_name).await
    }

    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        (**self).list_pods(node_name).await
    }

    async fn evict_pod(&self, pod: &PodRef) -> std::result::Result<(), EvictionError> {
        (**self).evict_pod(pod).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `NodeGateway` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8sNodeGateway {
    k8s_client: kube::client::Client,
}

impl K8sNodeGateway {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8sNodeGateway { k8s_client }
    }
}

/// Checks whether a node is in Ready condition.
fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// Checks whether a node is schedulable (not cordoned).
fn is_node_schedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .map_or(true, |spec| !spec.unschedulable.unwrap_or(false))
}

#[async_trait]
impl NodeGateway for K8sNodeGateway {
    #[instrument(skip(self), err)]
    async fn list_target_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<NodeRef>> {
        let label_selector = format_label_selector(selector);
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());

        let matching = nodes
            .list(&ListParams::default().labels(&label_selector))
            .await
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            .context(error::ListNodesSnafu {
                selector: label_selector.clone(),
            })?;

        Ok(matching
            .into_iter()
            .filter(|node| is_node_ready(node) && is_node_schedulable(node))
            .map(|node| NodeRef {
                name: node.name_any(),
                labels: node.metadata.labels.clone().unwrap_or_default(),
            })
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .cordon(node_name)
            .await
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            .context(error::CordonNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn uncordon_node(&self, node_name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .uncordon(node_name)
            .await
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            .context(error::UncordonNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());
        let on_node = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
            .await
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            .context(error::ListPodsSnafu { node_name })?;

        Ok(on_node.items)
    }

    #[instrument(skip(self, pod), fields(pod = %pod))]
    async fn evict_pod(&self, pod: &PodRef) -> std::result::Result<(), EvictionError> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), &pod.namespace);

        // When evicting a pod, a 429 (TOO_MANY_REQUESTS) response code indicates that we must
        // wait for a PodDisruptionBudget (PDB) to be satisfied. A misconfiguration (e.g.
        // multiple PDBs that refer to the same pod) yields a 500. Both are expected to clear
        // up, and both leave the decision to retry with the caller.
        match pods.evict(&pod.name, &EvictParams::default()).await {
            Ok(_) => {
                event!(Level::INFO, "Eviction created for pod '{}'", pod);
                Ok(())
            }
            Err(kube::Error::Api(e)) => match StatusCode::from_u16(e.code as u16) {
                Ok(StatusCode::TOO_MANY_REQUESTS) | Ok(StatusCode::INTERNAL_SERVER_ERROR) => {
                    Err(EvictionError::Rejected {
                        pod: pod.clone(),
                        reason: e.message,
                    })
                }
                Ok(StatusCode::NOT_FOUND) => {
                    // The pod is already gone, which is what a drain is after.
                    event!(Level::INFO, "Pod '{}' not found for eviction", pod);
                    Ok(())
                }
                _ => Err(EvictionError::Fatal {
                    source: kube::Error::Api(e),
                    pod: pod.clone(),
                }),
            },
            Err(e) => Err(EvictionError::Retriable {
                source: e,
                pod: pod.clone(),
            }),
        }
    }
}
