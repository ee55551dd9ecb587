use super::error::{self, Result};
use super::{NodeRefresh, NodeRefreshStatus};
use crate::constants;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::sync::Arc;
use tracing::instrument;

#[cfg(feature = "mockall")]
use mockall::{mock, predicate::*};

#[async_trait]
/// A trait providing an interface for persisting NodeRefresh status updates. This is provided
/// as a trait in order to allow mocks to be used for testing purposes.
pub trait PolicyClient: Clone + Sized + Send + Sync {
    /// Update the `.status` subresource of a NodeRefresh object. The patch carries the
    /// resourceVersion observed when `policy` was read, so a conflicting concurrent write
    /// fails with an API error instead of being silently overwritten. Returns the object
    /// as persisted, for use as the base of any further write.
    async fn update_status(
        &self,
        policy: &NodeRefresh,
        status: &NodeRefreshStatus,
    ) -> Result<NodeRefresh>;
}

#[cfg(feature = "mockall")]
mock! {
    /// A Mock PolicyClient for use in tests.
    pub PolicyClient {}
    #[async_trait]
    impl PolicyClient for PolicyClient {
        async fn update_status(
            &self,
            policy: &NodeRefresh,
            status: &NodeRefreshStatus,
        ) -> Result<NodeRefresh>;
    }

    impl Clone for PolicyClient {
        fn clone(&self) -> Self;
    }
}

#[async_trait]
impl<T> PolicyClient for Arc<T>
where
    T: PolicyClient,
{
    async fn update_status(
        &self,
        policy: &NodeRefresh,
        status: &NodeRefreshStatus,
    ) -> Result<NodeRefresh> {
        (**self).update_status(policy, status).await
    }
}

#[derive(Clone)]
/// Concrete implementation of the `PolicyClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8sPolicyClient {
    k8s_client: kube::client::Client,
}

impl K8sPolicyClient {
    pub fn new(k8s_client: kube::client::Client) -> Self {
        K8sPolicyClient { k8s_client }
    }

    fn api_for(&self, policy: &NodeRefresh) -> Api<NodeRefresh> {
        match policy.namespace() {
            Some(ns) => Api::namespaced(self.k8s_client.clone(), &ns),
            None => Api::default_namespaced(self.k8s_client.clone()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
/// A helper struct used to serialize and send patches to the k8s API to modify the status of
/// a NodeRefresh.
struct NodeRefreshStatusPatch {
    #[serde(rename = "apiVersion")]
    api_version: String,
    kind: String,
    metadata: StatusPatchMetadata,
    status: NodeRefreshStatus,
}

#[derive(Debug, Serialize, Deserialize)]
/// The resourceVersion included in a status patch makes the write conditional on the object
/// not having changed since it was read.
struct StatusPatchMetadata {
    #[serde(rename = "resourceVersion")]
    resource_version: Option<String>,
}

#[async_trait]
impl PolicyClient for K8sPolicyClient {
    #[instrument(skip(self, policy, status), fields(name = %policy.name_any()), err)]
    async fn update_status(
        &self,
        policy: &NodeRefresh,
        status: &NodeRefreshStatus,
    ) -> Result<NodeRefresh> {
        let patch = NodeRefreshStatusPatch {
            api_version: constants::API_VERSION.to_string(),
            kind: constants::K8S_REFRESH_KIND.to_string(),
            metadata: StatusPatchMetadata {
                resource_version: policy.resource_version(),
            },
            status: status.clone(),
        };

        self.api_for(policy)
            .patch_status(
                &policy.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)
            .context(error::UpdateNodeRefreshStatusSnafu {
                name: policy.name_any(),
            })
    }
}
