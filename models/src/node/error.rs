use super::PodRef;

use snafu::Snafu;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Unable to list nodes matching '{}': '{}'", selector, source))]
    ListNodes {
        source: Box<dyn std::error::Error + Send + Sync>,
        selector: String,
    },

    #[snafu(display("Unable to cordon node '{}': '{}'", node_name, source))]
    CordonNode {
        source: Box<dyn std::error::Error + Send + Sync>,
        node_name: String,
    },

    #[snafu(display("Unable to uncordon node '{}': '{}'", node_name, source))]
    UncordonNode {
        source: Box<dyn std::error::Error + Send + Sync>,
        node_name: String,
    },

    #[snafu(display("Unable to list pods on node '{}': '{}'", node_name, source))]
    ListPods {
        source: Box<dyn std::error::Error + Send + Sync>,
        node_name: String,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EvictionError {
    #[snafu(display("Eviction of pod '{}' was rejected: '{}'", pod, reason))]
    /// The eviction call was refused, typically while a PodDisruptionBudget cannot spare the
    /// pod. Rejections are expected to clear up and are retried.
    Rejected { pod: PodRef, reason: String },

    #[snafu(display("Unable to create eviction for pod '{}': '{}'", pod, source))]
    /// The eviction call failed in a way that may be transient. This may result in an attempt
    /// to retry the eviction.
    Retriable { source: kube::Error, pod: PodRef },

    #[snafu(display("Unable to create eviction for pod '{}': '{}'", pod, source))]
    /// A fatal error occurred while attempting to evict a pod. This will not be retried.
    Fatal { source: kube::Error, pod: PodRef },
}

impl EvictionError {
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Rejected { .. } | Self::Retriable { .. } => true,
            Self::Fatal { .. } => false,
        }
    }
}
