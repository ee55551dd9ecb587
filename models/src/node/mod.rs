mod client;
pub mod drain;
mod error;

pub use self::client::*;
pub use self::drain::{drain_node, DrainObserver};
pub use self::error::{Error as NodeGatewayError, EvictionError};

#[cfg(feature = "mockall")]
pub use self::client::MockNodeGateway;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier and matched-label snapshot for a refresh-eligible node, captured during node
/// selection. Only the name survives into persisted status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Identifies a pod targeted for eviction during a drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Formats a label map into a Kubernetes label selector string.
pub fn format_label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}
