//! Controllers: change notification queue, watch adapters, worker pool, and
//! the per-resource reconcilers.

pub mod cluster;
pub mod monitor;
pub mod queue;
pub mod runner;
pub mod watch;

pub use cluster::*;
pub use monitor::*;
pub use queue::*;
pub use runner::*;
pub use watch::*;

use kube::{Resource, ResourceExt};

/// Deduplicated queue key identifying one declared-state object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
