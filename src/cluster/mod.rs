//! Role synthesizers for the primary cluster pass
//!
//! Each role builds its workload objects from the defaulted cluster spec and
//! the resolved addresses of its predecessors, then applies them
//! idempotently. The engine drives them strictly in the declared synthesis
//! order.

pub mod coordinator;
pub mod ctrlnode;
pub mod datanode;
pub mod health;
pub mod metanode;

pub use coordinator::Coordinator;
pub use ctrlnode::CtrlNode;
pub use datanode::DataNode;
pub use health::HealthProbe;
pub use metanode::MetaNode;

use std::collections::BTreeMap;

use crate::k8s::{EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector, Volume, VolumeMount};
use crate::synthesis::Role;

// Shared volume layout: every engine role logs to the same in-container
// paths, backed by host paths from the cluster spec.
pub(crate) const VOLUME_LOG: &str = "pod-log-path";
pub(crate) const VOLUME_DATA: &str = "pod-data-path";
pub(crate) const CONTAINER_LOG_PATH: &str = "/cfs/logs";
pub(crate) const CONTAINER_DATA_PATH: &str = "/cfs/data";

/// Engine start script inside the server image
pub(crate) const START_SCRIPT: &str = "/cfs/bin/start.sh";

pub(crate) fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

pub(crate) fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

pub(crate) fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    }
}

pub(crate) fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Node selector for a role: the declared selector, or the opt-in label
/// `{namespace}-{component}=enabled` when none is given
pub(crate) fn node_selector(
    role: Role,
    namespace: &str,
    declared: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    if !declared.is_empty() {
        return declared.clone();
    }
    BTreeMap::from([(
        format!("{}-{}", namespace, role.component()),
        "enabled".to_string(),
    )])
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::crd::{DefaultTable, StorageCluster, StorageClusterSpec};
    use crate::k8s::owner_reference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    /// A defaulted cluster the way the reconciler would see it mid-pass
    pub(crate) fn defaulted_cluster() -> StorageCluster {
        let mut spec = StorageClusterSpec::default();
        spec.data_node.disks = vec!["/data/disk1:21474836480".to_string()];
        let mut cluster = StorageCluster::new("mycluster", spec);
        cluster.metadata.namespace = Some("storage".to_string());
        cluster.metadata.uid = Some("uid-1234".to_string());
        cluster.spec = DefaultTable::default().apply_cluster(cluster.spec);
        cluster
    }

    pub(crate) fn owner_ref(cluster: &StorageCluster) -> OwnerReference {
        owner_reference(cluster).expect("test cluster has a uid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_selector_defaults_to_opt_in_label() {
        let selector = node_selector(Role::DataNode, "storage", &BTreeMap::new());
        assert_eq!(selector.get("storage-datanode").unwrap(), "enabled");
    }

    #[test]
    fn test_node_selector_prefers_declared() {
        let declared = BTreeMap::from([("disk".to_string(), "fast".to_string())]);
        let selector = node_selector(Role::DataNode, "storage", &declared);
        assert_eq!(selector, declared);
    }
}
