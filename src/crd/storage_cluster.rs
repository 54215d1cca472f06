//! StorageCluster CRD
//!
//! The declared desired state of a multi-role CubeFS cluster: engine image,
//! host path prefixes, and per-role sub-specs for the coordination service,
//! ctrl-nodes, meta-nodes, data-nodes, and the optional CSI provisioner.
//!
//! The status block is derived, owned exclusively by the reconciliation
//! engine, and overwritten wholesale on each successful pass.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{LocalObjectReference, ResourceRequirements};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// StorageCluster CRD
// =============================================================================

/// StorageCluster declares a complete CubeFS cluster: which engine image to
/// run, where its data and logs live on the host, and how each role is
/// dimensioned. Identity is namespace+name; updates are re-submissions of
/// the whole spec.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "StorageCluster",
    plural = "storageclusters",
    shortname = "scl",
    status = "StorageClusterStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterSpec {
    /// Engine image shared by ctrl-nodes, meta-nodes, and data-nodes.
    /// Defaulted when empty.
    #[serde(default)]
    pub image: String,

    /// Image pull policy: Always, Never, or IfNotPresent
    #[serde(default)]
    pub image_pull_policy: String,

    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// Host path under which every role stores its data
    #[serde(default)]
    pub data_dir_host_path: String,

    /// Host path under which every role writes its logs
    #[serde(default)]
    pub log_dir_host_path: String,

    #[serde(default)]
    pub priority_class_name: Option<String>,

    /// Coordination service (synthesized first)
    #[serde(default)]
    pub coordinator: CoordinatorSpec,

    /// Ctrl-node quorum
    #[serde(default)]
    pub ctrl_node: CtrlNodeSpec,

    /// Metadata-node fleet
    #[serde(default)]
    pub meta_node: MetaNodeSpec,

    /// Data-node fleet
    #[serde(default)]
    pub data_node: DataNodeSpec,

    /// CSI client provisioner (optional side channel)
    #[serde(default)]
    pub provisioner: ProvisionerSpec,

    /// Intent when deleting the cluster
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
}

// =============================================================================
// Role Sub-Specs
// =============================================================================

/// Coordination service settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSpec {
    /// Coordination service image (not the engine image)
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub port: i32,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Ctrl-node quorum settings. Replica count is defaulted when zero; the
/// defaulted value is always at least 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CtrlNodeSpec {
    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub log_level: String,

    /// How many raft log files the engine retains
    #[serde(default)]
    pub retain_logs: i32,

    #[serde(default)]
    pub port: i32,

    #[serde(default)]
    pub prof_port: i32,

    #[serde(default)]
    pub exporter_port: i32,

    /// Memory the engine reserves on each meta-node, in bytes
    #[serde(default)]
    pub meta_reserved_mem: i64,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Meta-node settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetaNodeSpec {
    #[serde(default)]
    pub log_level: String,

    /// Memory budget per meta-node, in bytes
    #[serde(default)]
    pub total_mem: i64,

    #[serde(default)]
    pub port: i32,

    #[serde(default)]
    pub prof_port: i32,

    #[serde(default)]
    pub raft_heartbeat_port: i32,

    #[serde(default)]
    pub raft_replica_port: i32,

    #[serde(default)]
    pub exporter_port: i32,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Data-node settings. `disks` is required: an ordered list of
/// `path:reservedBytes` entries, one host path per disk with the number of
/// bytes the engine must leave unallocated on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataNodeSpec {
    #[serde(default)]
    pub log_level: String,

    #[serde(default)]
    pub port: i32,

    #[serde(default)]
    pub prof_port: i32,

    #[serde(default)]
    pub raft_heartbeat_port: i32,

    #[serde(default)]
    pub raft_replica_port: i32,

    #[serde(default)]
    pub exporter_port: i32,

    /// `path:reservedBytes` entries; must not be empty
    #[serde(default)]
    pub disks: Vec<String>,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// CSI provisioner settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerSpec {
    #[serde(default)]
    pub kubelet_path: String,

    /// CSI driver name registered with the kubelet
    #[serde(default)]
    pub driver_name: String,

    /// Engine CSI driver image
    #[serde(default)]
    pub driver_image: String,

    /// External provisioner sidecar image
    #[serde(default)]
    pub provisioner_image: String,

    /// External attacher sidecar image
    #[serde(default)]
    pub attacher_image: String,

    /// Node driver registrar sidecar image
    #[serde(default)]
    pub registrar_image: String,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Intent when a cluster is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CleanupPolicy {
    /// Leave host data in place
    #[default]
    None,
    /// Remove everything the cluster wrote to its hosts
    DeleteAll,
}

// =============================================================================
// Status
// =============================================================================

/// Derived status, written back wholesale after each pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterStatus {
    /// Overall lifecycle state
    #[serde(default)]
    pub state: ClusterState,

    /// Spec generation the last successful pass converged against
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Typed conditions with transition timestamps
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,

    /// Engine health snapshot, present once the ctrl-nodes answer
    #[serde(default)]
    pub health: Option<HealthSnapshot>,
}

/// Cluster lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterState {
    #[default]
    Creating,
    Created,
    Updating,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterState::Creating => "Creating",
            ClusterState::Created => "Created",
            ClusterState::Updating => "Updating",
            ClusterState::Connecting => "Connecting",
            ClusterState::Connected => "Connected",
            ClusterState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Condition types reported on a StorageCluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Progressing,
    Ready,
    Failure,
    Deleting,
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A typed condition with its last transition timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Engine health snapshot aggregated from the ctrl-node admin API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Per-zone writable node counts
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneHealth>,
}

/// Writable node counts within one zone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ZoneHealth {
    #[serde(default)]
    pub data_writable_nodes: i32,
    #[serde(default)]
    pub data_total_nodes: i32,
    #[serde(default)]
    pub meta_writable_nodes: i32,
    #[serde(default)]
    pub meta_total_nodes: i32,
}

impl HealthSnapshot {
    /// A cluster is considered writable when some zone has quorum-capable
    /// data and meta fleets
    pub fn is_writable(&self) -> bool {
        self.zones
            .values()
            .any(|z| z.data_writable_nodes >= 3 && z.meta_writable_nodes >= 3)
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageCluster {
    /// Name of this cluster
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Namespace of this cluster
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Whether a deletion marker is set
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

impl StorageClusterStatus {
    /// Set a condition, replacing an existing one of the same type. The
    /// transition timestamp is preserved when the status value is unchanged
    /// so that repeated identical passes produce byte-identical statuses.
    pub fn set_condition(&mut self, mut condition: ClusterCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, r#type: ConditionType) -> Option<&ClusterCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(status: ConditionStatus, ts: i64) -> ClusterCondition {
        ClusterCondition {
            r#type: ConditionType::Ready,
            status,
            reason: None,
            message: None,
            last_transition_time: Some(
                DateTime::from_timestamp(ts, 0).expect("valid timestamp"),
            ),
        }
    }

    #[test]
    fn test_set_condition_preserves_transition_time_when_unchanged() {
        let mut status = StorageClusterStatus::default();
        status.set_condition(condition(ConditionStatus::True, 100));
        status.set_condition(condition(ConditionStatus::True, 200));

        let c = status.condition(ConditionType::Ready).unwrap();
        assert_eq!(
            c.last_transition_time,
            Some(DateTime::from_timestamp(100, 0).unwrap())
        );
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_change() {
        let mut status = StorageClusterStatus::default();
        status.set_condition(condition(ConditionStatus::True, 100));
        status.set_condition(condition(ConditionStatus::False, 200));

        let c = status.condition(ConditionType::Ready).unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(
            c.last_transition_time,
            Some(DateTime::from_timestamp(200, 0).unwrap())
        );
    }

    #[test]
    fn test_health_snapshot_writability() {
        let mut snapshot = HealthSnapshot::default();
        assert!(!snapshot.is_writable());

        snapshot.zones.insert(
            "default".into(),
            ZoneHealth {
                data_writable_nodes: 3,
                data_total_nodes: 4,
                meta_writable_nodes: 3,
                meta_total_nodes: 3,
            },
        );
        assert!(snapshot.is_writable());

        snapshot.zones.get_mut("default").unwrap().meta_writable_nodes = 2;
        assert!(!snapshot.is_writable());
    }

    #[test]
    fn test_default_spec_round_trips() {
        let spec = StorageClusterSpec::default();
        let json = serde_json::to_string(&spec).unwrap();
        let back: StorageClusterSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
