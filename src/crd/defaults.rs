//! Defaulting engine
//!
//! Fills every unset field of a declared spec with a documented constant.
//! Unset means the serde zero value: empty string, zero port, zero replica
//! count. Defaulting is pure substitution: no I/O, no error path, and
//! applying it twice yields the same spec.
//!
//! The constants live in an immutable [`DefaultTable`] injected into the
//! reconcilers at construction rather than in module-level statics.

use super::storage_cluster::StorageClusterSpec;
use super::storage_monitor::StorageMonitorSpec;

// =============================================================================
// Default Table
// =============================================================================

/// Coordination service port assumed when a monitor does not name one
pub const DEFAULT_COORDINATOR_PORT: i32 = 8500;

/// Immutable table of per-role default values
#[derive(Debug, Clone)]
pub struct DefaultTable {
    // Cluster-wide
    pub server_image: String,
    pub image_pull_policy: String,
    pub data_dir_host_path: String,
    pub log_dir_host_path: String,

    // Coordinator
    pub coordinator_image: String,
    pub coordinator_port: i32,

    // Ctrl-node
    pub ctrl_replicas: i32,
    pub ctrl_log_level: String,
    pub ctrl_retain_logs: i32,
    pub ctrl_port: i32,
    pub ctrl_prof_port: i32,
    pub ctrl_exporter_port: i32,
    pub ctrl_meta_reserved_mem: i64,

    // Meta-node
    pub meta_log_level: String,
    pub meta_total_mem: i64,
    pub meta_port: i32,
    pub meta_prof_port: i32,
    pub meta_raft_heartbeat_port: i32,
    pub meta_raft_replica_port: i32,
    pub meta_exporter_port: i32,

    // Data-node
    pub data_log_level: String,
    pub data_port: i32,
    pub data_prof_port: i32,
    pub data_raft_heartbeat_port: i32,
    pub data_raft_replica_port: i32,
    pub data_exporter_port: i32,

    // CSI provisioner
    pub csi_kubelet_path: String,
    pub csi_driver_name: String,
    pub csi_driver_image: String,
    pub csi_provisioner_image: String,
    pub csi_attacher_image: String,
    pub csi_registrar_image: String,

    // Monitoring
    pub metrics_image: String,
    pub metrics_port: i32,
    pub metrics_host_path: String,
    pub dashboard_image: String,
    pub dashboard_port: i32,
    pub console_image: String,
    pub console_replicas: i32,
    pub console_port: i32,
    pub console_log_level: String,
    pub console_cluster_name: String,
}

impl Default for DefaultTable {
    fn default() -> Self {
        Self {
            server_image: "cubefs/cfs-server:3.3.0".into(),
            image_pull_policy: "IfNotPresent".into(),
            data_dir_host_path: "/var/lib/cubefs".into(),
            log_dir_host_path: "/var/log/cubefs".into(),

            coordinator_image: "consul:1.6.1".into(),
            coordinator_port: DEFAULT_COORDINATOR_PORT,

            ctrl_replicas: 4,
            ctrl_log_level: "error".into(),
            ctrl_retain_logs: 2000,
            ctrl_port: 17110,
            ctrl_prof_port: 17120,
            ctrl_exporter_port: 17150,
            ctrl_meta_reserved_mem: 67_108_864,

            meta_log_level: "error".into(),
            meta_total_mem: 2_147_483_648,
            meta_port: 17210,
            meta_prof_port: 17220,
            meta_raft_heartbeat_port: 17230,
            meta_raft_replica_port: 17240,
            meta_exporter_port: 17250,

            data_log_level: "error".into(),
            data_port: 17310,
            data_prof_port: 17320,
            data_raft_heartbeat_port: 17330,
            data_raft_replica_port: 17340,
            data_exporter_port: 17350,

            csi_kubelet_path: "/var/lib/kubelet".into(),
            csi_driver_name: "csi.cubefs.com".into(),
            csi_driver_image: "cubefs/cfs-csi-driver:3.3.0".into(),
            csi_provisioner_image: "quay.io/k8scsi/csi-provisioner:v1.6.0".into(),
            csi_attacher_image: "quay.io/k8scsi/csi-attacher:v2.0.0".into(),
            csi_registrar_image: "quay.io/k8scsi/csi-node-driver-registrar:v1.3.0".into(),

            metrics_image: "prom/prometheus:v2.13.1".into(),
            metrics_port: 9090,
            metrics_host_path: "/var/lib/cubefs/metrics".into(),
            dashboard_image: "grafana/grafana:6.4.4".into(),
            dashboard_port: 3000,
            console_image: "cubefs/cfs-server:3.3.0".into(),
            console_replicas: 1,
            console_port: 17610,
            console_log_level: "error".into(),
            console_cluster_name: "mycluster".into(),
        }
    }
}

// =============================================================================
// Application
// =============================================================================

fn default_str(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

fn default_i32(field: &mut i32, value: i32) {
    if *field == 0 {
        *field = value;
    }
}

fn default_i64(field: &mut i64, value: i64) {
    if *field == 0 {
        *field = value;
    }
}

impl DefaultTable {
    /// Fill unset fields of a cluster spec
    pub fn apply_cluster(&self, mut spec: StorageClusterSpec) -> StorageClusterSpec {
        default_str(&mut spec.image, &self.server_image);
        default_str(&mut spec.image_pull_policy, &self.image_pull_policy);
        default_str(&mut spec.data_dir_host_path, &self.data_dir_host_path);
        default_str(&mut spec.log_dir_host_path, &self.log_dir_host_path);

        let coord = &mut spec.coordinator;
        default_str(&mut coord.image, &self.coordinator_image);
        default_i32(&mut coord.port, self.coordinator_port);

        let ctrl = &mut spec.ctrl_node;
        default_i32(&mut ctrl.replicas, self.ctrl_replicas);
        default_str(&mut ctrl.log_level, &self.ctrl_log_level);
        default_i32(&mut ctrl.retain_logs, self.ctrl_retain_logs);
        default_i32(&mut ctrl.port, self.ctrl_port);
        default_i32(&mut ctrl.prof_port, self.ctrl_prof_port);
        default_i32(&mut ctrl.exporter_port, self.ctrl_exporter_port);
        default_i64(&mut ctrl.meta_reserved_mem, self.ctrl_meta_reserved_mem);

        let meta = &mut spec.meta_node;
        default_str(&mut meta.log_level, &self.meta_log_level);
        default_i64(&mut meta.total_mem, self.meta_total_mem);
        default_i32(&mut meta.port, self.meta_port);
        default_i32(&mut meta.prof_port, self.meta_prof_port);
        default_i32(&mut meta.raft_heartbeat_port, self.meta_raft_heartbeat_port);
        default_i32(&mut meta.raft_replica_port, self.meta_raft_replica_port);
        default_i32(&mut meta.exporter_port, self.meta_exporter_port);

        let data = &mut spec.data_node;
        default_str(&mut data.log_level, &self.data_log_level);
        default_i32(&mut data.port, self.data_port);
        default_i32(&mut data.prof_port, self.data_prof_port);
        default_i32(&mut data.raft_heartbeat_port, self.data_raft_heartbeat_port);
        default_i32(&mut data.raft_replica_port, self.data_raft_replica_port);
        default_i32(&mut data.exporter_port, self.data_exporter_port);

        let csi = &mut spec.provisioner;
        default_str(&mut csi.kubelet_path, &self.csi_kubelet_path);
        default_str(&mut csi.driver_name, &self.csi_driver_name);
        default_str(&mut csi.driver_image, &self.csi_driver_image);
        default_str(&mut csi.provisioner_image, &self.csi_provisioner_image);
        default_str(&mut csi.attacher_image, &self.csi_attacher_image);
        default_str(&mut csi.registrar_image, &self.csi_registrar_image);

        spec
    }

    /// Fill unset fields of a monitor spec
    pub fn apply_monitor(&self, mut spec: StorageMonitorSpec) -> StorageMonitorSpec {
        let metrics = &mut spec.metrics;
        default_str(&mut metrics.image, &self.metrics_image);
        default_i32(&mut metrics.port, self.metrics_port);
        default_str(&mut metrics.host_path, &self.metrics_host_path);

        let dashboard = &mut spec.dashboard;
        default_str(&mut dashboard.image, &self.dashboard_image);
        default_i32(&mut dashboard.port, self.dashboard_port);

        let console = &mut spec.console;
        default_str(&mut console.image, &self.console_image);
        default_i32(&mut console.replicas, self.console_replicas);
        default_i32(&mut console.port, self.console_port);
        default_str(&mut console.log_level, &self.console_log_level);
        default_str(&mut console.cluster_name, &self.console_cluster_name);

        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_defaults_fill_unset_fields() {
        let table = DefaultTable::default();
        let spec = table.apply_cluster(StorageClusterSpec::default());

        assert_eq!(spec.image, "cubefs/cfs-server:3.3.0");
        assert_eq!(spec.image_pull_policy, "IfNotPresent");
        assert_eq!(spec.data_dir_host_path, "/var/lib/cubefs");
        assert_eq!(spec.coordinator.port, 8500);
        assert_eq!(spec.ctrl_node.replicas, 4);
        assert_eq!(spec.ctrl_node.port, 17110);
        assert_eq!(spec.meta_node.port, 17210);
        assert_eq!(spec.meta_node.total_mem, 2_147_483_648);
        assert_eq!(spec.data_node.port, 17310);
        assert_eq!(spec.provisioner.driver_name, "csi.cubefs.com");
    }

    #[test]
    fn test_cluster_defaulting_is_idempotent() {
        let table = DefaultTable::default();
        let once = table.apply_cluster(StorageClusterSpec::default());
        let twice = table.apply_cluster(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_explicit_values_are_preserved() {
        let table = DefaultTable::default();
        let mut spec = StorageClusterSpec::default();
        spec.ctrl_node.replicas = 3;
        spec.ctrl_node.port = 27110;
        spec.image = "cubefs/cfs-server:nightly".into();

        let spec = table.apply_cluster(spec);
        assert_eq!(spec.ctrl_node.replicas, 3);
        assert_eq!(spec.ctrl_node.port, 27110);
        assert_eq!(spec.image, "cubefs/cfs-server:nightly");
        // untouched fields are still defaulted
        assert_eq!(spec.ctrl_node.prof_port, 17120);
    }

    #[test]
    fn test_monitor_defaults() {
        let table = DefaultTable::default();
        let spec = table.apply_monitor(StorageMonitorSpec::default());

        assert_eq!(spec.metrics.image, "prom/prometheus:v2.13.1");
        assert_eq!(spec.metrics.port, 9090);
        assert_eq!(spec.dashboard.port, 3000);
        assert_eq!(spec.console.replicas, 1);
        assert_eq!(spec.console.port, 17610);
        assert_eq!(spec.console.cluster_name, "mycluster");
    }

    #[test]
    fn test_monitor_defaulting_is_idempotent() {
        let table = DefaultTable::default();
        let once = table.apply_monitor(StorageMonitorSpec::default());
        let twice = table.apply_monitor(once.clone());
        assert_eq!(once, twice);
    }
}
