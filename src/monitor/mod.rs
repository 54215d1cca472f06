//! Role synthesizers for the monitoring pass
//!
//! An independently-ordered chain (metrics collector, dashboard, console)
//! driven by the StorageMonitor resource plus the ConfigMap they share.

pub mod config;
pub mod console;
pub mod dashboard;
pub mod metrics;

pub use config::config_map;
pub use console::Console;
pub use dashboard::Dashboard;
pub use metrics::Metrics;

use crate::k8s::{HostPathVolumeSource, Volume, VolumeMount};

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

#[cfg(test)]
pub(crate) mod testutil {
    use crate::crd::{DefaultTable, StorageMonitor, StorageMonitorSpec};
    use crate::k8s::owner_reference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    /// A defaulted monitor the way the reconciler would see it mid-pass
    pub(crate) fn defaulted_monitor() -> StorageMonitor {
        let mut monitor = StorageMonitor::new("mymonitor", StorageMonitorSpec::default());
        monitor.metadata.namespace = Some("monitoring".to_string());
        monitor.metadata.uid = Some("uid-5678".to_string());
        monitor.spec = DefaultTable::default().apply_monitor(monitor.spec);
        monitor
    }

    pub(crate) fn owner_ref(monitor: &StorageMonitor) -> OwnerReference {
        owner_reference(monitor).expect("test monitor has a uid")
    }
}
