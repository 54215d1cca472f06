//! StorageMonitor CRD
//!
//! Declares the monitoring stack for a storage cluster: a metrics collector
//! scraping the engine exporters, a dashboard in front of it, and the
//! cluster console. Reconciled independently of StorageCluster.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// StorageMonitor CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.billyronks.io",
    version = "v1alpha1",
    kind = "StorageMonitor",
    plural = "storagemonitors",
    shortname = "smon",
    status = "StorageMonitorStatus",
    printcolumn = r#"{"name": "Metrics", "type": "string", "jsonPath": ".status.metrics"}"#,
    printcolumn = r#"{"name": "Dashboard", "type": "string", "jsonPath": ".status.dashboard"}"#,
    printcolumn = r#"{"name": "Console", "type": "string", "jsonPath": ".status.console"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageMonitorSpec {
    /// Metrics collector
    #[serde(default)]
    pub metrics: MetricsSpec,

    /// Dashboard in front of the metrics collector
    #[serde(default)]
    pub dashboard: DashboardSpec,

    /// Cluster console
    #[serde(default)]
    pub console: ConsoleSpec,
}

/// Metrics collector settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSpec {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub port: i32,

    /// Host path backing the metrics time-series store
    #[serde(default)]
    pub host_path: String,

    /// Coordination service URL used for scrape target discovery. Empty
    /// means the coordination service of a cluster in the same namespace.
    #[serde(default)]
    pub coordinator_addr: String,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Dashboard settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSpec {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub port: i32,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

/// Console settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleSpec {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub port: i32,

    #[serde(default)]
    pub log_level: String,

    /// Cluster name shown by the console; must match the engine cluster
    #[serde(default)]
    pub cluster_name: String,

    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}

// =============================================================================
// Status
// =============================================================================

/// Per-component readiness of the monitoring chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageMonitorStatus {
    #[serde(default)]
    pub config_map: ComponentState,

    #[serde(default)]
    pub metrics: ComponentState,

    #[serde(default)]
    pub dashboard: ComponentState,

    #[serde(default)]
    pub console: ComponentState,
}

/// Readiness of one monitoring component
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ComponentState {
    Ready,
    Failure,
    #[default]
    Unknown,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ComponentState::Ready => "Ready",
            ComponentState::Failure => "Failure",
            ComponentState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl StorageMonitor {
    /// Name of this monitor
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Namespace of this monitor
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Whether a deletion marker is set
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_state_defaults_to_unknown() {
        let status = StorageMonitorStatus::default();
        assert_eq!(status.metrics, ComponentState::Unknown);
        assert_eq!(status.dashboard, ComponentState::Unknown);
        assert_eq!(status.console, ComponentState::Unknown);
    }

    #[test]
    fn test_component_state_display() {
        assert_eq!(ComponentState::Ready.to_string(), "Ready");
        assert_eq!(ComponentState::Failure.to_string(), "Failure");
    }
}
