//! Monitoring configuration payloads
//!
//! Renders the ConfigMap every monitoring component mounts: the metrics
//! collector's scrape configuration (service discovery via the coordination
//! service) and the dashboard's datasource and provider definitions.

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::address;
use crate::crd::{StorageMonitor, DEFAULT_COORDINATOR_PORT};
use crate::error::Result;
use crate::k8s::{common_labels, object_meta};
use crate::synthesis::Role;

pub const CONFIG_MAP_NAME: &str = "monitor-config";

pub const KEY_SCRAPE_CONFIG: &str = "prometheus.yml";
pub const KEY_DATASOURCE: &str = "datasource.yml";
pub const KEY_DASHBOARD_PROVIDER: &str = "dashboard.yml";

// =============================================================================
// Scrape configuration
// =============================================================================

#[derive(Debug, Serialize)]
struct ScrapeFile {
    global: ScrapeGlobal,
    scrape_configs: Vec<ScrapeJob>,
}

#[derive(Debug, Serialize)]
struct ScrapeGlobal {
    scrape_interval: String,
    evaluation_interval: String,
}

#[derive(Debug, Serialize)]
struct ScrapeJob {
    job_name: String,
    metrics_path: String,
    consul_sd_configs: Vec<DiscoveryConfig>,
}

#[derive(Debug, Serialize)]
struct DiscoveryConfig {
    server: String,
    services: Vec<String>,
}

// =============================================================================
// Dashboard datasource / provider
// =============================================================================

#[derive(Debug, Serialize)]
struct DatasourceFile {
    #[serde(rename = "apiVersion")]
    api_version: i32,
    datasources: Vec<Datasource>,
}

#[derive(Debug, Serialize)]
struct Datasource {
    name: String,
    r#type: String,
    access: String,
    url: String,
    #[serde(rename = "isDefault")]
    is_default: bool,
    editable: bool,
}

#[derive(Debug, Serialize)]
struct ProviderFile {
    #[serde(rename = "apiVersion")]
    api_version: i32,
    providers: Vec<Provider>,
}

#[derive(Debug, Serialize)]
struct Provider {
    name: String,
    folder: String,
    r#type: String,
    options: ProviderOptions,
}

#[derive(Debug, Serialize)]
struct ProviderOptions {
    path: String,
}

// =============================================================================
// Rendering
// =============================================================================

/// Scrape target discovery endpoint: the declared one, or the coordination
/// service of a same-namespace cluster by convention
fn discovery_url(monitor: &StorageMonitor) -> String {
    let declared = &monitor.spec.metrics.coordinator_addr;
    if declared.is_empty() {
        address::coordinator_url(monitor.namespace(), DEFAULT_COORDINATOR_PORT)
    } else {
        declared.clone()
    }
}

fn render_scrape_config(monitor: &StorageMonitor) -> Result<String> {
    let file = ScrapeFile {
        global: ScrapeGlobal {
            scrape_interval: "15s".to_string(),
            evaluation_interval: "15s".to_string(),
        },
        scrape_configs: vec![ScrapeJob {
            job_name: "cubefs".to_string(),
            metrics_path: "/metrics".to_string(),
            consul_sd_configs: vec![DiscoveryConfig {
                server: discovery_url(monitor),
                services: vec![],
            }],
        }],
    };
    Ok(serde_yaml::to_string(&file)?)
}

fn render_datasource(monitor: &StorageMonitor) -> Result<String> {
    let file = DatasourceFile {
        api_version: 1,
        datasources: vec![Datasource {
            name: "metrics".to_string(),
            r#type: "prometheus".to_string(),
            access: "proxy".to_string(),
            url: address::metrics_url(monitor.namespace(), monitor.spec.metrics.port),
            is_default: true,
            editable: true,
        }],
    };
    Ok(serde_yaml::to_string(&file)?)
}

fn render_dashboard_provider() -> Result<String> {
    let file = ProviderFile {
        api_version: 1,
        providers: vec![Provider {
            name: "cubefs".to_string(),
            folder: "".to_string(),
            r#type: "file".to_string(),
            options: ProviderOptions {
                path: "/var/lib/grafana/dashboards".to_string(),
            },
        }],
    };
    Ok(serde_yaml::to_string(&file)?)
}

/// Build the shared monitoring ConfigMap
pub fn config_map(monitor: &StorageMonitor, owner_ref: &OwnerReference) -> Result<ConfigMap> {
    let labels = common_labels(Role::Metrics, "StorageMonitor", monitor.name());
    let data = BTreeMap::from([
        (
            KEY_SCRAPE_CONFIG.to_string(),
            render_scrape_config(monitor)?,
        ),
        (KEY_DATASOURCE.to_string(), render_datasource(monitor)?),
        (
            KEY_DASHBOARD_PROVIDER.to_string(),
            render_dashboard_provider()?,
        ),
    ]);

    Ok(ConfigMap {
        metadata: object_meta(CONFIG_MAP_NAME, monitor.namespace(), owner_ref, &labels),
        data: Some(data),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testutil::{defaulted_monitor, owner_ref};

    #[test]
    fn test_scrape_config_discovers_via_coordinator() {
        let monitor = defaulted_monitor();
        let rendered = render_scrape_config(&monitor).unwrap();
        assert!(rendered.contains("job_name: cubefs"));
        assert!(rendered.contains("http://coord-svc.monitoring.svc.cluster.local:8500"));
    }

    #[test]
    fn test_declared_discovery_url_wins() {
        let mut monitor = defaulted_monitor();
        monitor.spec.metrics.coordinator_addr = "http://coord.elsewhere:8500".to_string();
        let rendered = render_scrape_config(&monitor).unwrap();
        assert!(rendered.contains("http://coord.elsewhere:8500"));
    }

    #[test]
    fn test_datasource_points_at_metrics_service() {
        let monitor = defaulted_monitor();
        let rendered = render_datasource(&monitor).unwrap();
        assert!(rendered.contains("http://metrics-svc.monitoring.svc.cluster.local:9090"));
        assert!(rendered.contains("type: prometheus"));
    }

    #[test]
    fn test_config_map_has_all_keys() {
        let monitor = defaulted_monitor();
        let cm = config_map(&monitor, &owner_ref(&monitor)).unwrap();
        let data = cm.data.unwrap();
        assert!(data.contains_key(KEY_SCRAPE_CONFIG));
        assert!(data.contains_key(KEY_DATASOURCE));
        assert!(data.contains_key(KEY_DASHBOARD_PROVIDER));
    }
}
