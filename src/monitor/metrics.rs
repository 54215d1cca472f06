//! Metrics collector synthesizer
//!
//! First step of the monitoring pass: a Deployment scraping the engine
//! exporters (targets discovered through the coordination service) plus the
//! Service the dashboard reads from.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, KeyToPath, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;

use crate::address::METRICS_SERVICE_NAME;
use crate::crd::StorageMonitor;
use crate::error::Result;
use crate::k8s::{
    apply_deployment, apply_service, common_labels, object_meta, Container, ContainerPort,
    EventEmitter, IntOrString, PodSpec, PodTemplateSpec, Probe, ServicePort, ServiceSpec,
    TCPSocketAction, Volume,
};
use crate::synthesis::{Role, RoleSynthesizer};

use super::config::{CONFIG_MAP_NAME, KEY_SCRAPE_CONFIG};
use super::{host_path_volume, volume_mount};

const INSTANCE_NAME: &str = "metrics";

pub struct Metrics {
    client: Client,
    events: EventEmitter,
    monitor: StorageMonitor,
    owner_ref: OwnerReference,
}

impl Metrics {
    pub fn new(
        client: Client,
        events: EventEmitter,
        monitor: &StorageMonitor,
        owner_ref: OwnerReference,
    ) -> Self {
        Self {
            client,
            events,
            monitor: monitor.clone(),
            owner_ref,
        }
    }
}

#[async_trait]
impl RoleSynthesizer for Metrics {
    fn role(&self) -> Role {
        Role::Metrics
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.monitor.namespace().to_string();

        let svc = service(&self.monitor, &self.owner_ref);
        let svc_key = format!("{}/{}", namespace, METRICS_SERVICE_NAME);
        if let Err(err) = apply_service(&self.client, &namespace, Role::Metrics, svc).await {
            self.events
                .create_failed(Role::Metrics, "Service", &svc_key)
                .await;
            return Err(err);
        }
        self.events.created(Role::Metrics, "Service", &svc_key).await;

        let dep = deployment(&self.monitor, &self.owner_ref);
        let dep_key = format!("{}/{}", namespace, INSTANCE_NAME);
        if let Err(err) = apply_deployment(&self.client, &namespace, Role::Metrics, dep).await {
            self.events
                .create_failed(Role::Metrics, "Deployment", &dep_key)
                .await;
            return Err(err);
        }
        self.events.created(Role::Metrics, "Deployment", &dep_key).await;

        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

fn labels(monitor: &StorageMonitor) -> BTreeMap<String, String> {
    common_labels(Role::Metrics, "StorageMonitor", monitor.name())
}

pub(crate) fn service(monitor: &StorageMonitor, owner_ref: &OwnerReference) -> Service {
    let labels = labels(monitor);
    Service {
        metadata: object_meta(METRICS_SERVICE_NAME, monitor.namespace(), owner_ref, &labels),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("port".to_string()),
                port: monitor.spec.metrics.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn deployment(monitor: &StorageMonitor, owner_ref: &OwnerReference) -> Deployment {
    let metrics = &monitor.spec.metrics;
    let labels = labels(monitor);

    let pod = PodSpec {
        containers: vec![Container {
            name: "metrics".to_string(),
            image: Some(metrics.image.clone()),
            args: Some(vec![
                "--config.file=/etc/metrics/prometheus.yml".to_string(),
                "--storage.tsdb.path=/metrics-data".to_string(),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("port".to_string()),
                container_port: metrics.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                volume_mount("scrape-config", "/etc/metrics"),
                volume_mount("tsdb", "/metrics-data"),
            ]),
            resources: metrics.resources.clone(),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(metrics.port),
                    ..Default::default()
                }),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }],
        volumes: Some(vec![
            Volume {
                name: "scrape-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(CONFIG_MAP_NAME.to_string()),
                    items: Some(vec![KeyToPath {
                        key: KEY_SCRAPE_CONFIG.to_string(),
                        path: "prometheus.yml".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            host_path_volume("tsdb", &metrics.host_path),
        ]),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(INSTANCE_NAME, monitor.namespace(), owner_ref, &labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testutil::{defaulted_monitor, owner_ref};

    #[test]
    fn test_deployment_mounts_scrape_config() {
        let monitor = defaulted_monitor();
        let dep = deployment(&monitor, &owner_ref(&monitor));
        let pod = dep.spec.unwrap().template.spec.unwrap();

        let volumes = pod.volumes.unwrap();
        let config = volumes.iter().find(|v| v.name == "scrape-config").unwrap();
        assert_eq!(
            config.config_map.as_ref().unwrap().name.as_deref(),
            Some("monitor-config")
        );
    }

    #[test]
    fn test_service_port_matches_spec() {
        let monitor = defaulted_monitor();
        let svc = service(&monitor, &owner_ref(&monitor));
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 9090);
    }
}
