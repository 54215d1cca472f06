//! Dashboard synthesizer
//!
//! Second step of the monitoring pass. The dashboard is provisioned from the
//! shared ConfigMap (datasource pointing at the metrics Service, dashboard
//! provider), so it comes up wired without manual setup.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{ConfigMapVolumeSource, KeyToPath, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;

use crate::address::DASHBOARD_SERVICE_NAME;
use crate::crd::StorageMonitor;
use crate::error::Result;
use crate::k8s::{
    apply_deployment, apply_service, common_labels, object_meta, Container, ContainerPort,
    EventEmitter, IntOrString, PodSpec, PodTemplateSpec, Probe, ServicePort, ServiceSpec,
    TCPSocketAction, Volume,
};
use crate::synthesis::{Role, RoleSynthesizer};

use super::config::{CONFIG_MAP_NAME, KEY_DASHBOARD_PROVIDER, KEY_DATASOURCE};
use super::volume_mount;

const INSTANCE_NAME: &str = "dashboard";

pub struct Dashboard {
    client: Client,
    events: EventEmitter,
    monitor: StorageMonitor,
    owner_ref: OwnerReference,
}

impl Dashboard {
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
impl RoleSynthesizer for Dashboard {
    fn role(&self) -> Role {
        Role::Dashboard
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.monitor.namespace().to_string();

        let svc = service(&self.monitor, &self.owner_ref);
        let svc_key = format!("{}/{}", namespace, DASHBOARD_SERVICE_NAME);
        if let Err(err) = apply_service(&self.client, &namespace, Role::Dashboard, svc).await {
            self.events
                .create_failed(Role::Dashboard, "Service", &svc_key)
                .await;
            return Err(err);
        }
        self.events
            .created(Role::Dashboard, "Service", &svc_key)
            .await;

        let dep = deployment(&self.monitor, &self.owner_ref);
        let dep_key = format!("{}/{}", namespace, INSTANCE_NAME);
        if let Err(err) = apply_deployment(&self.client, &namespace, Role::Dashboard, dep).await {
            self.events
                .create_failed(Role::Dashboard, "Deployment", &dep_key)
                .await;
            return Err(err);
        }
        self.events
            .created(Role::Dashboard, "Deployment", &dep_key)
            .await;

        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

fn labels(monitor: &StorageMonitor) -> BTreeMap<String, String> {
    common_labels(Role::Dashboard, "StorageMonitor", monitor.name())
}

pub(crate) fn service(monitor: &StorageMonitor, owner_ref: &OwnerReference) -> Service {
    let labels = labels(monitor);
    Service {
        metadata: object_meta(
            DASHBOARD_SERVICE_NAME,
            monitor.namespace(),
            owner_ref,
            &labels,
        ),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("port".to_string()),
                port: monitor.spec.dashboard.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn provisioning_volume(name: &str, key: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(CONFIG_MAP_NAME.to_string()),
            items: Some(vec![KeyToPath {
                key: key.to_string(),
                path: path.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn deployment(monitor: &StorageMonitor, owner_ref: &OwnerReference) -> Deployment {
    let dashboard = &monitor.spec.dashboard;
    let labels = labels(monitor);

    let pod = PodSpec {
        containers: vec![Container {
            name: "dashboard".to_string(),
            image: Some(dashboard.image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("port".to_string()),
                container_port: dashboard.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                volume_mount("datasources", "/etc/grafana/provisioning/datasources"),
                volume_mount("providers", "/etc/grafana/provisioning/dashboards"),
            ]),
            resources: dashboard.resources.clone(),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(dashboard.port),
                    ..Default::default()
                }),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }],
        volumes: Some(vec![
            provisioning_volume("datasources", KEY_DATASOURCE, "datasource.yml"),
            provisioning_volume("providers", KEY_DASHBOARD_PROVIDER, "dashboard.yml"),
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
    fn test_dashboard_mounts_provisioning_config() {
        let monitor = defaulted_monitor();
        let dep = deployment(&monitor, &owner_ref(&monitor));
        let pod = dep.spec.unwrap().template.spec.unwrap();

        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.mount_path == "/etc/grafana/provisioning/datasources"));
    }

    #[test]
    fn test_dashboard_probe_uses_declared_port() {
        let monitor = defaulted_monitor();
        let dep = deployment(&monitor, &owner_ref(&monitor));
        let pod = dep.spec.unwrap().template.spec.unwrap();
        let probe = pod.containers[0].readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.tcp_socket.as_ref().unwrap().port,
            IntOrString::Int(3000)
        );
    }
}
