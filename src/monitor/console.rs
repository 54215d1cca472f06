//! Console synthesizer
//!
//! Last step of the monitoring pass: the operator-facing cluster console,
//! wired to the metrics collector and dashboard through their conventional
//! Service addresses.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;

use crate::address::{self, CONSOLE_SERVICE_NAME};
use crate::crd::StorageMonitor;
use crate::error::Result;
use crate::k8s::{
    apply_deployment, apply_service, common_labels, object_meta, Container, ContainerPort,
    EnvVar, EventEmitter, IntOrString, PodSpec, PodTemplateSpec, Probe, ServicePort, ServiceSpec,
    TCPSocketAction,
};
use crate::synthesis::{Role, RoleSynthesizer};

const INSTANCE_NAME: &str = "console";

pub struct Console {
    client: Client,
    events: EventEmitter,
    monitor: StorageMonitor,
    owner_ref: OwnerReference,
}

impl Console {
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
impl RoleSynthesizer for Console {
    fn role(&self) -> Role {
        Role::Console
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.monitor.namespace().to_string();

        let svc = service(&self.monitor, &self.owner_ref);
        let svc_key = format!("{}/{}", namespace, CONSOLE_SERVICE_NAME);
        if let Err(err) = apply_service(&self.client, &namespace, Role::Console, svc).await {
            self.events
                .create_failed(Role::Console, "Service", &svc_key)
                .await;
            return Err(err);
        }
        self.events.created(Role::Console, "Service", &svc_key).await;

        let dep = deployment(&self.monitor, &self.owner_ref);
        let dep_key = format!("{}/{}", namespace, INSTANCE_NAME);
        if let Err(err) = apply_deployment(&self.client, &namespace, Role::Console, dep).await {
            self.events
                .create_failed(Role::Console, "Deployment", &dep_key)
                .await;
            return Err(err);
        }
        self.events.created(Role::Console, "Deployment", &dep_key).await;

        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

fn labels(monitor: &StorageMonitor) -> BTreeMap<String, String> {
    common_labels(Role::Console, "StorageMonitor", monitor.name())
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

pub(crate) fn service(monitor: &StorageMonitor, owner_ref: &OwnerReference) -> Service {
    let labels = labels(monitor);
    Service {
        metadata: object_meta(CONSOLE_SERVICE_NAME, monitor.namespace(), owner_ref, &labels),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("port".to_string()),
                port: monitor.spec.console.port,
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
    let console = &monitor.spec.console;
    let namespace = monitor.namespace();
    let labels = labels(monitor);

    let pod = PodSpec {
        containers: vec![Container {
            name: "console".to_string(),
            image: Some(console.image.clone()),
            command: Some(vec!["/bin/bash".to_string()]),
            args: Some(vec![
                "-c".to_string(),
                "/cfs/bin/start.sh console; sleep 999999999d".to_string(),
            ]),
            env: Some(vec![
                env("CFS_CLUSTER_NAME", console.cluster_name.clone()),
                env("CFS_PORT", console.port.to_string()),
                env("CFS_LOG_LEVEL", console.log_level.clone()),
                env(
                    "CFS_METRICS_ADDR",
                    address::metrics_url(namespace, monitor.spec.metrics.port),
                ),
                env(
                    "CFS_DASHBOARD_URL",
                    address::dashboard_url(namespace, monitor.spec.dashboard.port),
                ),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("port".to_string()),
                container_port: console.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: console.resources.clone(),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(console.port),
                    ..Default::default()
                }),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(INSTANCE_NAME, namespace, owner_ref, &labels),
        spec: Some(DeploymentSpec {
            replicas: Some(console.replicas),
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
    fn test_console_addresses_predecessors_by_convention() {
        let monitor = defaulted_monitor();
        let dep = deployment(&monitor, &owner_ref(&monitor));
        let pod = dep.spec.unwrap().template.spec.unwrap();
        let envs = pod.containers[0].env.as_ref().unwrap();

        let metrics = envs.iter().find(|e| e.name == "CFS_METRICS_ADDR").unwrap();
        assert_eq!(
            metrics.value.as_deref(),
            Some("http://metrics-svc.monitoring.svc.cluster.local:9090")
        );
        let dashboard = envs.iter().find(|e| e.name == "CFS_DASHBOARD_URL").unwrap();
        assert_eq!(
            dashboard.value.as_deref(),
            Some("http://dashboard-svc.monitoring.svc.cluster.local:3000")
        );
    }

    #[test]
    fn test_console_replicas_from_spec() {
        let monitor = defaulted_monitor();
        let dep = deployment(&monitor, &owner_ref(&monitor));
        assert_eq!(dep.spec.unwrap().replicas, Some(1));
    }
}
