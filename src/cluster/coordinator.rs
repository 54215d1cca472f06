//! Coordination service synthesizer
//!
//! First step of the cluster pass. Runs a single-replica coordination
//! service Deployment plus the Service every other role uses to reach it.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;

use crate::address::COORDINATOR_SERVICE_NAME;
use crate::crd::StorageCluster;
use crate::error::Result;
use crate::k8s::{
    apply_deployment, apply_service, common_labels, object_meta, Container, ContainerPort,
    EventEmitter, IntOrString, PodSpec, PodTemplateSpec, Probe, SecurityContext, ServicePort,
    ServiceSpec, TCPSocketAction,
};
use crate::synthesis::{Role, RoleSynthesizer};

const INSTANCE_NAME: &str = "coord";

pub struct Coordinator {
    client: Client,
    events: EventEmitter,
    cluster: StorageCluster,
    owner_ref: OwnerReference,
}

impl Coordinator {
    pub fn new(
        client: Client,
        events: EventEmitter,
        cluster: &StorageCluster,
        owner_ref: OwnerReference,
    ) -> Self {
        Self {
            client,
            events,
            cluster: cluster.clone(),
            owner_ref,
        }
    }
}

#[async_trait]
impl RoleSynthesizer for Coordinator {
    fn role(&self) -> Role {
        Role::Coordinator
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.cluster.namespace().to_string();

        let svc = service(&self.cluster, &self.owner_ref);
        let svc_key = format!("{}/{}", namespace, COORDINATOR_SERVICE_NAME);
        if let Err(err) = apply_service(&self.client, &namespace, Role::Coordinator, svc).await {
            self.events
                .create_failed(Role::Coordinator, "Service", &svc_key)
                .await;
            return Err(err);
        }
        self.events
            .created(Role::Coordinator, "Service", &svc_key)
            .await;

        let dep = deployment(&self.cluster, &self.owner_ref);
        let dep_key = format!("{}/{}", namespace, INSTANCE_NAME);
        if let Err(err) = apply_deployment(&self.client, &namespace, Role::Coordinator, dep).await {
            self.events
                .create_failed(Role::Coordinator, "Deployment", &dep_key)
                .await;
            return Err(err);
        }
        self.events
            .created(Role::Coordinator, "Deployment", &dep_key)
            .await;

        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

fn labels(cluster: &StorageCluster) -> BTreeMap<String, String> {
    common_labels(Role::Coordinator, "StorageCluster", cluster.name())
}

pub(crate) fn service(cluster: &StorageCluster, owner_ref: &OwnerReference) -> Service {
    let labels = labels(cluster);
    Service {
        metadata: object_meta(
            COORDINATOR_SERVICE_NAME,
            cluster.namespace(),
            owner_ref,
            &labels,
        ),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("port".to_string()),
                port: cluster.spec.coordinator.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn deployment(cluster: &StorageCluster, owner_ref: &OwnerReference) -> Deployment {
    let labels = labels(cluster);
    Deployment {
        metadata: object_meta(INSTANCE_NAME, cluster.namespace(), owner_ref, &labels),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec(cluster)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_spec(cluster: &StorageCluster) -> PodSpec {
    let coord = &cluster.spec.coordinator;
    PodSpec {
        containers: vec![Container {
            name: "coordinator".to_string(),
            image: Some(coord.image.clone()),
            image_pull_policy: Some(cluster.spec.image_pull_policy.clone()),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ports: Some(vec![ContainerPort {
                name: Some("port".to_string()),
                container_port: coord.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: coord.resources.clone(),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(coord.port),
                    ..Default::default()
                }),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }],
        image_pull_secrets: if cluster.spec.image_pull_secrets.is_empty() {
            None
        } else {
            Some(cluster.spec.image_pull_secrets.clone())
        },
        node_selector: if coord.node_selector.is_empty() {
            None
        } else {
            Some(coord.node_selector.clone())
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{defaulted_cluster, owner_ref};

    #[test]
    fn test_service_exposes_coordinator_port() {
        let cluster = defaulted_cluster();
        let svc = service(&cluster, &owner_ref(&cluster));

        assert_eq!(svc.metadata.name.as_deref(), Some("coord-svc"));
        let ports = svc.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8500);
    }

    #[test]
    fn test_deployment_is_single_replica_with_probe() {
        let cluster = defaulted_cluster();
        let dep = deployment(&cluster, &owner_ref(&cluster));

        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("consul:1.6.1"));
        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(
            probe.tcp_socket.as_ref().unwrap().port,
            IntOrString::Int(8500)
        );
    }

    #[test]
    fn test_owner_reference_is_threaded() {
        let cluster = defaulted_cluster();
        let dep = deployment(&cluster, &owner_ref(&cluster));
        let refs = dep.metadata.owner_references.unwrap();
        assert_eq!(refs[0].uid, "uid-1234");
    }
}
