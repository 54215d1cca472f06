//! Ctrl-node synthesizer
//!
//! Second step of the cluster pass. Runs the ctrl-node quorum as a
//! StatefulSet so each replica keeps a stable ordinal identity, plus the
//! governing Service whose DNS records the peer list convention relies on.
//! The raft peer list is resolved purely from the declared replica count and
//! templated into the pods' environment before any pod exists.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;

use crate::address::{self, CTRL_INSTANCE_NAME, CTRL_SERVICE_NAME};
use crate::crd::StorageCluster;
use crate::error::Result;
use crate::k8s::{
    apply_service, apply_stateful_set, common_labels, object_meta, Container, ContainerPort,
    EventEmitter, IntOrString, PodSpec, PodTemplateSpec, Probe, SecurityContext, ServicePort,
    ServiceSpec, TCPSocketAction,
};
use crate::synthesis::{Role, RoleSynthesizer};

use super::{
    env, env_from_field, host_path_volume, node_selector, volume_mount, CONTAINER_DATA_PATH,
    CONTAINER_LOG_PATH, START_SCRIPT, VOLUME_DATA, VOLUME_LOG,
};

pub struct CtrlNode {
    client: Client,
    events: EventEmitter,
    cluster: StorageCluster,
    owner_ref: OwnerReference,
}

impl CtrlNode {
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
impl RoleSynthesizer for CtrlNode {
    fn role(&self) -> Role {
        Role::CtrlNode
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.cluster.namespace().to_string();

        let svc = service(&self.cluster, &self.owner_ref);
        let svc_key = format!("{}/{}", namespace, CTRL_SERVICE_NAME);
        if let Err(err) = apply_service(&self.client, &namespace, Role::CtrlNode, svc).await {
            self.events
                .create_failed(Role::CtrlNode, "Service", &svc_key)
                .await;
            return Err(err);
        }
        self.events.created(Role::CtrlNode, "Service", &svc_key).await;

        // peer resolution happens before the apply so a misconfigured
        // replica count surfaces as an address error, not a broken rollout
        let sts = stateful_set(&self.cluster, &self.owner_ref)?;
        let sts_key = format!("{}/{}", namespace, CTRL_INSTANCE_NAME);
        if let Err(err) = apply_stateful_set(&self.client, &namespace, Role::CtrlNode, sts).await {
            self.events
                .create_failed(Role::CtrlNode, "StatefulSet", &sts_key)
                .await;
            return Err(err);
        }
        self.events
            .created(Role::CtrlNode, "StatefulSet", &sts_key)
            .await;

        Ok(())
    }
}

// =============================================================================
// Address helpers consumed by dependent roles
// =============================================================================

/// Comma-joined addresses of every ctrl-node replica
pub fn addr_list(cluster: &StorageCluster) -> Result<String> {
    let ctrl = &cluster.spec.ctrl_node;
    Ok(address::ctrl_addr_list(cluster.namespace(), ctrl.replicas, ctrl.port)?.join(","))
}

/// Comma-joined raft peer list (`id:addr` entries)
pub fn peer_list(cluster: &StorageCluster) -> Result<String> {
    let ctrl = &cluster.spec.ctrl_node;
    Ok(address::ctrl_peer_list(cluster.namespace(), ctrl.replicas, ctrl.port)?.join(","))
}

/// Load-balanced ctrl Service address (any replica)
pub fn service_addr(cluster: &StorageCluster) -> String {
    address::ctrl_service_addr(cluster.namespace(), cluster.spec.ctrl_node.port)
}

// =============================================================================
// Templates
// =============================================================================

fn labels(cluster: &StorageCluster) -> BTreeMap<String, String> {
    common_labels(Role::CtrlNode, "StorageCluster", cluster.name())
}

pub(crate) fn service(cluster: &StorageCluster, owner_ref: &OwnerReference) -> Service {
    let labels = labels(cluster);
    Service {
        metadata: object_meta(CTRL_SERVICE_NAME, cluster.namespace(), owner_ref, &labels),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("port".to_string()),
                port: cluster.spec.ctrl_node.port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn stateful_set(
    cluster: &StorageCluster,
    owner_ref: &OwnerReference,
) -> Result<StatefulSet> {
    let labels = labels(cluster);
    let pod = pod_spec(cluster)?;
    Ok(StatefulSet {
        metadata: object_meta(CTRL_INSTANCE_NAME, cluster.namespace(), owner_ref, &labels),
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.spec.ctrl_node.replicas),
            service_name: CTRL_SERVICE_NAME.to_string(),
            pod_management_policy: Some("OrderedReady".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                ..Default::default()
            }),
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
    })
}

fn pod_spec(cluster: &StorageCluster) -> Result<PodSpec> {
    let spec = &cluster.spec;
    let ctrl = &spec.ctrl_node;
    let peers = peer_list(cluster)?;

    Ok(PodSpec {
        host_network: Some(true),
        host_pid: Some(true),
        dns_policy: Some("ClusterFirstWithHostNet".to_string()),
        priority_class_name: spec.priority_class_name.clone(),
        image_pull_secrets: if spec.image_pull_secrets.is_empty() {
            None
        } else {
            Some(spec.image_pull_secrets.clone())
        },
        containers: vec![Container {
            name: "ctrlnode".to_string(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            command: Some(vec!["/bin/bash".to_string()]),
            args: Some(vec![
                "-c".to_string(),
                format!("{} ctrl; sleep 999999999d", START_SCRIPT),
            ]),
            env: Some(vec![
                env("CFS_CLUSTER_NAME", cluster.name()),
                env("CFS_PORT", ctrl.port.to_string()),
                env("CFS_PROF_PORT", ctrl.prof_port.to_string()),
                env("CFS_PEERS", peers),
                env("CFS_RETAIN_LOGS", ctrl.retain_logs.to_string()),
                env("CFS_LOG_LEVEL", ctrl.log_level.clone()),
                env("CFS_EXPORTER_PORT", ctrl.exporter_port.to_string()),
                env(
                    "CFS_COORDINATOR_ADDR",
                    address::coordinator_url(cluster.namespace(), spec.coordinator.port),
                ),
                env("CFS_META_RESERVED_MEM", ctrl.meta_reserved_mem.to_string()),
                env_from_field("POD_IP", "status.podIP"),
                env_from_field("POD_NAME", "metadata.name"),
            ]),
            ports: Some(vec![
                // port names must stay under 15 characters
                ContainerPort {
                    name: Some("port".to_string()),
                    container_port: ctrl.port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("prof".to_string()),
                    container_port: ctrl.prof_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("exporter-port".to_string()),
                    container_port: ctrl.exporter_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![
                volume_mount(VOLUME_LOG, CONTAINER_LOG_PATH),
                volume_mount(VOLUME_DATA, CONTAINER_DATA_PATH),
            ]),
            resources: ctrl.resources.clone(),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(ctrl.port),
                    ..Default::default()
                }),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }],
        volumes: Some(vec![
            host_path_volume(VOLUME_LOG, &spec.log_dir_host_path),
            host_path_volume(VOLUME_DATA, &spec.data_dir_host_path),
        ]),
        node_selector: Some(node_selector(
            Role::CtrlNode,
            cluster.namespace(),
            &ctrl.node_selector,
        )),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{defaulted_cluster, owner_ref};
    use assert_matches::assert_matches;
    use crate::error::Error;

    fn find_env<'a>(pod: &'a PodSpec, name: &str) -> &'a str {
        pod.containers[0]
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| e.value.as_deref())
            .unwrap_or_else(|| panic!("env {} not set", name))
    }

    #[test]
    fn test_stateful_set_identity() {
        let cluster = defaulted_cluster();
        let sts = stateful_set(&cluster, &owner_ref(&cluster)).unwrap();

        assert_eq!(sts.metadata.name.as_deref(), Some("ctrl"));
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(4));
        assert_eq!(spec.service_name, "ctrl-svc");
        assert_eq!(spec.pod_management_policy.as_deref(), Some("OrderedReady"));
    }

    #[test]
    fn test_peer_list_is_templated_before_pods_exist() {
        let cluster = defaulted_cluster();
        let sts = stateful_set(&cluster, &owner_ref(&cluster)).unwrap();
        let pod = sts.spec.unwrap().template.spec.unwrap();

        let peers = find_env(&pod, "CFS_PEERS");
        assert!(peers.starts_with("1:ctrl-0.ctrl-svc.storage.svc.cluster.local:17110"));
        assert_eq!(peers.split(',').count(), 4);
    }

    #[test]
    fn test_coordinator_addr_resolved_from_convention() {
        let cluster = defaulted_cluster();
        let sts = stateful_set(&cluster, &owner_ref(&cluster)).unwrap();
        let pod = sts.spec.unwrap().template.spec.unwrap();

        assert_eq!(
            find_env(&pod, "CFS_COORDINATOR_ADDR"),
            "http://coord-svc.storage.svc.cluster.local:8500"
        );
    }

    #[test]
    fn test_zero_replicas_refuses_to_template() {
        let mut cluster = defaulted_cluster();
        cluster.spec.ctrl_node.replicas = -1;
        let err = stateful_set(&cluster, &owner_ref(&cluster)).unwrap_err();
        assert_matches!(err, Error::AddressResolution { .. });
    }

    #[test]
    fn test_service_addr_uses_service_domain() {
        let cluster = defaulted_cluster();
        assert_eq!(
            service_addr(&cluster),
            "ctrl-svc.storage.svc.cluster.local:17110"
        );
    }
}
