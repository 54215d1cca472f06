//! Meta-node synthesizer
//!
//! Runs the metadata fleet as a DaemonSet over opted-in nodes. Pods resolve
//! the ctrl-node quorum at start through an init container check; the
//! addresses themselves are templated from the naming convention, so this
//! step never waits for the ctrl-nodes to be ready.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;

use crate::address;
use crate::crd::StorageCluster;
use crate::error::Result;
use crate::k8s::{
    apply_daemon_set, common_labels, object_meta, Container, ContainerPort, EventEmitter,
    IntOrString, PodSpec, PodTemplateSpec, Probe, SecurityContext, TCPSocketAction,
};
use crate::synthesis::{Role, RoleSynthesizer};

use super::{
    ctrlnode, env, host_path_volume, node_selector, volume_mount, CONTAINER_DATA_PATH,
    CONTAINER_LOG_PATH, START_SCRIPT, VOLUME_DATA, VOLUME_LOG,
};

const INSTANCE_NAME: &str = "meta";

pub struct MetaNode {
    client: Client,
    events: EventEmitter,
    cluster: StorageCluster,
    owner_ref: OwnerReference,
}

impl MetaNode {
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
impl RoleSynthesizer for MetaNode {
    fn role(&self) -> Role {
        Role::MetaNode
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.cluster.namespace().to_string();
        let ds = daemon_set(&self.cluster, &self.owner_ref)?;
        let key = format!("{}/{}", namespace, INSTANCE_NAME);

        if let Err(err) = apply_daemon_set(&self.client, &namespace, Role::MetaNode, ds).await {
            self.events
                .create_failed(Role::MetaNode, "DaemonSet", &key)
                .await;
            return Err(err);
        }
        self.events.created(Role::MetaNode, "DaemonSet", &key).await;
        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

fn labels(cluster: &StorageCluster) -> BTreeMap<String, String> {
    common_labels(Role::MetaNode, "StorageCluster", cluster.name())
}

pub(crate) fn daemon_set(
    cluster: &StorageCluster,
    owner_ref: &OwnerReference,
) -> Result<DaemonSet> {
    let labels = labels(cluster);
    let pod = pod_spec(cluster)?;
    Ok(DaemonSet {
        metadata: object_meta(INSTANCE_NAME, cluster.namespace(), owner_ref, &labels),
        spec: Some(DaemonSetSpec {
            update_strategy: Some(DaemonSetUpdateStrategy {
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
    let meta = &spec.meta_node;
    let ctrl_addrs = ctrlnode::addr_list(cluster)?;

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
        init_containers: Some(vec![Container {
            name: "check-service".to_string(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            command: Some(vec![START_SCRIPT.to_string()]),
            args: Some(vec!["check".to_string(), ctrl_addrs.clone()]),
            ..Default::default()
        }]),
        containers: vec![Container {
            name: "metanode".to_string(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            command: Some(vec!["/bin/bash".to_string()]),
            args: Some(vec![
                "-c".to_string(),
                format!("{} metanode; sleep 999999999d", START_SCRIPT),
            ]),
            env: Some(vec![
                env("CFS_PORT", meta.port.to_string()),
                env("CFS_PROF_PORT", meta.prof_port.to_string()),
                env("CFS_RAFT_HEARTBEAT_PORT", meta.raft_heartbeat_port.to_string()),
                env("CFS_RAFT_REPLICA_PORT", meta.raft_replica_port.to_string()),
                env("CFS_EXPORTER_PORT", meta.exporter_port.to_string()),
                env("CFS_CTRL_ADDRS", ctrl_addrs),
                env("CFS_TOTAL_MEM", meta.total_mem.to_string()),
                env("CFS_LOG_LEVEL", meta.log_level.clone()),
                env(
                    "CFS_COORDINATOR_ADDR",
                    address::coordinator_url(cluster.namespace(), spec.coordinator.port),
                ),
                env("CFS_ZONE", meta.zone.clone()),
            ]),
            ports: Some(vec![
                ContainerPort {
                    name: Some("port".to_string()),
                    container_port: meta.port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("prof".to_string()),
                    container_port: meta.prof_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("heartbeat-port".to_string()),
                    container_port: meta.raft_heartbeat_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("replica-port".to_string()),
                    container_port: meta.raft_replica_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("exporter-port".to_string()),
                    container_port: meta.exporter_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![
                volume_mount(VOLUME_LOG, CONTAINER_LOG_PATH),
                volume_mount(VOLUME_DATA, CONTAINER_DATA_PATH),
            ]),
            resources: meta.resources.clone(),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(meta.port),
                    ..Default::default()
                }),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }],
        volumes: Some(vec![
            host_path_volume(VOLUME_DATA, &spec.data_dir_host_path),
            host_path_volume(VOLUME_LOG, &spec.log_dir_host_path),
        ]),
        node_selector: Some(node_selector(
            Role::MetaNode,
            cluster.namespace(),
            &meta.node_selector,
        )),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{defaulted_cluster, owner_ref};

    #[test]
    fn test_init_container_waits_on_ctrl_quorum() {
        let cluster = defaulted_cluster();
        let ds = daemon_set(&cluster, &owner_ref(&cluster)).unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();

        let init = &pod.init_containers.unwrap()[0];
        assert_eq!(init.name, "check-service");
        let args = init.args.as_ref().unwrap();
        assert_eq!(args[0], "check");
        assert!(args[1].contains("ctrl-0.ctrl-svc.storage.svc.cluster.local:17110"));
    }

    #[test]
    fn test_daemon_set_uses_on_delete_updates() {
        let cluster = defaulted_cluster();
        let ds = daemon_set(&cluster, &owner_ref(&cluster)).unwrap();
        assert_eq!(
            ds.spec
                .unwrap()
                .update_strategy
                .unwrap()
                .type_
                .as_deref(),
            Some("OnDelete")
        );
    }

    #[test]
    fn test_memory_budget_is_templated() {
        let cluster = defaulted_cluster();
        let ds = daemon_set(&cluster, &owner_ref(&cluster)).unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();
        let envs = pod.containers[0].env.as_ref().unwrap();
        let total_mem = envs.iter().find(|e| e.name == "CFS_TOTAL_MEM").unwrap();
        assert_eq!(total_mem.value.as_deref(), Some("2147483648"));
    }
}
