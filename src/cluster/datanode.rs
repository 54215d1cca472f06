//! Data-node synthesizer
//!
//! Runs the data fleet as a DaemonSet. Every declared disk entry
//! (`path:reservedBytes`) becomes a host-path volume mounted at the same
//! path inside the container, and the full list is handed to the engine
//! through its environment.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;

use crate::address;
use crate::crd::StorageCluster;
use crate::error::{Error, Result};
use crate::k8s::{
    apply_daemon_set, common_labels, object_meta, Container, ContainerPort, EventEmitter,
    IntOrString, PodSpec, PodTemplateSpec, Probe, SecurityContext, TCPSocketAction,
};
use crate::synthesis::{Role, RoleSynthesizer};

use super::{
    ctrlnode, env, host_path_volume, node_selector, volume_mount, CONTAINER_DATA_PATH,
    CONTAINER_LOG_PATH, START_SCRIPT, VOLUME_DATA, VOLUME_LOG,
};

const INSTANCE_NAME: &str = "data";

// =============================================================================
// Disk Entries
// =============================================================================

/// One parsed `path:reservedBytes` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub path: String,
    pub reserved_bytes: u64,
}

/// Parse a declared disk entry. The reserved size keeps the engine from
/// filling the disk completely.
pub fn parse_disk_entry(entry: &str) -> Result<DiskEntry> {
    let (path, reserved) = entry.split_once(':').ok_or_else(|| {
        Error::Validation(format!(
            "disk entry {:?} must be path:reservedBytes",
            entry
        ))
    })?;

    if !path.starts_with('/') {
        return Err(Error::Validation(format!(
            "disk path {:?} must be absolute",
            path
        )));
    }

    let reserved_bytes = reserved.parse::<u64>().map_err(|_| {
        Error::Validation(format!(
            "disk entry {:?} has a non-numeric reserved size",
            entry
        ))
    })?;

    Ok(DiskEntry {
        path: path.to_string(),
        reserved_bytes,
    })
}

/// Volume name derived from a disk path (`/data/disk1` -> `data-disk1`)
fn path_to_volume_name(path: &str) -> String {
    path.trim_matches('/').replace(['/', '_', '.'], "-")
}

pub struct DataNode {
    client: Client,
    events: EventEmitter,
    cluster: StorageCluster,
    owner_ref: OwnerReference,
}

impl DataNode {
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
impl RoleSynthesizer for DataNode {
    fn role(&self) -> Role {
        Role::DataNode
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.cluster.namespace().to_string();
        let ds = daemon_set(&self.cluster, &self.owner_ref)?;
        let key = format!("{}/{}", namespace, INSTANCE_NAME);

        if let Err(err) = apply_daemon_set(&self.client, &namespace, Role::DataNode, ds).await {
            self.events
                .create_failed(Role::DataNode, "DaemonSet", &key)
                .await;
            return Err(err);
        }
        self.events.created(Role::DataNode, "DaemonSet", &key).await;
        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

fn labels(cluster: &StorageCluster) -> BTreeMap<String, String> {
    common_labels(Role::DataNode, "StorageCluster", cluster.name())
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
    let data = &spec.data_node;
    let ctrl_addrs = ctrlnode::addr_list(cluster)?;

    let disks: Vec<DiskEntry> = data
        .disks
        .iter()
        .map(|entry| parse_disk_entry(entry))
        .collect::<Result<_>>()?;

    let mut volumes = vec![
        host_path_volume(VOLUME_DATA, &spec.data_dir_host_path),
        host_path_volume(VOLUME_LOG, &spec.log_dir_host_path),
    ];
    let mut mounts = vec![
        volume_mount(VOLUME_LOG, CONTAINER_LOG_PATH),
        volume_mount(VOLUME_DATA, CONTAINER_DATA_PATH),
    ];
    for disk in &disks {
        let volume_name = path_to_volume_name(&disk.path);
        volumes.push(host_path_volume(&volume_name, &disk.path));
        mounts.push(volume_mount(&volume_name, &disk.path));
    }

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
            name: "datanode".to_string(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some(spec.image_pull_policy.clone()),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            command: Some(vec!["/bin/bash".to_string()]),
            args: Some(vec![
                "-c".to_string(),
                format!("{} datanode; sleep 999999999d", START_SCRIPT),
            ]),
            env: Some(vec![
                env("CFS_PORT", data.port.to_string()),
                env("CFS_PROF_PORT", data.prof_port.to_string()),
                env("CFS_RAFT_HEARTBEAT_PORT", data.raft_heartbeat_port.to_string()),
                env("CFS_RAFT_REPLICA_PORT", data.raft_replica_port.to_string()),
                env("CFS_EXPORTER_PORT", data.exporter_port.to_string()),
                env("CFS_CTRL_ADDRS", ctrl_addrs),
                env("CFS_LOG_LEVEL", data.log_level.clone()),
                env(
                    "CFS_COORDINATOR_ADDR",
                    address::coordinator_url(cluster.namespace(), spec.coordinator.port),
                ),
                env("CFS_DISKS", data.disks.join(",")),
                env("CFS_ZONE", data.zone.clone()),
            ]),
            ports: Some(vec![
                ContainerPort {
                    name: Some("port".to_string()),
                    container_port: data.port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("prof".to_string()),
                    container_port: data.prof_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("heartbeat-port".to_string()),
                    container_port: data.raft_heartbeat_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("replica-port".to_string()),
                    container_port: data.raft_replica_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ContainerPort {
                    name: Some("exporter-port".to_string()),
                    container_port: data.exporter_port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(mounts),
            resources: data.resources.clone(),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(data.port),
                    ..Default::default()
                }),
                timeout_seconds: Some(10),
                period_seconds: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        }],
        volumes: Some(volumes),
        node_selector: Some(node_selector(
            Role::DataNode,
            cluster.namespace(),
            &data.node_selector,
        )),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{defaulted_cluster, owner_ref};
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_disk_entry() {
        let disk = parse_disk_entry("/data/disk1:21474836480").unwrap();
        assert_eq!(disk.path, "/data/disk1");
        assert_eq!(disk.reserved_bytes, 21_474_836_480);
    }

    #[test]
    fn test_parse_disk_entry_rejects_malformed() {
        assert_matches!(parse_disk_entry("/data/disk1"), Err(Error::Validation(_)));
        assert_matches!(
            parse_disk_entry("relative:1024"),
            Err(Error::Validation(_))
        );
        assert_matches!(
            parse_disk_entry("/data/disk1:lots"),
            Err(Error::Validation(_))
        );
    }

    #[test]
    fn test_each_disk_gets_a_volume_and_mount() {
        let mut cluster = defaulted_cluster();
        cluster.spec.data_node.disks = vec![
            "/data/disk1:21474836480".to_string(),
            "/data/disk2:21474836480".to_string(),
        ];

        let ds = daemon_set(&cluster, &owner_ref(&cluster)).unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();

        let volumes = pod.volumes.as_ref().unwrap();
        assert!(volumes.iter().any(|v| v.name == "data-disk1"));
        assert!(volumes.iter().any(|v| v.name == "data-disk2"));

        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts
            .iter()
            .any(|m| m.name == "data-disk1" && m.mount_path == "/data/disk1"));
    }

    #[test]
    fn test_disks_env_carries_declared_entries() {
        let cluster = defaulted_cluster();
        let ds = daemon_set(&cluster, &owner_ref(&cluster)).unwrap();
        let pod = ds.spec.unwrap().template.spec.unwrap();

        let envs = pod.containers[0].env.as_ref().unwrap();
        let disks = envs.iter().find(|e| e.name == "CFS_DISKS").unwrap();
        assert_eq!(disks.value.as_deref(), Some("/data/disk1:21474836480"));
    }

    #[test]
    fn test_malformed_disk_fails_synthesis() {
        let mut cluster = defaulted_cluster();
        cluster.spec.data_node.disks = vec!["not-a-disk".to_string()];
        assert!(daemon_set(&cluster, &owner_ref(&cluster)).is_err());
    }
}
