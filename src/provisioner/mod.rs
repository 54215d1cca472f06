//! CSI client provisioner
//!
//! Optional side channel of the cluster pass: a StorageClass wired to the
//! driver, the CSI controller Deployment (external provisioner + attacher +
//! engine driver), and the per-node driver DaemonSet (registrar + engine
//! driver). Deployed asynchronously relative to the primary pass; its
//! failures are logged, never propagated.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy, Deployment, DeploymentSpec,
};
use k8s_openapi::api::core::v1::HostPathVolumeSource;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::address;
use crate::cluster::ctrlnode;
use crate::crd::StorageCluster;
use crate::error::Result;
use crate::k8s::{
    apply_daemon_set, apply_deployment, apply_storage_class, common_labels, object_meta,
    Container, EnvVar, EnvVarSource, EventEmitter, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    SecurityContext, Volume, VolumeMount,
};
use crate::synthesis::{Role, RoleSynthesizer};

const CSI_CONTROLLER_NAME: &str = "csi-controller";
const CSI_NODE_NAME: &str = "csi-node";
const STORAGE_CLASS_NAME: &str = "cubefs-sc";

/// Environment flag gating the whole provisioner chain; absence means
/// enabled
pub const CSI_ENABLED_ENV: &str = "CSI_PROVISIONER_ENABLED";

/// Read the provisioner feature flag from the process environment
pub fn csi_enabled_from_env() -> bool {
    match std::env::var(CSI_ENABLED_ENV) {
        Ok(value) => value.is_empty() || value == "true",
        Err(_) => true,
    }
}

pub struct Provisioner {
    client: Client,
    events: EventEmitter,
    cluster: StorageCluster,
    owner_ref: OwnerReference,
}

impl Provisioner {
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

    /// Deploy the chain on a detached task. The primary pass never waits on
    /// it and never sees its errors.
    pub fn spawn_deploy(self) {
        tokio::spawn(async move {
            info!(cluster = %self.cluster.name(), "deploying CSI provisioner chain");
            if let Err(err) = self.deploy().await {
                error!(cluster = %self.cluster.name(), error = %err, "CSI provisioner deploy failed");
            }
        });
    }
}

#[async_trait]
impl RoleSynthesizer for Provisioner {
    fn role(&self) -> Role {
        Role::Provisioner
    }

    async fn deploy(&self) -> Result<()> {
        let namespace = self.cluster.namespace().to_string();
        let key = format!("{}/{}", namespace, STORAGE_CLASS_NAME);

        let sc = storage_class(&self.cluster);
        if let Err(err) = apply_storage_class(&self.client, Role::Provisioner, sc).await {
            self.events
                .create_failed(Role::Provisioner, "StorageClass", &key)
                .await;
            return Err(err);
        }

        let controller = controller_deployment(&self.cluster, &self.owner_ref);
        let controller_key = format!("{}/{}", namespace, CSI_CONTROLLER_NAME);
        if let Err(err) =
            apply_deployment(&self.client, &namespace, Role::Provisioner, controller).await
        {
            self.events
                .create_failed(Role::Provisioner, "Deployment", &controller_key)
                .await;
            return Err(err);
        }
        self.events
            .created(Role::Provisioner, "Deployment", &controller_key)
            .await;

        let node = node_daemon_set(&self.cluster, &self.owner_ref);
        let node_key = format!("{}/{}", namespace, CSI_NODE_NAME);
        if let Err(err) = apply_daemon_set(&self.client, &namespace, Role::Provisioner, node).await
        {
            self.events
                .create_failed(Role::Provisioner, "DaemonSet", &node_key)
                .await;
            return Err(err);
        }
        self.events
            .created(Role::Provisioner, "DaemonSet", &node_key)
            .await;

        Ok(())
    }
}

// =============================================================================
// Templates
// =============================================================================

fn labels(cluster: &StorageCluster, component: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels(Role::Provisioner, "StorageCluster", cluster.name());
    labels.insert(
        "storage.billyronks.io/csi".to_string(),
        component.to_string(),
    );
    labels
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn node_name_env() -> EnvVar {
    EnvVar {
        name: "KUBE_NODE_NAME".to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "spec.nodeName".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

fn host_path(name: &str, path: String, type_: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path,
            type_: Some(type_.to_string()),
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: impl Into<String>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.into(),
        ..Default::default()
    }
}

/// Per-driver plugin directory under the kubelet path
fn plugin_dir(cluster: &StorageCluster) -> String {
    let csi = &cluster.spec.provisioner;
    format!("{}/plugins/{}", csi.kubelet_path, csi.driver_name)
}

pub(crate) fn storage_class(cluster: &StorageCluster) -> StorageClass {
    let csi = &cluster.spec.provisioner;
    StorageClass {
        metadata: ObjectMeta {
            name: Some(STORAGE_CLASS_NAME.to_string()),
            labels: Some(labels(cluster, "storage-class")),
            ..Default::default()
        },
        provisioner: csi.driver_name.clone(),
        reclaim_policy: Some("Delete".to_string()),
        parameters: Some(BTreeMap::from([
            ("ctrlAddr".to_string(), ctrlnode::service_addr(cluster)),
            (
                "coordinatorAddr".to_string(),
                address::coordinator_url(cluster.namespace(), cluster.spec.coordinator.port),
            ),
        ])),
        ..Default::default()
    }
}

fn driver_container(cluster: &StorageCluster, socket: &str) -> Container {
    let spec = &cluster.spec;
    let csi = &spec.provisioner;
    Container {
        name: "driver".to_string(),
        image: Some(csi.driver_image.clone()),
        image_pull_policy: Some(spec.image_pull_policy.clone()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(vec![
            env("CSI_ENDPOINT", format!("unix://{}", socket)),
            env("DRIVER_NAME", csi.driver_name.clone()),
            env("LOG_LEVEL", "5"),
            node_name_env(),
        ]),
        volume_mounts: Some(vec![
            mount("socket-dir", "/csi"),
            VolumeMount {
                name: "mountpoint-dir".to_string(),
                mount_path: format!("{}/pods", csi.kubelet_path),
                mount_propagation: Some("Bidirectional".to_string()),
                ..Default::default()
            },
        ]),
        resources: csi.resources.clone(),
        ..Default::default()
    }
}

pub(crate) fn controller_deployment(
    cluster: &StorageCluster,
    owner_ref: &OwnerReference,
) -> Deployment {
    let spec = &cluster.spec;
    let csi = &spec.provisioner;
    let labels = labels(cluster, "controller");

    let pod = PodSpec {
        priority_class_name: spec.priority_class_name.clone(),
        image_pull_secrets: if spec.image_pull_secrets.is_empty() {
            None
        } else {
            Some(spec.image_pull_secrets.clone())
        },
        containers: vec![
            Container {
                name: "provisioner".to_string(),
                image: Some(csi.provisioner_image.clone()),
                image_pull_policy: Some(spec.image_pull_policy.clone()),
                args: Some(vec![
                    format!("--provisioner={}", csi.driver_name),
                    "--csi-address=$(ADDRESS)".to_string(),
                ]),
                env: Some(vec![env("ADDRESS", "/csi/csi-controller.sock")]),
                volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
                ..Default::default()
            },
            Container {
                name: "attacher".to_string(),
                image: Some(csi.attacher_image.clone()),
                image_pull_policy: Some(spec.image_pull_policy.clone()),
                args: Some(vec!["--csi-address=$(ADDRESS)".to_string()]),
                env: Some(vec![env("ADDRESS", "/csi/csi-controller.sock")]),
                volume_mounts: Some(vec![mount("socket-dir", "/csi")]),
                ..Default::default()
            },
            driver_container(cluster, "/csi/csi-controller.sock"),
        ],
        volumes: Some(vec![
            host_path("socket-dir", plugin_dir(cluster), "DirectoryOrCreate"),
            host_path(
                "mountpoint-dir",
                format!("{}/pods", csi.kubelet_path),
                "Directory",
            ),
        ]),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(CSI_CONTROLLER_NAME, cluster.namespace(), owner_ref, &labels),
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

pub(crate) fn node_daemon_set(cluster: &StorageCluster, owner_ref: &OwnerReference) -> DaemonSet {
    let spec = &cluster.spec;
    let csi = &spec.provisioner;
    let labels = labels(cluster, "node");

    let pod = PodSpec {
        containers: vec![
            Container {
                name: "driver-registrar".to_string(),
                image: Some(csi.registrar_image.clone()),
                image_pull_policy: Some(spec.image_pull_policy.clone()),
                args: Some(vec![
                    "--kubelet-registration-path=$(DRIVER_REG_SOCK_PATH)".to_string(),
                    "--csi-address=$(ADDRESS)".to_string(),
                ]),
                env: Some(vec![
                    env("ADDRESS", "/csi/csi.sock"),
                    env(
                        "DRIVER_REG_SOCK_PATH",
                        format!("{}/csi.sock", plugin_dir(cluster)),
                    ),
                    node_name_env(),
                ]),
                volume_mounts: Some(vec![
                    mount("socket-dir", "/csi"),
                    mount("registration-dir", "/registration"),
                ]),
                ..Default::default()
            },
            driver_container(cluster, "/csi/csi.sock"),
        ],
        volumes: Some(vec![
            host_path("socket-dir", plugin_dir(cluster), "DirectoryOrCreate"),
            host_path(
                "mountpoint-dir",
                format!("{}/pods", csi.kubelet_path),
                "Directory",
            ),
            host_path(
                "registration-dir",
                format!("{}/plugins_registry", csi.kubelet_path),
                "DirectoryOrCreate",
            ),
        ]),
        ..Default::default()
    };

    DaemonSet {
        metadata: object_meta(CSI_NODE_NAME, cluster.namespace(), owner_ref, &labels),
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::{defaulted_cluster, owner_ref};

    #[test]
    fn test_storage_class_carries_resolved_addresses() {
        let cluster = defaulted_cluster();
        let sc = storage_class(&cluster);

        assert_eq!(sc.provisioner, "csi.cubefs.com");
        let params = sc.parameters.unwrap();
        assert_eq!(
            params.get("ctrlAddr").unwrap(),
            "ctrl-svc.storage.svc.cluster.local:17110"
        );
        assert_eq!(
            params.get("coordinatorAddr").unwrap(),
            "http://coord-svc.storage.svc.cluster.local:8500"
        );
    }

    #[test]
    fn test_controller_runs_sidecars_and_driver() {
        let cluster = defaulted_cluster();
        let dep = controller_deployment(&cluster, &owner_ref(&cluster));
        let pod = dep.spec.unwrap().template.spec.unwrap();

        let names: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["provisioner", "attacher", "driver"]);
    }

    #[test]
    fn test_node_registrar_points_at_plugin_socket() {
        let cluster = defaulted_cluster();
        let ds = node_daemon_set(&cluster, &owner_ref(&cluster));
        let pod = ds.spec.unwrap().template.spec.unwrap();

        let registrar = &pod.containers[0];
        let sock = registrar
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|e| e.name == "DRIVER_REG_SOCK_PATH")
            .unwrap();
        assert_eq!(
            sock.value.as_deref(),
            Some("/var/lib/kubelet/plugins/csi.cubefs.com/csi.sock")
        );
    }
}
