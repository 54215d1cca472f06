//! Kubernetes object plumbing shared by every synthesizer
//!
//! Labels, metadata construction, owner references for cascade deletion,
//! idempotent create-or-update appliers, and the event emitter that records
//! per-step success/failure onto the owning custom resource.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::synthesis::Role;

// =============================================================================
// Labels
// =============================================================================

pub const APP_NAME: &str = "cubefs";
pub const OPERATOR_NAME: &str = "cubefs-operator";

pub const COMPONENT_LABEL: &str = "storage.billyronks.io/component";
pub const MANAGED_BY_LABEL: &str = "storage.billyronks.io/managed-by";
pub const OWNER_NAME_LABEL: &str = "storage.billyronks.io/owner";

fn recommended_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_NAME.to_string()),
        ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            OPERATOR_NAME.to_string(),
        ),
    ])
}

/// Labels stamped on every object synthesized for `role`, owned by the
/// custom resource `owner_name`
pub fn common_labels(role: Role, owner_kind: &str, owner_name: &str) -> BTreeMap<String, String> {
    let mut labels = recommended_labels();
    labels.insert(COMPONENT_LABEL.to_string(), role.component().to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), owner_kind.to_string());
    labels.insert(OWNER_NAME_LABEL.to_string(), owner_name.to_string());
    labels
}

// =============================================================================
// Metadata & Owner References
// =============================================================================

/// Object metadata carrying the owner reference that lets the platform
/// cascade-delete everything we synthesize
pub fn object_meta(
    name: &str,
    namespace: &str,
    owner_ref: &OwnerReference,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        owner_references: Some(vec![owner_ref.clone()]),
        ..Default::default()
    }
}

/// Build the controller owner reference for a custom resource.
///
/// Fails only when the object has not been persisted yet (no uid), which a
/// watch-delivered object always has.
pub fn owner_reference<K>(obj: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let uid = obj.meta().uid.clone().ok_or_else(|| Error::MissingUid {
        kind: K::kind(&()).into_owned(),
        name: obj.name_any(),
    })?;

    Ok(OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: obj.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

// =============================================================================
// Idempotent Appliers
// =============================================================================

/// Create `desired`, or merge-patch the given mutable subset when it already
/// exists. Structural fields the platform refuses to mutate in place are
/// simply not part of the patch.
async fn create_or_merge<K>(
    api: &Api<K>,
    name: &str,
    desired: &K,
    mutable: serde_json::Value,
    role: Role,
    resource: &str,
) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => {
            debug!(role = %role, resource, name, "created");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(role = %role, resource, name, "exists, patching mutable fields");
            api.patch(name, &PatchParams::default(), &Patch::Merge(&mutable))
                .await
                .map(|_| ())
                .map_err(|source| Error::ApplyFailed {
                    role,
                    resource: resource.to_string(),
                    source,
                })
        }
        Err(source) => Err(Error::ApplyFailed {
            role,
            resource: resource.to_string(),
            source,
        }),
    }
}

fn object_name<K: Resource>(obj: &K, resource: &str) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::Internal(format!("{} template has no name", resource)))
}

/// Apply a Service: ports and selector are mutable, clusterIP stays as
/// allocated
pub async fn apply_service(client: &Client, namespace: &str, role: Role, svc: Service) -> Result<()> {
    let name = object_name(&svc, "Service")?;
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let mutable = json!({
        "spec": {
            "ports": svc.spec.as_ref().and_then(|s| s.ports.clone()),
            "selector": svc.spec.as_ref().and_then(|s| s.selector.clone()),
        }
    });
    create_or_merge(&api, &name, &svc, mutable, role, "Service").await
}

/// Apply a Deployment: replicas and the pod template are mutable
pub async fn apply_deployment(
    client: &Client,
    namespace: &str,
    role: Role,
    dep: Deployment,
) -> Result<()> {
    let name = object_name(&dep, "Deployment")?;
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let mutable = json!({
        "spec": {
            "replicas": dep.spec.as_ref().and_then(|s| s.replicas),
            "template": dep.spec.as_ref().map(|s| s.template.clone()),
        }
    });
    create_or_merge(&api, &name, &dep, mutable, role, "Deployment").await
}

/// Apply a StatefulSet: replicas and the pod template are mutable;
/// serviceName, selector, and volume claim templates are structural and left
/// untouched on update
pub async fn apply_stateful_set(
    client: &Client,
    namespace: &str,
    role: Role,
    sts: StatefulSet,
) -> Result<()> {
    let name = object_name(&sts, "StatefulSet")?;
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let mutable = json!({
        "spec": {
            "replicas": sts.spec.as_ref().and_then(|s| s.replicas),
            "template": sts.spec.as_ref().map(|s| s.template.clone()),
        }
    });
    create_or_merge(&api, &name, &sts, mutable, role, "StatefulSet").await
}

/// Apply a DaemonSet: the pod template is mutable
pub async fn apply_daemon_set(
    client: &Client,
    namespace: &str,
    role: Role,
    ds: DaemonSet,
) -> Result<()> {
    let name = object_name(&ds, "DaemonSet")?;
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let mutable = json!({
        "spec": {
            "template": ds.spec.as_ref().map(|s| s.template.clone()),
        }
    });
    create_or_merge(&api, &name, &ds, mutable, role, "DaemonSet").await
}

/// Apply a ConfigMap: data is mutable
pub async fn apply_config_map(
    client: &Client,
    namespace: &str,
    role: Role,
    cm: ConfigMap,
) -> Result<()> {
    let name = object_name(&cm, "ConfigMap")?;
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let mutable = json!({ "data": cm.data.clone() });
    create_or_merge(&api, &name, &cm, mutable, role, "ConfigMap").await
}

/// Apply a StorageClass. Provisioner and parameters are immutable, so an
/// existing class is left as-is.
pub async fn apply_storage_class(client: &Client, role: Role, sc: StorageClass) -> Result<()> {
    let name = object_name(&sc, "StorageClass")?;
    let api: Api<StorageClass> = Api::all(client.clone());
    match api.create(&PostParams::default(), &sc).await {
        Ok(_) => {
            debug!(role = %role, name, "created StorageClass");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(role = %role, name, "StorageClass exists, leaving untouched");
            Ok(())
        }
        Err(source) => Err(Error::ApplyFailed {
            role,
            resource: "StorageClass".to_string(),
            source,
        }),
    }
}

// =============================================================================
// Event Emission
// =============================================================================

pub const REASON_CREATED: &str = "Created";
pub const REASON_CREATE_FAILED: &str = "ErrCreateFailed";

/// Records per-step synthesis events onto the owning custom resource.
/// Emission is best-effort: a failure to record never fails a pass.
#[derive(Clone)]
pub struct EventEmitter {
    recorder: Recorder,
}

impl EventEmitter {
    pub fn new<K>(client: Client, obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let reporter = Reporter {
            controller: OPERATOR_NAME.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter, obj.object_ref(&())),
        }
    }

    /// Record a successful create/update of `resource` for `role`
    pub async fn created(&self, role: Role, resource: &str, key: &str) {
        self.publish(
            EventType::Normal,
            REASON_CREATED,
            format!("{}[{}] {} created", role, key, resource),
        )
        .await;
    }

    /// Record a failed create/update of `resource` for `role`
    pub async fn create_failed(&self, role: Role, resource: &str, key: &str) {
        self.publish(
            EventType::Warning,
            REASON_CREATE_FAILED,
            format!("Failed to create {}[{}] {}", role, key, resource),
        )
        .await;
    }

    async fn publish(&self, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Synthesize".to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(event).await {
            warn!(error = %err, "failed to record event");
        }
    }
}

// Re-exported so synthesizers can spell pod specs without each importing the
// whole k8s-openapi path forest.
pub use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HostPathVolumeSource, ObjectFieldSelector,
    PodSpec, PodTemplateSpec, Probe, SecurityContext, ServicePort, ServiceSpec, TCPSocketAction,
    Volume, VolumeMount,
};
pub use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StorageCluster;

    fn cluster_with_uid(uid: Option<&str>) -> StorageCluster {
        let mut cluster = StorageCluster::new("mycluster", Default::default());
        cluster.metadata.namespace = Some("storage".into());
        cluster.metadata.uid = uid.map(String::from);
        cluster
    }

    #[test]
    fn test_owner_reference_carries_identity() {
        let cluster = cluster_with_uid(Some("abc-123"));
        let owner_ref = owner_reference(&cluster).unwrap();

        assert_eq!(owner_ref.kind, "StorageCluster");
        assert_eq!(owner_ref.api_version, "storage.billyronks.io/v1alpha1");
        assert_eq!(owner_ref.name, "mycluster");
        assert_eq!(owner_ref.uid, "abc-123");
        assert_eq!(owner_ref.controller, Some(true));
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let cluster = cluster_with_uid(None);
        assert!(owner_reference(&cluster).is_err());
    }

    #[test]
    fn test_common_labels() {
        let labels = common_labels(Role::CtrlNode, "StorageCluster", "mycluster");
        assert_eq!(labels.get("app").unwrap(), "cubefs");
        assert_eq!(labels.get(COMPONENT_LABEL).unwrap(), "ctrlnode");
        assert_eq!(labels.get(OWNER_NAME_LABEL).unwrap(), "mycluster");
    }

    #[test]
    fn test_object_meta_threads_owner_reference() {
        let cluster = cluster_with_uid(Some("abc-123"));
        let owner_ref = owner_reference(&cluster).unwrap();
        let labels = common_labels(Role::Coordinator, "StorageCluster", "mycluster");
        let meta = object_meta("coord", "storage", &owner_ref, &labels);

        assert_eq!(meta.name.as_deref(), Some("coord"));
        assert_eq!(meta.namespace.as_deref(), Some("storage"));
        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "abc-123");
    }
}
