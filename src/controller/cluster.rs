//! Cluster reconciler
//!
//! One pass: fetch the declared object fresh, take the teardown path if a
//! deletion marker is set, apply defaults, validate the invariants the
//! defaulting engine cannot guarantee, then run the dependency-ordered
//! synthesis and fold the outcome into status. A failing step aborts the
//! pass fail-fast; the queue retries the whole pass with backoff.

use async_trait::async_trait;
use chrono::Utc;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use crate::cluster::{datanode, Coordinator, CtrlNode, DataNode, HealthProbe, MetaNode};
use crate::crd::{
    ClusterCondition, ClusterState, ConditionStatus, ConditionType, DefaultTable, StorageCluster,
    StorageClusterSpec,
};
use crate::error::{Error, Result};
use crate::k8s::{owner_reference, EventEmitter};
use crate::provisioner::Provisioner;
use crate::status::{
    aggregate_cluster_status, teardown_cluster_status, write_cluster_status,
};
use crate::synthesis::{run_synthesis, RoleSynthesizer, CLUSTER_SYNTHESIS_ORDER};

use super::runner::Reconcile;
use super::ObjectKey;

pub struct ClusterReconciler {
    client: Client,
    defaults: DefaultTable,
    health: HealthProbe,
    csi_enabled: bool,
}

impl ClusterReconciler {
    pub fn new(client: Client, defaults: DefaultTable, csi_enabled: bool) -> Self {
        Self {
            client,
            defaults,
            health: HealthProbe::new(),
            csi_enabled,
        }
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<StorageCluster>> {
        let api: Api<StorageCluster> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.get(&key.name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Cluster workloads are garbage-collected through their owner
    /// references; the teardown path only records the intent and issues no
    /// create/update calls.
    async fn teardown(&self, cluster: &StorageCluster) -> Result<()> {
        info!(
            cluster = %cluster.name(),
            policy = ?cluster.spec.cleanup_policy,
            "cluster is being deleted, dependents cascade through owner references"
        );
        let status = teardown_cluster_status(cluster);
        match write_cluster_status(&self.client, cluster, status).await {
            Ok(_) => Ok(()),
            // the object can vanish mid-teardown
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn synthesis_steps(
        &self,
        cluster: &StorageCluster,
        events: &EventEmitter,
        owner_ref: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    ) -> Vec<Box<dyn RoleSynthesizer>> {
        let steps: Vec<Box<dyn RoleSynthesizer>> = vec![
            Box::new(Coordinator::new(
                self.client.clone(),
                events.clone(),
                cluster,
                owner_ref.clone(),
            )),
            Box::new(CtrlNode::new(
                self.client.clone(),
                events.clone(),
                cluster,
                owner_ref.clone(),
            )),
            Box::new(MetaNode::new(
                self.client.clone(),
                events.clone(),
                cluster,
                owner_ref.clone(),
            )),
            Box::new(DataNode::new(
                self.client.clone(),
                events.clone(),
                cluster,
                owner_ref.clone(),
            )),
        ];
        debug_assert!(steps.iter().map(|s| s.role()).eq(CLUSTER_SYNTHESIS_ORDER));
        steps
    }

    async fn record_invalid_spec(&self, cluster: &StorageCluster, err: &Error) {
        let mut status = cluster.status.clone().unwrap_or_default();
        status.state = ClusterState::Error;
        status.set_condition(ClusterCondition {
            r#type: ConditionType::Failure,
            status: ConditionStatus::True,
            reason: Some("InvalidSpec".to_string()),
            message: Some(err.to_string()),
            last_transition_time: Some(Utc::now()),
        });
        if let Err(write_err) = write_cluster_status(&self.client, cluster, status).await {
            warn!(cluster = %cluster.name(), error = %write_err, "failed to record invalid spec");
        }
    }
}

/// Invariants the defaulting engine cannot establish on its own
pub fn validate(spec: &StorageClusterSpec) -> Result<()> {
    if spec.ctrl_node.replicas < 1 {
        return Err(Error::Validation(format!(
            "ctrlNode.replicas must be at least 1, got {}",
            spec.ctrl_node.replicas
        )));
    }
    if spec.data_node.disks.is_empty() {
        return Err(Error::Validation(
            "dataNode.disks must name at least one path:reservedBytes entry".to_string(),
        ));
    }
    for entry in &spec.data_node.disks {
        datanode::parse_disk_entry(entry)?;
    }
    Ok(())
}

#[async_trait]
impl Reconcile for ClusterReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(mut cluster) = self.fetch(key).await? else {
            // the object vanished between enqueue and fetch
            info!(key = %key, "cluster no longer exists, nothing to do");
            return Ok(());
        };

        info!(key = %key, "handling cluster");
        if cluster.is_being_deleted() {
            return self.teardown(&cluster).await;
        }

        // the watch cache copy stays untouched: defaults are applied to our
        // own fresh fetch of the spec
        cluster.spec = self.defaults.apply_cluster(cluster.spec);
        if let Err(err) = validate(&cluster.spec) {
            self.record_invalid_spec(&cluster, &err).await;
            return Err(err);
        }

        let owner_ref = owner_reference(&cluster)?;
        let events = EventEmitter::new(self.client.clone(), &cluster);

        let steps = self.synthesis_steps(&cluster, &events, &owner_ref);
        let report = run_synthesis(&steps).await;

        if report.converged() {
            if self.csi_enabled {
                Provisioner::new(
                    self.client.clone(),
                    events.clone(),
                    &cluster,
                    owner_ref.clone(),
                )
                .spawn_deploy();
            } else {
                debug!(key = %key, "CSI provisioner chain disabled");
            }
        }

        // best-effort: a cluster that does not answer yet is simply not
        // Connected
        let health = if report.converged() {
            match self.health.snapshot(&cluster).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    debug!(key = %key, error = %err, "health probe not answering");
                    None
                }
            }
        } else {
            None
        };

        let status = aggregate_cluster_status(&cluster, &report, health);
        write_cluster_status(&self.client, &cluster, status).await?;

        report.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn valid_spec() -> StorageClusterSpec {
        let mut spec = StorageClusterSpec::default();
        spec.data_node.disks = vec!["/data/disk1:21474836480".to_string()];
        DefaultTable::default().apply_cluster(spec)
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(validate(&valid_spec()).is_ok());
    }

    #[test]
    fn test_empty_disks_rejected() {
        let mut spec = valid_spec();
        spec.data_node.disks.clear();
        assert_matches!(validate(&spec), Err(Error::Validation(_)));
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let mut spec = valid_spec();
        spec.ctrl_node.replicas = -3;
        assert_matches!(validate(&spec), Err(Error::Validation(_)));
    }

    #[test]
    fn test_malformed_disk_rejected() {
        let mut spec = valid_spec();
        spec.data_node.disks = vec!["disk-without-reserved".to_string()];
        assert_matches!(validate(&spec), Err(Error::Validation(_)));
    }
}
