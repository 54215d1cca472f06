//! Monitor reconciler
//!
//! Drives the monitoring chain for a StorageMonitor resource: shared
//! ConfigMap first, then metrics collector, dashboard, and console in their
//! declared order. The chain fails independently of cluster reconciliation;
//! a failure here never touches a StorageCluster pass.

use async_trait::async_trait;
use kube::{Api, Client};
use tracing::{info, warn};

use crate::crd::{DefaultTable, StorageMonitor};
use crate::error::Result;
use crate::k8s::{apply_config_map, owner_reference, EventEmitter};
use crate::monitor::{config_map, Console, Dashboard, Metrics};
use crate::status::{aggregate_monitor_status, write_monitor_status};
use crate::synthesis::{run_synthesis, Role, RoleSynthesizer, MONITOR_SYNTHESIS_ORDER};

use super::runner::Reconcile;
use super::ObjectKey;

pub struct MonitorReconciler {
    client: Client,
    defaults: DefaultTable,
}

impl MonitorReconciler {
    pub fn new(client: Client, defaults: DefaultTable) -> Self {
        Self { client, defaults }
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<StorageMonitor>> {
        let api: Api<StorageMonitor> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.get(&key.name).await {
            Ok(monitor) => Ok(Some(monitor)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn synthesis_steps(
        &self,
        monitor: &StorageMonitor,
        events: &EventEmitter,
        owner_ref: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference,
    ) -> Vec<Box<dyn RoleSynthesizer>> {
        let steps: Vec<Box<dyn RoleSynthesizer>> = vec![
            Box::new(Metrics::new(
                self.client.clone(),
                events.clone(),
                monitor,
                owner_ref.clone(),
            )),
            Box::new(Dashboard::new(
                self.client.clone(),
                events.clone(),
                monitor,
                owner_ref.clone(),
            )),
            Box::new(Console::new(
                self.client.clone(),
                events.clone(),
                monitor,
                owner_ref.clone(),
            )),
        ];
        debug_assert!(steps.iter().map(|s| s.role()).eq(MONITOR_SYNTHESIS_ORDER));
        steps
    }
}

#[async_trait]
impl Reconcile for MonitorReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(mut monitor) = self.fetch(key).await? else {
            info!(key = %key, "monitor no longer exists, nothing to do");
            return Ok(());
        };

        info!(key = %key, "handling monitor");
        if monitor.is_being_deleted() {
            info!(key = %key, "monitor is being deleted, dependents cascade through owner references");
            return Ok(());
        }

        monitor.spec = self.defaults.apply_monitor(monitor.spec);

        let owner_ref = owner_reference(&monitor)?;
        let events = EventEmitter::new(self.client.clone(), &monitor);

        // the chain shares one ConfigMap; without it nothing else can start
        let cm = config_map(&monitor, &owner_ref)?;
        let cm_result = apply_config_map(&self.client, monitor.namespace(), Role::Metrics, cm).await;
        let config_map_ok = match cm_result {
            Ok(()) => true,
            Err(err) => {
                warn!(key = %key, error = %err, "monitoring ConfigMap apply failed");
                let status = aggregate_monitor_status(&Default::default(), false);
                write_monitor_status(&self.client, &monitor, status).await?;
                return Err(err);
            }
        };

        let steps = self.synthesis_steps(&monitor, &events, &owner_ref);
        let report = run_synthesis(&steps).await;

        let status = aggregate_monitor_status(&report, config_map_ok);
        write_monitor_status(&self.client, &monitor, status).await?;

        report.into_result()
    }
}
