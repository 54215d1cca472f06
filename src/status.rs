//! Status aggregation and write-back
//!
//! After each pass the reconciler builds a candidate status from the pass
//! report and the optional health snapshot, then writes it through the
//! status subresource only when it differs field-wise from the observed
//! status. Reconciling an unchanged spec therefore issues no write and
//! triggers no fresh watch event, which is what keeps the engine from
//! feeding itself.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{
    ClusterCondition, ClusterState, ComponentState, ConditionStatus, ConditionType,
    HealthSnapshot, StorageCluster, StorageClusterStatus, StorageMonitor, StorageMonitorStatus,
};
use crate::error::Result;
use crate::synthesis::{PassReport, Role};

// =============================================================================
// Cluster Status
// =============================================================================

/// Reduce a finished cluster pass to its status.
///
/// The state machine, in order of precedence:
/// - any failed step -> `Error`
/// - health snapshot says writable -> `Connected`
/// - health snapshot present but not writable -> `Connecting`
/// - no snapshot, first pass -> `Creating`; spec changed since the last
///   converged pass -> `Updating`; otherwise -> `Created`
///
/// Previously-applied steps are reflected as-is: a failure does not erase
/// the progress recorded by earlier passes.
pub fn aggregate_cluster_status(
    cluster: &StorageCluster,
    report: &PassReport,
    health: Option<HealthSnapshot>,
) -> StorageClusterStatus {
    let generation = cluster.metadata.generation;
    let previous = cluster.status.as_ref();
    let mut status = previous.cloned().unwrap_or_default();

    if let Some(role) = report.failed_role() {
        status.state = ClusterState::Error;
        status.set_condition(ClusterCondition {
            r#type: ConditionType::Failure,
            status: ConditionStatus::True,
            reason: Some("SynthesisStepFailed".to_string()),
            message: Some(format!("synthesis step for role {} failed", role)),
            last_transition_time: Some(Utc::now()),
        });
        status.set_condition(ClusterCondition {
            r#type: ConditionType::Ready,
            status: ConditionStatus::False,
            reason: Some("SynthesisStepFailed".to_string()),
            message: None,
            last_transition_time: Some(Utc::now()),
        });
        return status;
    }

    status.state = match &health {
        Some(snapshot) if snapshot.is_writable() => ClusterState::Connected,
        Some(_) => ClusterState::Connecting,
        None => match previous {
            None => ClusterState::Creating,
            Some(prev) if prev.observed_generation != generation => ClusterState::Updating,
            Some(_) => ClusterState::Created,
        },
    };
    status.observed_generation = generation;
    status.health = health;

    let connected = status.state == ClusterState::Connected;
    status.set_condition(ClusterCondition {
        r#type: ConditionType::Failure,
        status: ConditionStatus::False,
        reason: None,
        message: None,
        last_transition_time: Some(Utc::now()),
    });
    status.set_condition(ClusterCondition {
        r#type: ConditionType::Ready,
        status: if connected {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        },
        reason: Some(status.state.to_string()),
        message: None,
        last_transition_time: Some(Utc::now()),
    });
    status.set_condition(ClusterCondition {
        r#type: ConditionType::Progressing,
        status: if connected {
            ConditionStatus::False
        } else {
            ConditionStatus::True
        },
        reason: None,
        message: None,
        last_transition_time: Some(Utc::now()),
    });

    status
}

/// Status written when the teardown path runs
pub fn teardown_cluster_status(cluster: &StorageCluster) -> StorageClusterStatus {
    let mut status = cluster.status.clone().unwrap_or_default();
    status.set_condition(ClusterCondition {
        r#type: ConditionType::Deleting,
        status: ConditionStatus::True,
        reason: Some("DeletionRequested".to_string()),
        message: None,
        last_transition_time: Some(Utc::now()),
    });
    status
}

/// Write the cluster status if it differs from the observed one.
/// Returns whether a write was issued.
pub async fn write_cluster_status(
    client: &Client,
    cluster: &StorageCluster,
    status: StorageClusterStatus,
) -> Result<bool> {
    let observed = cluster.status.clone().unwrap_or_default();
    if observed == status {
        debug!(cluster = %cluster.name(), "status unchanged, skipping write");
        return Ok(false);
    }

    let api: Api<StorageCluster> = Api::namespaced(client.clone(), cluster.namespace());
    let patch = json!({ "status": status });
    api.patch_status(cluster.name(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!(cluster = %cluster.name(), state = %status_state(&patch), "status written");
    Ok(true)
}

fn status_state(patch: &serde_json::Value) -> String {
    patch["status"]["state"]
        .as_str()
        .unwrap_or("unknown")
        .to_string()
}

// =============================================================================
// Monitor Status
// =============================================================================

fn component_state(report: &PassReport, role: Role) -> ComponentState {
    if report.skipped.contains(&role) {
        return ComponentState::Unknown;
    }
    match report.outcomes.iter().find(|o| o.role == role) {
        Some(outcome) if outcome.succeeded() => ComponentState::Ready,
        Some(_) => ComponentState::Failure,
        None => ComponentState::Unknown,
    }
}

/// Reduce a finished monitor pass to its per-component status
pub fn aggregate_monitor_status(report: &PassReport, config_map_ok: bool) -> StorageMonitorStatus {
    StorageMonitorStatus {
        config_map: if config_map_ok {
            ComponentState::Ready
        } else {
            ComponentState::Failure
        },
        metrics: component_state(report, Role::Metrics),
        dashboard: component_state(report, Role::Dashboard),
        console: component_state(report, Role::Console),
    }
}

/// Write the monitor status if it differs from the observed one
pub async fn write_monitor_status(
    client: &Client,
    monitor: &StorageMonitor,
    status: StorageMonitorStatus,
) -> Result<bool> {
    let observed = monitor.status.clone().unwrap_or_default();
    if observed == status {
        debug!(monitor = %monitor.name(), "status unchanged, skipping write");
        return Ok(false);
    }

    let api: Api<StorageMonitor> = Api::namespaced(client.clone(), monitor.namespace());
    let patch = json!({ "status": status });
    api.patch_status(monitor.name(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{StorageClusterSpec, ZoneHealth};
    use crate::error::Error;
    use crate::synthesis::StepOutcome;
    use std::collections::BTreeMap;

    fn converged_report() -> PassReport {
        PassReport {
            outcomes: crate::synthesis::CLUSTER_SYNTHESIS_ORDER
                .iter()
                .map(|&role| StepOutcome { role, error: None })
                .collect(),
            skipped: vec![],
        }
    }

    fn failed_report(at: Role) -> PassReport {
        let mut outcomes = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = false;
        for &role in crate::synthesis::CLUSTER_SYNTHESIS_ORDER.iter() {
            if failed {
                skipped.push(role);
            } else if role == at {
                outcomes.push(StepOutcome {
                    role,
                    error: Some(Error::Internal("boom".into())),
                });
                failed = true;
            } else {
                outcomes.push(StepOutcome { role, error: None });
            }
        }
        PassReport { outcomes, skipped }
    }

    fn cluster(generation: i64, status: Option<StorageClusterStatus>) -> StorageCluster {
        let mut cluster = StorageCluster::new("mycluster", StorageClusterSpec::default());
        cluster.metadata.namespace = Some("storage".into());
        cluster.metadata.generation = Some(generation);
        cluster.status = status;
        cluster
    }

    fn writable_snapshot() -> HealthSnapshot {
        HealthSnapshot {
            zones: BTreeMap::from([(
                "default".to_string(),
                ZoneHealth {
                    data_writable_nodes: 3,
                    data_total_nodes: 3,
                    meta_writable_nodes: 3,
                    meta_total_nodes: 3,
                },
            )]),
        }
    }

    #[test]
    fn test_first_converged_pass_is_creating() {
        let status = aggregate_cluster_status(&cluster(1, None), &converged_report(), None);
        assert_eq!(status.state, ClusterState::Creating);
        assert_eq!(status.observed_generation, Some(1));
    }

    #[test]
    fn test_connected_when_snapshot_is_writable() {
        let status = aggregate_cluster_status(
            &cluster(1, None),
            &converged_report(),
            Some(writable_snapshot()),
        );
        assert_eq!(status.state, ClusterState::Connected);
        assert_eq!(
            status.condition(ConditionType::Ready).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn test_connecting_when_snapshot_not_writable() {
        let status = aggregate_cluster_status(
            &cluster(1, None),
            &converged_report(),
            Some(HealthSnapshot::default()),
        );
        assert_eq!(status.state, ClusterState::Connecting);
    }

    #[test]
    fn test_spec_change_reports_updating() {
        let first = aggregate_cluster_status(&cluster(1, None), &converged_report(), None);
        let status =
            aggregate_cluster_status(&cluster(2, Some(first)), &converged_report(), None);
        assert_eq!(status.state, ClusterState::Updating);
    }

    #[test]
    fn test_failed_step_reports_error_with_role() {
        let status = aggregate_cluster_status(
            &cluster(1, None),
            &failed_report(Role::DataNode),
            None,
        );
        assert_eq!(status.state, ClusterState::Error);

        let failure = status.condition(ConditionType::Failure).unwrap();
        assert_eq!(failure.status, ConditionStatus::True);
        assert!(failure.message.as_ref().unwrap().contains("datanode"));
    }

    #[test]
    fn test_unchanged_pass_produces_identical_status() {
        // the no-op-write property: a second pass over an unchanged spec
        // must build a status deep-equal to the previous one
        let base = cluster(1, None);
        let first =
            aggregate_cluster_status(&base, &converged_report(), Some(writable_snapshot()));
        let second = aggregate_cluster_status(
            &cluster(1, Some(first.clone())),
            &converged_report(),
            Some(writable_snapshot()),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_failure_preserves_previous_progress() {
        let base = cluster(1, None);
        let first =
            aggregate_cluster_status(&base, &converged_report(), Some(writable_snapshot()));
        let failed = aggregate_cluster_status(
            &cluster(1, Some(first.clone())),
            &failed_report(Role::MetaNode),
            None,
        );
        // health from the earlier pass is not erased by the failed one
        assert_eq!(failed.health, first.health);
        assert_eq!(failed.state, ClusterState::Error);
    }

    #[test]
    fn test_monitor_status_from_report() {
        let report = PassReport {
            outcomes: vec![
                StepOutcome {
                    role: Role::Metrics,
                    error: None,
                },
                StepOutcome {
                    role: Role::Dashboard,
                    error: Some(Error::Internal("boom".into())),
                },
            ],
            skipped: vec![Role::Console],
        };

        let status = aggregate_monitor_status(&report, true);
        assert_eq!(status.config_map, ComponentState::Ready);
        assert_eq!(status.metrics, ComponentState::Ready);
        assert_eq!(status.dashboard, ComponentState::Failure);
        assert_eq!(status.console, ComponentState::Unknown);
    }

    #[test]
    fn test_teardown_status_marks_deleting() {
        let status = teardown_cluster_status(&cluster(1, None));
        assert_eq!(
            status.condition(ConditionType::Deleting).unwrap().status,
            ConditionStatus::True
        );
    }
}
