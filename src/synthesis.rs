//! Dependency-ordered workload synthesis
//!
//! The synthesis order over cluster roles is fixed and hand-declared: the
//! coordination service must exist before ctrl-nodes register with it, and
//! worker roles resolve ctrl-node addresses at container start, so ctrl-nodes
//! are synthesized ahead of them even though they are not yet serving traffic
//! (workloads retry their own startup dependency checks). The monitoring
//! chain is an independently-ordered sequence driven by its own resource.
//!
//! A pass executes steps strictly in the declared order, fail-fast: the first
//! failing step aborts the remainder of the pass, and nothing already applied
//! is rolled back. Convergence is reached by the next retried pass.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

// =============================================================================
// Roles
// =============================================================================

/// A functional component type within a storage cluster or its monitoring
/// stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Coordinator,
    CtrlNode,
    MetaNode,
    DataNode,
    Provisioner,
    Metrics,
    Dashboard,
    Console,
}

impl Role {
    /// Label value used on objects synthesized for this role
    pub fn component(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::CtrlNode => "ctrlnode",
            Role::MetaNode => "metanode",
            Role::DataNode => "datanode",
            Role::Provisioner => "provisioner",
            Role::Metrics => "metrics",
            Role::Dashboard => "dashboard",
            Role::Console => "console",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.component())
    }
}

/// Synthesis order for the primary cluster pass.
///
/// The provisioner is deliberately absent: it is an optional side channel
/// deployed asynchronously and must never block or fail the primary pass.
pub const CLUSTER_SYNTHESIS_ORDER: [Role; 4] =
    [Role::Coordinator, Role::CtrlNode, Role::MetaNode, Role::DataNode];

/// Synthesis order for the monitoring pass
pub const MONITOR_SYNTHESIS_ORDER: [Role; 3] = [Role::Metrics, Role::Dashboard, Role::Console];

// =============================================================================
// Synthesizer Contract
// =============================================================================

/// The contract every role-specific synthesizer exposes to the engine.
///
/// `deploy` builds the role's workload objects (using the resolved addresses
/// of already-ordered predecessors) and applies them idempotently. The engine
/// never inspects the objects, only the returned error.
#[async_trait]
pub trait RoleSynthesizer: Send + Sync {
    fn role(&self) -> Role;

    async fn deploy(&self) -> Result<()>;
}

// =============================================================================
// Pass Execution
// =============================================================================

/// Outcome of one attempted synthesis step
#[derive(Debug)]
pub struct StepOutcome {
    pub role: Role,
    pub error: Option<Error>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a whole synthesis pass: attempted steps in execution order,
/// plus the roles skipped after the first failure.
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<StepOutcome>,
    pub skipped: Vec<Role>,
}

impl PassReport {
    /// True when every step was attempted and succeeded
    pub fn converged(&self) -> bool {
        self.skipped.is_empty() && self.outcomes.iter().all(StepOutcome::succeeded)
    }

    /// Role of the first failing step, if any
    pub fn failed_role(&self) -> Option<Role> {
        self.outcomes
            .iter()
            .find(|o| !o.succeeded())
            .map(|o| o.role)
    }

    /// Collapse the report into the first failure
    pub fn into_result(self) -> Result<()> {
        for outcome in self.outcomes {
            if let Some(err) = outcome.error {
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Execute `steps` in order, fail-fast.
///
/// Every attempted step is recorded; steps after the first failure are
/// skipped for this pass and listed in the report. Previously-applied steps
/// are never undone.
pub async fn run_synthesis(steps: &[Box<dyn RoleSynthesizer>]) -> PassReport {
    let mut report = PassReport::default();
    let mut aborted = false;

    for step in steps {
        let role = step.role();
        if aborted {
            report.skipped.push(role);
            continue;
        }

        match step.deploy().await {
            Ok(()) => {
                info!(role = %role, "synthesis step applied");
                report.outcomes.push(StepOutcome { role, error: None });
            }
            Err(err) => {
                warn!(role = %role, error = %err, "synthesis step failed, aborting pass");
                report.outcomes.push(StepOutcome {
                    role,
                    error: Some(err),
                });
                aborted = true;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeSynthesizer {
        role: Role,
        fail: bool,
        log: Arc<Mutex<Vec<Role>>>,
    }

    #[async_trait]
    impl RoleSynthesizer for FakeSynthesizer {
        fn role(&self) -> Role {
            self.role
        }

        async fn deploy(&self) -> Result<()> {
            self.log.lock().unwrap().push(self.role);
            if self.fail {
                Err(Error::Internal(format!("{} exploded", self.role)))
            } else {
                Ok(())
            }
        }
    }

    fn steps(
        log: &Arc<Mutex<Vec<Role>>>,
        failing: Option<Role>,
    ) -> Vec<Box<dyn RoleSynthesizer>> {
        CLUSTER_SYNTHESIS_ORDER
            .iter()
            .map(|&role| {
                Box::new(FakeSynthesizer {
                    role,
                    fail: failing == Some(role),
                    log: log.clone(),
                }) as Box<dyn RoleSynthesizer>
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pass_runs_in_declared_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let report = run_synthesis(&steps(&log, None)).await;

        assert!(report.converged());
        assert_eq!(*log.lock().unwrap(), CLUSTER_SYNTHESIS_ORDER.to_vec());
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let report = run_synthesis(&steps(&log, Some(Role::MetaNode))).await;

        assert!(!report.converged());
        assert_eq!(report.failed_role(), Some(Role::MetaNode));
        assert_eq!(report.skipped, vec![Role::DataNode]);
        // coordinator and ctrl-node were attempted before the failure
        assert_eq!(
            *log.lock().unwrap(),
            vec![Role::Coordinator, Role::CtrlNode, Role::MetaNode]
        );
    }

    #[tokio::test]
    async fn test_coordinator_always_precedes_ctrl_node() {
        // order invariant: first failing step never has predecessors skipped
        let log = Arc::new(Mutex::new(Vec::new()));
        let report = run_synthesis(&steps(&log, Some(Role::CtrlNode))).await;

        let attempted: Vec<Role> = report.outcomes.iter().map(|o| o.role).collect();
        assert_eq!(attempted, vec![Role::Coordinator, Role::CtrlNode]);
        assert_eq!(report.skipped, vec![Role::MetaNode, Role::DataNode]);
    }

    #[tokio::test]
    async fn test_into_result_surfaces_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let report = run_synthesis(&steps(&log, Some(Role::Coordinator))).await;

        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("coordinator"));
    }
}
