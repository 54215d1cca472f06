//! CubeFS Operator - Declarative Storage Cluster Control Plane
//!
//! A Kubernetes operator that converges declared CubeFS storage clusters
//! into running workloads and keeps them converged.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Reconciliation Engine                        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌─────────────────────────┐  │
//! │  │    Watch     │──▶│  Work Queue  │──▶│      Worker Pool        │  │
//! │  │   Adapters   │   │(single-flight│   │ (one pass per key at a  │  │
//! │  │ (generation  │   │ rate-limited)│   │  time, fail-fast steps) │  │
//! │  │  predicate)  │   └──────────────┘   └────────────┬────────────┘  │
//! │  └──────────────┘                                   │               │
//! ├─────────────────────────────────────────────────────┼───────────────┤
//! │                    Dependency-Ordered Synthesis     ▼               │
//! │   coordinator ──▶ ctrl-nodes ──▶ meta-nodes ──▶ data-nodes          │
//! │                        │                                            │
//! │                        └──▶ CSI provisioner (async side channel)    │
//! │                                                                     │
//! │   metrics ──▶ dashboard ──▶ console     (independent monitor pass)  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   Address Registry (pure) · Defaulting Engine · Status Writer       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: work queue, watch adapters, worker pool, reconcilers
//! - [`synthesis`]: declared synthesis order and pass execution
//! - [`address`]: deterministic address resolution before components exist
//! - [`cluster`], [`provisioner`], [`monitor`]: role synthesizers
//! - [`crd`]: custom resource definitions and the defaulting engine
//! - [`status`]: status aggregation and deep-compare write-back
//! - [`k8s`]: object plumbing, owner references, idempotent appliers
//! - [`error`]: error types and retry classification

pub mod address;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod error;
pub mod k8s;
pub mod monitor;
pub mod provisioner;
pub mod status;
pub mod synthesis;

// Re-export commonly used types
pub use controller::{
    run_worker_pool, watch_resource, ClusterReconciler, MonitorReconciler, ObjectKey,
    RateLimiter, Reconcile, WorkQueue,
};

pub use crd::{
    ClusterState, ComponentState, DefaultTable, HealthSnapshot, StorageCluster,
    StorageClusterSpec, StorageClusterStatus, StorageMonitor, StorageMonitorSpec,
    StorageMonitorStatus,
};

pub use error::{Error, ErrorAction, Result};

pub use synthesis::{
    run_synthesis, PassReport, Role, RoleSynthesizer, StepOutcome, CLUSTER_SYNTHESIS_ORDER,
    MONITOR_SYNTHESIS_ORDER,
};

pub use provisioner::csi_enabled_from_env;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
