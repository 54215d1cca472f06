//! Custom Resource Definitions for the CubeFS operator
//!
//! This module contains all CRD types:
//! - StorageCluster: a declared multi-role storage cluster
//! - StorageMonitor: the monitoring stack for a cluster
//!
//! plus the defaulting engine that fills unset spec fields.

pub mod defaults;
pub mod storage_cluster;
pub mod storage_monitor;

pub use defaults::*;
pub use storage_cluster::*;
pub use storage_monitor::*;
