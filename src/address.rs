//! Address resolution registry
//!
//! Computes predictable in-cluster network names for role instances before
//! those instances exist. The naming convention is the contract: a role's
//! Service name and pod instance prefix are fixed constants, so any consumer
//! can template `"{instance}-{ordinal}.{service}.{namespace}.svc.cluster.local"`
//! from the declared replica count alone. The addressed role's own synthesis
//! step registers the Service that makes the name resolvable by the time a
//! consumer dials it.
//!
//! Everything here is pure and deterministic; nothing is stored.

use crate::error::{Error, Result};
use crate::synthesis::Role;

/// Kubernetes service DNS domain suffix
pub const SERVICE_DOMAIN_SUFFIX: &str = "svc.cluster.local";

// Well-known instance / service names per role. Pod DNS requires the
// StatefulSet name to match the instance prefix used here.
pub const COORDINATOR_SERVICE_NAME: &str = "coord-svc";
pub const CTRL_INSTANCE_NAME: &str = "ctrl";
pub const CTRL_SERVICE_NAME: &str = "ctrl-svc";
pub const METRICS_SERVICE_NAME: &str = "metrics-svc";
pub const DASHBOARD_SERVICE_NAME: &str = "dashboard-svc";
pub const CONSOLE_SERVICE_NAME: &str = "console-svc";

/// Cluster-internal DNS name of a Service
pub fn service_domain(service: &str, namespace: &str) -> String {
    format!("{}.{}.{}", service, namespace, SERVICE_DOMAIN_SUFFIX)
}

/// Address of a single role instance behind a headless Service
pub fn instance_address(
    instance: &str,
    ordinal: i32,
    service: &str,
    namespace: &str,
    port: i32,
) -> String {
    format!(
        "{}-{}.{}:{}",
        instance,
        ordinal,
        service_domain(service, namespace),
        port
    )
}

/// Addresses of all ctrl-node replicas, in ordinal order.
///
/// A replica count of zero is a misconfiguration, not an empty list: callers
/// template these addresses into dependent workloads and an empty value would
/// produce a cluster that can never bootstrap.
pub fn ctrl_addr_list(namespace: &str, replicas: i32, port: i32) -> Result<Vec<String>> {
    if replicas < 1 {
        return Err(Error::AddressResolution {
            role: Role::CtrlNode,
            reason: format!("replica count {} must be at least 1", replicas),
        });
    }

    Ok((0..replicas)
        .map(|i| instance_address(CTRL_INSTANCE_NAME, i, CTRL_SERVICE_NAME, namespace, port))
        .collect())
}

/// Raft peer list of all ctrl-node replicas: `"{peer-id}:{address}"` with
/// peer ids starting at 1.
pub fn ctrl_peer_list(namespace: &str, replicas: i32, port: i32) -> Result<Vec<String>> {
    let addrs = ctrl_addr_list(namespace, replicas, port)?;
    Ok(addrs
        .into_iter()
        .enumerate()
        .map(|(i, addr)| format!("{}:{}", i + 1, addr))
        .collect())
}

/// Load-balanced URL of the ctrl-node Service (used where any replica will do)
pub fn ctrl_service_addr(namespace: &str, port: i32) -> String {
    format!("{}:{}", service_domain(CTRL_SERVICE_NAME, namespace), port)
}

/// HTTP URL of the coordination service
pub fn coordinator_url(namespace: &str, port: i32) -> String {
    format!(
        "http://{}:{}",
        service_domain(COORDINATOR_SERVICE_NAME, namespace),
        port
    )
}

/// HTTP URL of the metrics collector
pub fn metrics_url(namespace: &str, port: i32) -> String {
    format!(
        "http://{}:{}",
        service_domain(METRICS_SERVICE_NAME, namespace),
        port
    )
}

/// HTTP URL of the dashboard
pub fn dashboard_url(namespace: &str, port: i32) -> String {
    format!(
        "http://{}:{}",
        service_domain(DASHBOARD_SERVICE_NAME, namespace),
        port
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_service_domain() {
        assert_eq!(
            service_domain("coord-svc", "storage"),
            "coord-svc.storage.svc.cluster.local"
        );
    }

    #[test]
    fn test_peer_list_matches_convention() {
        let peers = ctrl_peer_list("rook-chubao", 3, 17110).unwrap();
        assert_eq!(
            peers,
            vec![
                "1:ctrl-0.ctrl-svc.rook-chubao.svc.cluster.local:17110",
                "2:ctrl-1.ctrl-svc.rook-chubao.svc.cluster.local:17110",
                "3:ctrl-2.ctrl-svc.rook-chubao.svc.cluster.local:17110",
            ]
        );
    }

    #[test]
    fn test_peer_list_is_deterministic() {
        let a = ctrl_peer_list("ns", 5, 17110).unwrap();
        let b = ctrl_peer_list("ns", 5, 17110).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn test_zero_replicas_is_an_error() {
        let err = ctrl_addr_list("ns", 0, 17110).unwrap_err();
        assert_matches!(
            err,
            Error::AddressResolution {
                role: Role::CtrlNode,
                ..
            }
        );
    }

    #[test]
    fn test_addr_list_length_equals_replicas() {
        let addrs = ctrl_addr_list("ns", 4, 17110).unwrap();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[0], "ctrl-0.ctrl-svc.ns.svc.cluster.local:17110");
    }

    #[test]
    fn test_coordinator_url() {
        assert_eq!(
            coordinator_url("storage", 8500),
            "http://coord-svc.storage.svc.cluster.local:8500"
        );
    }
}
