//! Ctrl-node health probe
//!
//! Queries the engine's admin endpoint on the first ctrl-node replica and
//! reduces the answer to the per-zone writable-node snapshot embedded in
//! cluster status. Probing is best-effort: a cluster that does not answer
//! yet is simply not Connected.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::crd::{HealthSnapshot, StorageCluster, ZoneHealth};
use crate::error::{Error, Result};

use super::ctrlnode;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// Engine admin API response shapes
#[derive(Debug, Deserialize)]
struct ResponseData<T> {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    #[allow(dead_code)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterStat {
    #[serde(rename = "ZoneStatInfo", default)]
    zone_stat_info: BTreeMap<String, ZoneStat>,
}

#[derive(Debug, Default, Deserialize)]
struct ZoneStat {
    #[serde(rename = "dataNodeStat", default)]
    data_node_stat: NodeStat,
    #[serde(rename = "metaNodeStat", default)]
    meta_node_stat: NodeStat,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStat {
    #[serde(rename = "WritableNodes", default)]
    writable_nodes: i32,
    #[serde(rename = "TotalNodes", default)]
    total_nodes: i32,
}

/// HTTP probe against the ctrl-node admin API
pub struct HealthProbe {
    http: reqwest::Client,
}

impl HealthProbe {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Fetch the cluster stat snapshot from the first ctrl-node replica
    pub async fn snapshot(&self, cluster: &StorageCluster) -> Result<HealthSnapshot> {
        let addr = first_ctrl_addr(cluster)?;
        let url = format!("http://{}/cluster/stat", addr);

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HealthProbeStatus(status.as_u16()));
        }

        let body: ResponseData<ClusterStat> = response.json().await?;
        if body.code != 0 {
            return Err(Error::HealthProbeStatus(500));
        }

        Ok(to_snapshot(body.data.unwrap_or_default()))
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn first_ctrl_addr(cluster: &StorageCluster) -> Result<String> {
    let ctrl = &cluster.spec.ctrl_node;
    let addrs = crate::address::ctrl_addr_list(cluster.namespace(), ctrl.replicas, ctrl.port)?;
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| Error::Internal("ctrl address list was empty".into()))
}

fn to_snapshot(stat: ClusterStat) -> HealthSnapshot {
    let zones = stat
        .zone_stat_info
        .into_iter()
        .map(|(zone, stat)| {
            (
                zone,
                ZoneHealth {
                    data_writable_nodes: stat.data_node_stat.writable_nodes,
                    data_total_nodes: stat.data_node_stat.total_nodes,
                    meta_writable_nodes: stat.meta_node_stat.writable_nodes,
                    meta_total_nodes: stat.meta_node_stat.total_nodes,
                },
            )
        })
        .collect();
    HealthSnapshot { zones }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::defaulted_cluster;

    #[test]
    fn test_first_ctrl_addr() {
        let cluster = defaulted_cluster();
        assert_eq!(
            first_ctrl_addr(&cluster).unwrap(),
            "ctrl-0.ctrl-svc.storage.svc.cluster.local:17110"
        );
    }

    #[test]
    fn test_parse_admin_response() {
        let raw = r#"{
            "code": 0,
            "msg": "success",
            "data": {
                "ZoneStatInfo": {
                    "default": {
                        "dataNodeStat": {"WritableNodes": 5, "TotalNodes": 6},
                        "metaNodeStat": {"WritableNodes": 3, "TotalNodes": 3}
                    }
                }
            }
        }"#;

        let body: ResponseData<ClusterStat> = serde_json::from_str(raw).unwrap();
        let snapshot = to_snapshot(body.data.unwrap());

        let zone = snapshot.zones.get("default").unwrap();
        assert_eq!(zone.data_writable_nodes, 5);
        assert_eq!(zone.data_total_nodes, 6);
        assert_eq!(zone.meta_writable_nodes, 3);
        assert!(snapshot.is_writable());
    }

    #[test]
    fn test_parse_tolerates_missing_zones() {
        let raw = r#"{"code": 0, "msg": "success", "data": {}}"#;
        let body: ResponseData<ClusterStat> = serde_json::from_str(raw).unwrap();
        let snapshot = to_snapshot(body.data.unwrap());
        assert!(snapshot.zones.is_empty());
        assert!(!snapshot.is_writable());
    }
}
