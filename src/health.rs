//! Store health probe
//!
//! Reports the hosts a cluster is connected to and how many connections are
//! open. A cluster with no open connection is reported as down.

use serde::Serialize;
use std::collections::BTreeMap;

/// Connection state of one store host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostState {
    pub address: String,
    pub state: String,
}

impl HostState {
    pub fn new(address: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: state.into(),
        }
    }
}

/// Runtime view of a cluster connection, supplied by the store driver
pub trait ClusterState {
    fn open_connections(&self) -> usize;

    fn connected_hosts(&self) -> Vec<HostState>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Host name to host state
    pub servers: BTreeMap<String, String>,
    pub open_connections: usize,
}

/// Build a health report from the cluster's current state
///
/// Several hosts may resolve to the same address (for example when the contact
/// point is a DNS A record); the last one reported wins.
pub fn check_health(cluster: &dyn ClusterState) -> HealthReport {
    let open_connections = cluster.open_connections();

    let mut servers = BTreeMap::new();
    for host in cluster.connected_hosts() {
        servers.insert(host.address, host.state);
    }

    let status = if open_connections == 0 {
        HealthStatus::Down
    } else {
        HealthStatus::Up
    };
    log::debug!("Store health {:?} with {} open connection(s)", status, open_connections);

    HealthReport {
        status,
        servers,
        open_connections,
    }
}
