//! Node selection for new instances.
//!
//! Free capacity is never stored: it is recomputed at selection time from
//! the instance records currently bound to each node, across every network
//! that shares the node.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::warn;

use crate::error::StoreError;
use crate::store::{BungeeFilter, ServerFilter, StateStore};
use crate::types::{BungeeType, Liveness, Network, Node, NodeId, ServerType};

/// Snapshot of one node's RAM usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCapacity {
    pub node: Node,
    pub used_ram_mb: u64,
}

impl NodeCapacity {
    pub fn free_ram_mb(&self) -> u64 {
        self.node.ram_mb.saturating_sub(self.used_ram_mb)
    }

    pub fn can_fit_server(&self, server_type: &ServerType) -> bool {
        self.free_ram_mb() >= server_type.ram_mb
    }

    pub fn can_fit_bungee(&self, bungee_type: &BungeeType) -> bool {
        self.free_ram_mb() >= bungee_type.ram_mb
    }
}

/// Picks the candidate with the most free RAM that can fit `server_type`
/// and is not excluded.  Ties go to the lowest node id.  `None` means the
/// network has no capacity left, which is an ordinary outcome.
pub fn select_node<'a>(
    candidates: &'a [NodeCapacity],
    server_type: &ServerType,
    excluded: &HashSet<NodeId>,
) -> Option<&'a NodeCapacity> {
    candidates
        .iter()
        .filter(|c| !excluded.contains(&c.node.id) && c.can_fit_server(server_type))
        .max_by(|a, b| {
            a.free_ram_mb()
                .cmp(&b.free_ram_mb())
                .then_with(|| b.node.id.cmp(&a.node.id))
        })
}

/// Computes the capacity of a single node.
///
/// Every bound, unexpired server and bungee counts against the node.  The
/// record named by `except` is left out so an instance being provisioned
/// on a pre-assigned node does not count against itself.
pub async fn node_capacity(
    store: &dyn StateStore,
    node: Node,
    liveness: Liveness,
    now: DateTime<Utc>,
    except: Option<&str>,
) -> Result<NodeCapacity, StoreError> {
    let mut used_ram_mb = 0;

    let mut server_ram = HashMap::new();
    for server in store.servers(&ServerFilter::on_node(&node.id)).await? {
        if Some(server.id.as_str()) == except || liveness.is_expired(server.updated_at, now) {
            continue;
        }
        if !server_ram.contains_key(&server.server_type) {
            let ram = store
                .server_type(&server.server_type)
                .await?
                .map_or(0, |t| t.ram_mb);
            server_ram.insert(server.server_type.clone(), ram);
        }
        used_ram_mb += server_ram[&server.server_type];
    }

    let mut bungee_ram = HashMap::new();
    for bungee in store.bungees(&BungeeFilter::on_node(&node.id)).await? {
        if Some(bungee.id.as_str()) == except || liveness.is_expired(bungee.updated_at, now) {
            continue;
        }
        if !bungee_ram.contains_key(&bungee.bungee_type) {
            let ram = store
                .bungee_type(&bungee.bungee_type)
                .await?
                .map_or(0, |t| t.ram_mb);
            bungee_ram.insert(bungee.bungee_type.clone(), ram);
        }
        used_ram_mb += bungee_ram[&bungee.bungee_type];
    }

    Ok(NodeCapacity { node, used_ram_mb })
}

/// Computes the capacity of every member node of `network`.
pub async fn network_capacity(
    store: &dyn StateStore,
    network: &Network,
    liveness: Liveness,
    now: DateTime<Utc>,
) -> Result<Vec<NodeCapacity>, StoreError> {
    let mut capacity = Vec::with_capacity(network.nodes.len());
    for member in &network.nodes {
        match store.node(&member.node).await? {
            Some(node) => capacity.push(node_capacity(store, node, liveness, now, None).await?),
            None => warn!("Network {} lists unknown node {}", network.name, member.node),
        }
    }
    Ok(capacity)
}
