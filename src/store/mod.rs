use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    Bungee, BungeeId, BungeeType, BungeeTypeId, Network, NetworkId, Node, NodeId, Server,
    ServerId, ServerType, ServerTypeId,
};

pub mod memory;
pub use memory::{MemoryStore, Topology};

/// Filter for server record listings.  Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    pub network: Option<NetworkId>,
    pub server_type: Option<ServerTypeId>,
    pub number: Option<u32>,
    pub node: Option<NodeId>,
}

impl ServerFilter {
    pub fn network(network: &NetworkId) -> Self {
        Self {
            network: Some(network.clone()),
            ..Default::default()
        }
    }

    pub fn on_node(node: &NodeId) -> Self {
        Self {
            node: Some(node.clone()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, server_type: &ServerTypeId) -> Self {
        self.server_type = Some(server_type.clone());
        self
    }

    pub fn matches(&self, server: &Server) -> bool {
        self.network.as_ref().map_or(true, |n| &server.network == n)
            && self.server_type.as_ref().map_or(true, |t| &server.server_type == t)
            && self.number.map_or(true, |n| server.number == n)
            && self.node.as_ref().map_or(true, |n| server.node.as_ref() == Some(n))
    }
}

/// Filter for bungee record listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BungeeFilter {
    pub network: Option<NetworkId>,
    pub node: Option<NodeId>,
    pub public_address: Option<String>,
}

impl BungeeFilter {
    pub fn network(network: &NetworkId) -> Self {
        Self {
            network: Some(network.clone()),
            ..Default::default()
        }
    }

    pub fn on_node(node: &NodeId) -> Self {
        Self {
            node: Some(node.clone()),
            ..Default::default()
        }
    }

    pub fn at_slot(mut self, node: &NodeId, public_address: &str) -> Self {
        self.node = Some(node.clone());
        self.public_address = Some(public_address.to_string());
        self
    }

    pub fn matches(&self, bungee: &Bungee) -> bool {
        self.network.as_ref().map_or(true, |n| &bungee.network == n)
            && self.node.as_ref().map_or(true, |n| bungee.node.as_ref() == Some(n))
            && self
                .public_address
                .as_ref()
                .map_or(true, |a| bungee.public_address.as_ref() == Some(a))
    }
}

/// Access to topology and observed-instance records.
///
/// Catalog entities are read-only here; instance records support point
/// lookups, filtered listings and single-record writes.  No operation spans
/// more than one record.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn networks(&self) -> Result<Vec<Network>, StoreError>;
    async fn network(&self, id: &NetworkId) -> Result<Option<Network>, StoreError>;
    async fn node(&self, id: &NodeId) -> Result<Option<Node>, StoreError>;
    async fn server_type(&self, id: &ServerTypeId) -> Result<Option<ServerType>, StoreError>;
    async fn bungee_type(&self, id: &BungeeTypeId) -> Result<Option<BungeeType>, StoreError>;

    async fn server(&self, id: &ServerId) -> Result<Option<Server>, StoreError>;
    async fn servers(&self, filter: &ServerFilter) -> Result<Vec<Server>, StoreError>;
    async fn insert_server(&self, server: &Server) -> Result<(), StoreError>;
    async fn save_server(&self, server: &Server) -> Result<(), StoreError>;
    async fn remove_server(&self, id: &ServerId) -> Result<(), StoreError>;
    /// Smallest ordinal >= 1 not used by any server of (network, type).
    async fn next_server_number(
        &self,
        network: &NetworkId,
        server_type: &ServerTypeId,
    ) -> Result<u32, StoreError>;

    async fn bungee(&self, id: &BungeeId) -> Result<Option<Bungee>, StoreError>;
    async fn bungees(&self, filter: &BungeeFilter) -> Result<Vec<Bungee>, StoreError>;
    async fn insert_bungee(&self, bungee: &Bungee) -> Result<(), StoreError>;
    async fn save_bungee(&self, bungee: &Bungee) -> Result<(), StoreError>;
    async fn remove_bungee(&self, id: &BungeeId) -> Result<(), StoreError>;
}

/// Inserts a pending, unbound server record carrying the next free ordinal.
pub async fn mint_server(
    store: &dyn StateStore,
    network: &NetworkId,
    server_type: &ServerTypeId,
    now: DateTime<Utc>,
) -> Result<Server, StoreError> {
    let number = store.next_server_number(network, server_type).await?;
    let server = Server::pending(network.clone(), server_type.clone(), number, now);
    store.insert_server(&server).await?;
    Ok(server)
}

/// Inserts a pending bungee record for a declared proxy slot.
pub async fn mint_bungee(
    store: &dyn StateStore,
    network: &NetworkId,
    bungee_type: &BungeeTypeId,
    node: &NodeId,
    public_address: &str,
    now: DateTime<Utc>,
) -> Result<Bungee, StoreError> {
    let bungee = Bungee::pending(
        network.clone(),
        bungee_type.clone(),
        node.clone(),
        public_address.to_string(),
        now,
    );
    store.insert_bungee(&bungee).await?;
    Ok(bungee)
}
