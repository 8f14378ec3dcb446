//! In-memory state store, optionally seeded from a topology document.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use figment::{
    providers::{Format, Json, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{BungeeFilter, ServerFilter, StateStore};
use crate::error::StoreError;
use crate::types::{
    Bungee, BungeeId, BungeeType, BungeeTypeId, Network, NetworkId, Node, NodeId, Server,
    ServerId, ServerType, ServerTypeId,
};

/// Operator-entered catalog: nodes, instance types and networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub server_types: Vec<ServerType>,
    #[serde(default)]
    pub bungee_types: Vec<BungeeType>,
    #[serde(default)]
    pub networks: Vec<Network>,
}

impl Topology {
    /// Reads a topology document; `.json` files are parsed as JSON,
    /// anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, figment::Error> {
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Figment::from(Json::file(path)),
            _ => Figment::from(Toml::file(path)),
        };
        figment.extract()
    }
}

#[derive(Debug, Default)]
struct Tables {
    networks: BTreeMap<NetworkId, Network>,
    nodes: BTreeMap<NodeId, Node>,
    server_types: BTreeMap<ServerTypeId, ServerType>,
    bungee_types: BTreeMap<BungeeTypeId, BungeeType>,
    servers: BTreeMap<ServerId, Server>,
    bungees: BTreeMap<BungeeId, Bungee>,
}

/// A [`StateStore`] keeping every table behind one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn from_topology(topology: Topology) -> Self {
        let tables = Tables {
            networks: topology.networks.into_iter().map(|n| (n.id.clone(), n)).collect(),
            nodes: topology.nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            server_types: topology
                .server_types
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            bungee_types: topology
                .bungee_types
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
            ..Default::default()
        };
        Self {
            tables: RwLock::new(tables),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn networks(&self) -> Result<Vec<Network>, StoreError> {
        Ok(self.tables.read().await.networks.values().cloned().collect())
    }

    async fn network(&self, id: &NetworkId) -> Result<Option<Network>, StoreError> {
        Ok(self.tables.read().await.networks.get(id).cloned())
    }

    async fn node(&self, id: &NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.tables.read().await.nodes.get(id).cloned())
    }

    async fn server_type(&self, id: &ServerTypeId) -> Result<Option<ServerType>, StoreError> {
        Ok(self.tables.read().await.server_types.get(id).cloned())
    }

    async fn bungee_type(&self, id: &BungeeTypeId) -> Result<Option<BungeeType>, StoreError> {
        Ok(self.tables.read().await.bungee_types.get(id).cloned())
    }

    async fn server(&self, id: &ServerId) -> Result<Option<Server>, StoreError> {
        Ok(self.tables.read().await.servers.get(id).cloned())
    }

    async fn servers(&self, filter: &ServerFilter) -> Result<Vec<Server>, StoreError> {
        let tables = self.tables.read().await;
        let mut servers: Vec<Server> = tables
            .servers
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        servers.sort_by_key(|s| s.number);
        Ok(servers)
    }

    async fn insert_server(&self, server: &Server) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.servers.contains_key(&server.id) {
            return Err(StoreError::Duplicate(server.id.to_string()));
        }
        tables.servers.insert(server.id.clone(), server.clone());
        Ok(())
    }

    async fn save_server(&self, server: &Server) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.servers.get_mut(&server.id) {
            Some(existing) => {
                *existing = server.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(server.id.to_string())),
        }
    }

    async fn remove_server(&self, id: &ServerId) -> Result<(), StoreError> {
        self.tables.write().await.servers.remove(id);
        Ok(())
    }

    async fn next_server_number(
        &self,
        network: &NetworkId,
        server_type: &ServerTypeId,
    ) -> Result<u32, StoreError> {
        let tables = self.tables.read().await;
        let used: BTreeSet<u32> = tables
            .servers
            .values()
            .filter(|s| &s.network == network && &s.server_type == server_type)
            .map(|s| s.number)
            .collect();
        Ok((1..).find(|n| !used.contains(n)).unwrap_or(1))
    }

    async fn bungee(&self, id: &BungeeId) -> Result<Option<Bungee>, StoreError> {
        Ok(self.tables.read().await.bungees.get(id).cloned())
    }

    async fn bungees(&self, filter: &BungeeFilter) -> Result<Vec<Bungee>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .bungees
            .values()
            .filter(|b| filter.matches(b))
            .cloned()
            .collect())
    }

    async fn insert_bungee(&self, bungee: &Bungee) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.bungees.contains_key(&bungee.id) {
            return Err(StoreError::Duplicate(bungee.id.to_string()));
        }
        tables.bungees.insert(bungee.id.clone(), bungee.clone());
        Ok(())
    }

    async fn save_bungee(&self, bungee: &Bungee) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.bungees.get_mut(&bungee.id) {
            Some(existing) => {
                *existing = bungee.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(bungee.id.to_string())),
        }
    }

    async fn remove_bungee(&self, id: &BungeeId) -> Result<(), StoreError> {
        self.tables.write().await.bungees.remove(id);
        Ok(())
    }
}
