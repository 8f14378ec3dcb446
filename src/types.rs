//! Data structures shared by the reconciler, placement and provisioning
//! paths.
//!
//! Catalog entities ([`Network`], [`Node`], [`ServerType`], [`BungeeType`])
//! are entered by operators and are read-only to the control plane.  The
//! instance records ([`Server`], [`Bungee`]) are the observed state: they are
//! minted pending, bound to a node, started, and then kept alive by an
//! external heartbeat that pushes `updated_at` forward.  A record whose
//! `updated_at` falls too far behind the clock is presumed dead.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* instance $name:ident) => {
        define_id!($(#[$meta])* $name);

        impl $name {
            /// Mints a fresh random identity.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

define_id!(
    /// Identity of a tenant network.
    NetworkId
);
define_id!(
    /// Identity of a worker node.
    NodeId
);
define_id!(ServerTypeId);
define_id!(BungeeTypeId);
define_id!(
    /// Identity of a server instance record; doubles as the idempotency key
    /// of its creation intent.
    instance ServerId
);
define_id!(
    /// Identity of a bungee instance record.
    instance BungeeId
);

/// A worker host running the container daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Address the container daemon listens on.
    pub private_address: String,
    #[serde(default)]
    pub public_addresses: Vec<String>,
    /// Total RAM available to instances, in megabytes.
    pub ram_mb: u64,
}

impl Node {
    pub fn has_public_address(&self, address: &str) -> bool {
        self.public_addresses.iter().any(|a| a == address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerType {
    pub id: ServerTypeId,
    pub name: String,
    pub ram_mb: u64,
    /// Overrides the configured server image for this type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BungeeType {
    pub id: BungeeTypeId,
    pub name: String,
    pub ram_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Membership of a node in a network, with its optional proxy slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub node: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bungee_type: Option<BungeeTypeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

/// Desired capacity for one server type within a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkServerType {
    pub server_type: ServerTypeId,
    pub amount: u32,
    /// Manual-start types are never filled automatically.
    #[serde(default)]
    pub manual_start: bool,
}

/// An operator-assigned proxy slot: one bungee type pinned to one public
/// address of one member node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BungeeSlot<'a> {
    pub node: &'a NodeId,
    pub bungee_type: &'a BungeeTypeId,
    pub public_address: &'a str,
}

/// A tenant's logical cluster and its declared desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NetworkNode>,
    #[serde(default)]
    pub server_types: Vec<NetworkServerType>,
}

impl Network {
    pub fn server_type(&self, id: &ServerTypeId) -> Option<&NetworkServerType> {
        self.server_types.iter().find(|t| &t.server_type == id)
    }

    /// Proxy slots declared by this network.  Members with only one of
    /// the type or the address set declare nothing.
    pub fn bungee_slots(&self) -> impl Iterator<Item = BungeeSlot<'_>> {
        self.nodes.iter().filter_map(|member| {
            match (&member.bungee_type, &member.public_address) {
                (Some(bungee_type), Some(public_address)) => Some(BungeeSlot {
                    node: &member.node,
                    bungee_type,
                    public_address,
                }),
                _ => None,
            }
        })
    }

    pub fn declares_slot(&self, bungee_type: &BungeeTypeId, node: &NodeId, address: &str) -> bool {
        self.bungee_slots().any(|slot| {
            slot.bungee_type == bungee_type && slot.node == node && slot.public_address == address
        })
    }
}

/// A game-server instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub network: NetworkId,
    pub server_type: ServerTypeId,
    /// Ordinal unique within (network, server type), starting at 1.
    pub number: u32,
    pub node: Option<NodeId>,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Heartbeat deadline.
    pub updated_at: DateTime<Utc>,
}

impl Server {
    pub fn pending(network: NetworkId, server_type: ServerTypeId, number: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: ServerId::generate(),
            network,
            server_type,
            number,
            node: None,
            container_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.node.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.container_id.is_some()
    }
}

/// An edge-proxy instance record.  Its node and public address come from
/// the network's declared slot, never from placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bungee {
    pub id: BungeeId,
    pub network: NetworkId,
    pub bungee_type: BungeeTypeId,
    pub node: Option<NodeId>,
    pub public_address: Option<String>,
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bungee {
    pub fn pending(
        network: NetworkId,
        bungee_type: BungeeTypeId,
        node: NodeId,
        public_address: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BungeeId::generate(),
            network,
            bungee_type,
            node: Some(node),
            public_address: Some(public_address),
            container_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_started(&self) -> bool {
        self.container_id.is_some()
    }
}

/// Heartbeat expiry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    dead_after: Duration,
}

impl Liveness {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            dead_after: Duration::seconds(secs as i64),
        }
    }

    /// True once `now - updated_at` exceeds the dead threshold.
    pub fn is_expired(&self, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - updated_at > self.dead_after
    }
}
