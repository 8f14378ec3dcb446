//! Creation intents exchanged over the intent channel.
//!
//! Both message kinds accept two payload shapes: a reference to an already
//! minted instance record, or the instance's coordinates, which the worker
//! resolves into a fresh record before placement.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;
use crate::types::{BungeeId, BungeeTypeId, NetworkId, NodeId, ServerId, ServerTypeId};

pub const SERVER_TOPIC: &str = "server_build";
pub const BUNGEE_TOPIC: &str = "bungee_build";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerCreate {
    ById {
        server: ServerId,
    },
    BySpec {
        network: NetworkId,
        #[serde(rename = "serverType")]
        server_type: ServerTypeId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BungeeCreate {
    ById {
        bungee: BungeeId,
    },
    BySpec {
        network: NetworkId,
        #[serde(rename = "bungeeType")]
        bungee_type: BungeeTypeId,
        node: NodeId,
        #[serde(rename = "publicAddress")]
        public_address: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    ServerCreate(ServerCreate),
    BungeeCreate(BungeeCreate),
}

impl Intent {
    pub fn topic(&self) -> &'static str {
        match self {
            Intent::ServerCreate(_) => SERVER_TOPIC,
            Intent::BungeeCreate(_) => BUNGEE_TOPIC,
        }
    }

    pub fn to_payload(&self) -> Result<Value, ChannelError> {
        let payload = match self {
            Intent::ServerCreate(msg) => serde_json::to_value(msg)?,
            Intent::BungeeCreate(msg) => serde_json::to_value(msg)?,
        };
        Ok(payload)
    }

    /// Decodes a payload received on `topic`.
    pub fn decode(topic: &str, payload: &Value) -> Result<Self, ChannelError> {
        match topic {
            SERVER_TOPIC => Ok(Intent::ServerCreate(ServerCreate::deserialize(payload)?)),
            BUNGEE_TOPIC => Ok(Intent::BungeeCreate(BungeeCreate::deserialize(payload)?)),
            other => Err(ChannelError::UnknownTopic(other.to_string())),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::ServerCreate(ServerCreate::ById { server }) => write!(f, "create server {}", server),
            Intent::ServerCreate(ServerCreate::BySpec {
                network,
                server_type,
            }) => write!(f, "create {} server in network {}", server_type, network),
            Intent::BungeeCreate(BungeeCreate::ById { bungee }) => write!(f, "create bungee {}", bungee),
            Intent::BungeeCreate(BungeeCreate::BySpec {
                network,
                bungee_type,
                node,
                public_address,
            }) => write!(
                f,
                "create {} bungee at {}/{} in network {}",
                bungee_type, node, public_address, network
            ),
        }
    }
}
