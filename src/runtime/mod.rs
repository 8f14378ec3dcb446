use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::types::Node;

pub mod docker;
#[cfg(test)]
pub mod mock;

pub use docker::DockerConnector;

/// A container as reported by the daemon's list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the daemon, usually with a leading `/`.
    pub names: Vec<String>,
    /// Human readable status, e.g. `Exited (0) 3 minutes ago`.
    pub status: String,
}

impl ContainerSummary {
    pub fn has_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.trim_start_matches('/') == name)
    }

    pub fn is_exited(&self) -> bool {
        self.status.to_lowercase().contains("exit")
    }
}

/// A host port binding for one container TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_ip: String,
    pub host_port: u16,
}

/// Everything needed to create one instance container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// Used for both the container name and its hostname.
    pub name: String,
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
    /// Volume binds in `host:container` form.
    pub binds: Vec<String>,
    pub publish_all_ports: bool,
}

/// Operations against one node's container daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Lists every container, stopped ones included.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Creates a container and returns its id.  Does not start it.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-removes a container whatever its state.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

/// Builds a fresh runtime client for a node.  Clients are never cached so
/// that a node coming back after a failure is reached through a new
/// connection.
pub trait RuntimeConnector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Box<dyn ContainerRuntime>, RuntimeError>;
}
