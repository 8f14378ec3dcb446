//! Container lifecycle routines shared by provisioning and teardown.
//!
//! Containers are found again purely by their deterministic name,
//! `{type}.{discriminator}`, where the discriminator is a server's ordinal
//! or a bungee's public address.  The name does not include the network,
//! so two networks must not reuse a type name/ordinal pair on one node.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::RuntimeError;
use crate::runtime::{ContainerSpec, RuntimeConnector};
use crate::types::{BungeeType, Node, ServerType};

pub fn server_container_name(server_type: &ServerType, number: u32) -> String {
    format!("{}.{}", server_type.name, number)
}

pub fn bungee_container_name(bungee_type: &BungeeType, public_address: &str) -> String {
    format!("{}.{}", bungee_type.name, public_address)
}

/// Failure of a create+start attempt, split by the call that failed.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to remove stale container: {0}")]
    Cleanup(#[source] RuntimeError),

    #[error("failed to create container: {0}")]
    Create(#[source] RuntimeError),

    #[error("failed to start container {container_id}: {source}")]
    Start {
        container_id: String,
        #[source]
        source: RuntimeError,
    },
}

#[derive(Clone)]
pub struct Lifecycle {
    connector: Arc<dyn RuntimeConnector>,
}

impl Lifecycle {
    pub fn new(connector: Arc<dyn RuntimeConnector>) -> Self {
        Self { connector }
    }

    /// Force-kills and removes the container called `name` on `node`.
    ///
    /// Returns whether a container was found.  Kill failures (typically an
    /// already stopped container) are ignored; remove failures are not.
    pub async fn remove_existing(&self, node: &Node, name: &str) -> Result<bool, RuntimeError> {
        let runtime = self.connector.connect(node)?;
        let containers = runtime.list_containers().await?;

        let Some(container) = containers.iter().find(|c| c.has_name(name)) else {
            return Ok(false);
        };

        info!("Deleting container {} ({}) on node {}", name, container.id, node.name);
        if let Err(e) = runtime.kill_container(&container.id).await {
            debug!("Ignoring kill failure for {} on node {}: {}", name, node.name, e);
        }
        runtime.remove_container(&container.id).await?;
        Ok(true)
    }

    /// Force-kills and removes one container by id.  Unlike
    /// [`Lifecycle::remove_existing`] this never touches a newer container
    /// that took over the same name.
    pub async fn remove_container(&self, node: &Node, container_id: &str) -> Result<(), RuntimeError> {
        let runtime = self.connector.connect(node)?;
        if let Err(e) = runtime.kill_container(container_id).await {
            debug!("Ignoring kill failure for {} on node {}: {}", container_id, node.name, e);
        }
        runtime.remove_container(container_id).await
    }

    /// Creates the container described by `spec` on `node` and starts it.
    ///
    /// Create and start are separate daemon calls; a start failure leaves a
    /// created container behind which the caller must clean up by name.
    pub async fn create_and_start(&self, node: &Node, spec: &ContainerSpec) -> Result<String, LaunchError> {
        let runtime = self.connector.connect(node).map_err(LaunchError::Create)?;

        info!("Setting up container {} on node {}", spec.name, node.name);
        let container_id = runtime
            .create_container(spec)
            .await
            .map_err(LaunchError::Create)?;

        info!("Starting container {} ({}) on node {}", spec.name, container_id, node.name);
        if let Err(source) = runtime.start_container(&container_id).await {
            return Err(LaunchError::Start {
                container_id,
                source,
            });
        }
        Ok(container_id)
    }

    /// Force-removes every exited container on `node`.
    ///
    /// Fails only if the node cannot be listed; individual removal failures
    /// are logged and skipped.  Returns the number of containers removed.
    pub async fn reap_exited(&self, node: &Node) -> Result<usize, RuntimeError> {
        let runtime = self.connector.connect(node)?;
        let mut reaped = 0;
        for container in runtime.list_containers().await? {
            if !container.is_exited() {
                continue;
            }
            info!("Deleting dead container {:?} on node {}", container.names, node.name);
            match runtime.remove_container(&container.id).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!(
                    "Failed to delete dead container {} on node {}: {}",
                    container.id, node.name, e
                ),
            }
        }
        Ok(reaped)
    }
}
