use super::{ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeConnector};
use crate::error::RuntimeError;
use crate::types::Node;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use log::debug;
use std::collections::HashMap;

/// Connects to each node's Docker daemon over plain HTTP.
pub struct DockerConnector {
    port: u16,
    timeout_secs: u64,
}

impl DockerConnector {
    pub fn new(port: u16, timeout_secs: u64) -> Self {
        Self { port, timeout_secs }
    }
}

impl RuntimeConnector for DockerConnector {
    fn connect(&self, node: &Node) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
        let endpoint = format!("http://{}:{}", node.private_address, self.port);
        let docker = Docker::connect_with_http(&endpoint, self.timeout_secs, API_DEFAULT_VERSION)
            .map_err(|e| RuntimeError::Unreachable {
                node: node.name.clone(),
                reason: e.to_string(),
            })?;
        debug!("Connected to Docker daemon of node {} at {}", node.name, endpoint);
        Ok(Box::new(DockerRuntime { docker }))
    }
}

pub struct DockerRuntime {
    docker: Docker,
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                Some(ContainerSummary {
                    id,
                    names: c.names.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some(port.host_ip.clone()),
                    host_port: Some(port.host_port.to_string()),
                }]),
            );
        }

        // Host settings are applied at create time; start takes none.
        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            publish_all_ports: Some(spec.publish_all_ports),
            binds: Some(spec.binds.clone()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self.docker.create_container(Some(opts), config).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(opts)).await?;
        Ok(())
    }
}
