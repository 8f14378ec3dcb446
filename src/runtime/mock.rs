//! Scripted container runtime for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeConnector};
use crate::error::RuntimeError;
use crate::types::{Node, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(NodeId),
    Create(NodeId, String),
    Start(NodeId, String),
    Kill(NodeId, String),
    Remove(NodeId, String),
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<NodeId, Vec<ContainerSummary>>,
    specs: HashMap<String, ContainerSpec>,
    unreachable: HashSet<NodeId>,
    fail_create: HashMap<NodeId, usize>,
    fail_start: HashMap<NodeId, usize>,
    fail_remove: HashSet<NodeId>,
    holds: HashMap<NodeId, Arc<CreateHold>>,
    calls: Vec<Call>,
    next_id: usize,
}

fn take_failure(budget: &mut HashMap<NodeId, usize>, node: &NodeId) -> bool {
    match budget.get_mut(node) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

/// Parks the next create call on a node until released.
#[derive(Debug, Default)]
pub struct CreateHold {
    entered: Notify,
    release: Notify,
}

impl CreateHold {
    /// Resolves once a create call is parked on the hold.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

fn daemon_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::Api(bollard::errors::Error::DockerResponseServerError {
        status_code: 500,
        message: message.into(),
    })
}

/// Hands out [`MockRuntime`]s sharing one in-memory view of every node.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<State>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn unreachable(&self, node: &str) {
        self.state().unreachable.insert(node.into());
    }

    /// Fails the next `times` create calls on `node`.
    pub fn fail_create(&self, node: &str, times: usize) {
        self.state().fail_create.insert(node.into(), times);
    }

    /// Fails the next `times` start calls on `node`.
    pub fn fail_start(&self, node: &str, times: usize) {
        self.state().fail_start.insert(node.into(), times);
    }

    pub fn fail_remove(&self, node: &str) {
        self.state().fail_remove.insert(node.into());
    }

    /// Parks the next create call on `node` until the hold is released.
    pub fn hold_create(&self, node: &str) -> Arc<CreateHold> {
        let hold = Arc::new(CreateHold::default());
        self.state().holds.insert(node.into(), Arc::clone(&hold));
        hold
    }

    pub fn seed_container(&self, node: &str, name: &str, status: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state
            .containers
            .entry(node.into())
            .or_default()
            .push(ContainerSummary {
                id: id.clone(),
                names: vec![format!("/{}", name)],
                status: status.to_string(),
            });
        id
    }

    pub fn containers(&self, node: &str) -> Vec<ContainerSummary> {
        self.state()
            .containers
            .get(&NodeId::from(node))
            .cloned()
            .unwrap_or_default()
    }

    pub fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.state().specs.get(container_id).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn creates_on(&self, node: &str) -> usize {
        let node = NodeId::from(node);
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create(n, _) if *n == node))
            .count()
    }
}

impl RuntimeConnector for MockConnector {
    fn connect(&self, node: &Node) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
        Ok(Box::new(MockRuntime {
            node: node.id.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockRuntime {
    node: NodeId,
    state: Arc<Mutex<State>>,
}

impl MockRuntime {
    fn reachable(&self, state: &State) -> Result<(), RuntimeError> {
        if state.unreachable.contains(&self.node) {
            return Err(RuntimeError::Unreachable {
                node: self.node.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        self.reachable(&state)?;
        state.calls.push(Call::List(self.node.clone()));
        Ok(state.containers.get(&self.node).cloned().unwrap_or_default())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let hold = self.state.lock().unwrap().holds.remove(&self.node);
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        self.reachable(&state)?;
        state.calls.push(Call::Create(self.node.clone(), spec.name.clone()));
        if take_failure(&mut state.fail_create, &self.node) {
            return Err(daemon_error("create failed"));
        }
        let taken = state
            .containers
            .get(&self.node)
            .map_or(false, |cs| cs.iter().any(|c| c.has_name(&spec.name)));
        if taken {
            return Err(daemon_error(format!("name {} in use", spec.name)));
        }
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state
            .containers
            .entry(self.node.clone())
            .or_default()
            .push(ContainerSummary {
                id: id.clone(),
                names: vec![format!("/{}", spec.name)],
                status: "Created".into(),
            });
        state.specs.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        self.reachable(&state)?;
        state.calls.push(Call::Start(self.node.clone(), id.to_string()));
        if take_failure(&mut state.fail_start, &self.node) {
            return Err(daemon_error("start failed"));
        }
        let node = self.node.clone();
        match state
            .containers
            .get_mut(&node)
            .and_then(|cs| cs.iter_mut().find(|c| c.id == id))
        {
            Some(container) => {
                container.status = "Up 1 second".into();
                Ok(())
            }
            None => Err(daemon_error(format!("no such container {}", id))),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        self.reachable(&state)?;
        state.calls.push(Call::Kill(self.node.clone(), id.to_string()));
        let node = self.node.clone();
        match state
            .containers
            .get_mut(&node)
            .and_then(|cs| cs.iter_mut().find(|c| c.id == id))
        {
            Some(container) if container.status.starts_with("Up") => {
                container.status = "Exited (137) 1 second ago".into();
                Ok(())
            }
            Some(_) => Err(daemon_error(format!("container {} is not running", id))),
            None => Err(daemon_error(format!("no such container {}", id))),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        self.reachable(&state)?;
        state.calls.push(Call::Remove(self.node.clone(), id.to_string()));
        if state.fail_remove.contains(&self.node) {
            return Err(daemon_error("remove failed"));
        }
        if let Some(containers) = state.containers.get_mut(&self.node) {
            containers.retain(|c| c.id != id);
        }
        Ok(())
    }
}
