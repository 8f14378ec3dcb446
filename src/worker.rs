//! Provisioning worker.
//!
//! Turns one creation intent into a bound, started and persisted instance.
//! Delivery is at-least-once, so every attempt is keyed by the instance id:
//! a process-wide in-flight set admits at most one attempt per instance,
//! and an instance that is already started is acknowledged without
//! touching the daemon again.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use log::{error, info, warn};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::channel::{Delivery, IntentChannel};
use crate::config::{Config, ContainerEnv};
use crate::error::{Result, StoreError};
use crate::intent::{BungeeCreate, Intent, ServerCreate, BUNGEE_TOPIC, SERVER_TOPIC};
use crate::lifecycle::{bungee_container_name, server_container_name, LaunchError, Lifecycle};
use crate::placement::{network_capacity, node_capacity, select_node};
use crate::report::{ErrorReporter, FailureReport};
use crate::runtime::{ContainerSpec, PortMapping, RuntimeConnector};
use crate::store::{mint_bungee, mint_server, BungeeFilter, ServerFilter, StateStore};
use crate::types::{BungeeId, Liveness, NetworkId, Node, NodeId, ServerId};

/// Static provisioning policy, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_image: String,
    pub bungee_image: String,
    pub bungee_port: u16,
    pub data_volume: String,
    pub start_grace: Duration,
    pub start_retries: u32,
    pub max_placements: usize,
    pub liveness: Liveness,
    pub env: ContainerEnv,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server_image: config.server_image.clone(),
            bungee_image: config.bungee_image.clone(),
            bungee_port: config.bungee_port,
            data_volume: config.data_volume.clone(),
            start_grace: Duration::seconds(config.start_grace_secs as i64),
            start_retries: config.start_retries,
            max_placements: config.max_placements,
            liveness: Liveness::from_secs(config.dead_threshold_secs),
            env: config.container_env(),
        }
    }

    fn data_bind(&self) -> String {
        format!("{0}:{0}", self.data_volume)
    }
}

/// Why an intent was turned down.  None of these are faults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownInstance,
    UnknownNetwork,
    UnknownType,
    UnknownNode,
    TypeNotInNetwork,
    SlotNotDeclared,
    /// The instance is bound to a node but was never started.
    AlreadyBound,
    AmountReached { running: usize, amount: u32 },
    SlotOccupied,
    NoCapacity,
    /// Every placement attempt failed.
    Exhausted { node: Option<NodeId> },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnknownInstance => f.write_str("instance record no longer exists"),
            Rejection::UnknownNetwork => f.write_str("network no longer exists"),
            Rejection::UnknownType => f.write_str("instance type no longer exists"),
            Rejection::UnknownNode => f.write_str("node no longer exists"),
            Rejection::TypeNotInNetwork => f.write_str("type was never added to the network"),
            Rejection::SlotNotDeclared => f.write_str("network does not declare this proxy slot"),
            Rejection::AlreadyBound => f.write_str("instance is already bound to a node"),
            Rejection::AmountReached { running, amount } => {
                write!(f, "{} running with {} declared", running, amount)
            }
            Rejection::SlotOccupied => f.write_str("proxy slot is already occupied"),
            Rejection::NoCapacity => f.write_str("no node has capacity"),
            Rejection::Exhausted { node: Some(node) } => {
                write!(f, "placement attempts exhausted, last failure on node {}", node)
            }
            Rejection::Exhausted { node: None } => f.write_str("placement attempts exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Provisioned { node: NodeId, container_id: String },
    /// Redelivery for an instance that is already started.
    AlreadyProvisioned,
    Rejected(Rejection),
    /// Another attempt for the same instance is in flight.
    Busy,
}

/// Process-wide set of instance ids with a provisioning attempt running.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Claims `key`, or returns `None` if it is already claimed.  The claim
    /// is released when the guard drops, whatever the attempt's result.
    pub fn try_claim(&self, key: &str) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key: key.to_string(),
        })
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }
}

pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

pub struct Provisioner {
    store: Arc<dyn StateStore>,
    lifecycle: Lifecycle,
    reporter: Arc<dyn ErrorReporter>,
    settings: Settings,
    in_flight: InFlight,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn StateStore>,
        connector: Arc<dyn RuntimeConnector>,
        reporter: Arc<dyn ErrorReporter>,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            lifecycle: Lifecycle::new(connector),
            reporter,
            settings,
            in_flight: InFlight::default(),
        }
    }

    /// Decodes and handles one delivery, then settles it.
    pub async fn dispatch(&self, delivery: Delivery) {
        let intent = match Intent::decode(delivery.topic(), delivery.payload()) {
            Ok(intent) => intent,
            Err(e) => {
                warn!("Dropping malformed intent on {}: {}", delivery.topic(), e);
                delivery.nack(false);
                return;
            }
        };

        match self.handle(&intent).await {
            Ok(Outcome::Provisioned { .. }) | Ok(Outcome::AlreadyProvisioned) => delivery.ack(),
            Ok(Outcome::Busy) => {
                warn!("Already provisioning for intent to {}, requeueing", intent);
                delivery.nack(true);
            }
            Ok(Outcome::Rejected(reason)) => {
                warn!("Intent to {} rejected: {}", intent, reason);
                delivery.nack(false);
            }
            Err(e) => {
                error!("Intent to {} failed: {}", intent, e);
                delivery.nack(false);
            }
        }
    }

    pub async fn handle(&self, intent: &Intent) -> Result<Outcome> {
        match intent {
            Intent::ServerCreate(msg) => self.provision_server(msg).await,
            Intent::BungeeCreate(msg) => self.provision_bungee(msg).await,
        }
    }

    pub async fn provision_server(&self, msg: &ServerCreate) -> Result<Outcome> {
        let id = match msg {
            ServerCreate::ById { server } => server.clone(),
            ServerCreate::BySpec {
                network,
                server_type,
            } => {
                let Some(net) = self.store.network(network).await? else {
                    return Ok(Outcome::Rejected(Rejection::UnknownNetwork));
                };
                if net.server_type(server_type).is_none() {
                    return Ok(Outcome::Rejected(Rejection::TypeNotInNetwork));
                }
                mint_server(self.store.as_ref(), network, server_type, Utc::now()).await?.id
            }
        };

        let Some(_guard) = self.in_flight.try_claim(id.as_str()) else {
            return Ok(Outcome::Busy);
        };
        self.place_server(&id).await
    }

    async fn place_server(&self, id: &ServerId) -> Result<Outcome> {
        let store = self.store.as_ref();
        let Some(mut server) = store.server(id).await? else {
            return Ok(Outcome::Rejected(Rejection::UnknownInstance));
        };
        if server.is_started() {
            return Ok(Outcome::AlreadyProvisioned);
        }
        if server.is_bound() {
            return Ok(Outcome::Rejected(Rejection::AlreadyBound));
        }
        let Some(network) = store.network(&server.network).await? else {
            return Ok(Outcome::Rejected(Rejection::UnknownNetwork));
        };
        let Some(server_type) = store.server_type(&server.server_type).await? else {
            return Ok(Outcome::Rejected(Rejection::UnknownType));
        };
        let Some(declared) = network.server_type(&server_type.id) else {
            return Ok(Outcome::Rejected(Rejection::TypeNotInNetwork));
        };

        let now = Utc::now();
        let running = store
            .servers(&ServerFilter::network(&network.id).with_type(&server_type.id))
            .await?
            .iter()
            .filter(|s| s.id != server.id && !self.settings.liveness.is_expired(s.updated_at, now))
            .count();
        if running >= declared.amount as usize {
            // Surplus pending record from racing sweeps; nothing else owns it.
            store.remove_server(&server.id).await?;
            return Ok(Outcome::Rejected(Rejection::AmountReached {
                running,
                amount: declared.amount,
            }));
        }

        let name = server_container_name(&server_type, server.number);
        let spec = ContainerSpec {
            image: server_type
                .image
                .clone()
                .unwrap_or_else(|| self.settings.server_image.clone()),
            name: name.clone(),
            env: self.settings.env.render("server_id", server.id.as_str()),
            ports: Vec::new(),
            binds: vec![self.settings.data_bind()],
            publish_all_ports: true,
        };

        let mut excluded: HashSet<NodeId> = HashSet::new();
        let mut last_failure: Option<(NodeId, LaunchError)> = None;
        let minted_at = server.updated_at;

        for attempt in 1..=self.settings.max_placements {
            let capacity =
                network_capacity(store, &network, self.settings.liveness, Utc::now()).await?;
            let Some(choice) = select_node(&capacity, &server_type, &excluded) else {
                if last_failure.is_none() {
                    warn!(
                        "Could not find a node to place {} for network {}. Is the network over provisioned?",
                        name, network.name
                    );
                    return Ok(Outcome::Rejected(Rejection::NoCapacity));
                }
                break;
            };
            let node = choice.node.clone();

            info!(
                "Placing server {} on node {} for network {} (attempt {})",
                name, node.name, network.name, attempt
            );
            // A bound record carries the start grace so sweeps leave it
            // alone while the launch runs.
            server.node = Some(node.id.clone());
            server.container_id = None;
            server.updated_at = Utc::now() + self.settings.start_grace;
            store.save_server(&server).await?;

            match self.launch(&node, &spec).await {
                Ok(container_id) => {
                    server.container_id = Some(container_id.clone());
                    server.updated_at = Utc::now() + self.settings.start_grace;
                    if let Err(e) = store.save_server(&server).await {
                        self.discard(&node, &container_id, &name, &network.id, &e).await;
                        return Err(e.into());
                    }
                    info!("Server {} for network {} is up on node {}", name, network.name, node.name);
                    return Ok(Outcome::Provisioned {
                        node: node.id,
                        container_id,
                    });
                }
                Err(e) => {
                    error!(
                        "Failed to launch {} on node {} for network {}: {}",
                        name, node.name, network.name, e
                    );
                    server.node = None;
                    server.updated_at = minted_at;
                    if let Err(unbind) = store.save_server(&server).await {
                        error!(
                            "Failed to unbind {} from node {}: {}",
                            name, node.name, unbind
                        );
                    }
                    excluded.insert(node.id.clone());
                    last_failure = Some((node.id, e));
                }
            }
        }

        let node = last_failure.as_ref().map(|(node, _)| node.clone());
        self.reporter.report(&FailureReport {
            instance: name,
            network: network.id.clone(),
            node: node.clone(),
            error: last_failure
                .map(|(_, e)| e.to_string())
                .unwrap_or_else(|| "no placement attempted".into()),
        });
        Ok(Outcome::Rejected(Rejection::Exhausted { node }))
    }

    pub async fn provision_bungee(&self, msg: &BungeeCreate) -> Result<Outcome> {
        let id = match msg {
            BungeeCreate::ById { bungee } => bungee.clone(),
            BungeeCreate::BySpec {
                network,
                bungee_type,
                node,
                public_address,
            } => {
                let existing = self
                    .store
                    .bungees(&BungeeFilter::network(network).at_slot(node, public_address))
                    .await?;
                match existing.into_iter().next() {
                    Some(bungee) => bungee.id,
                    None => {
                        let Some(net) = self.store.network(network).await? else {
                            return Ok(Outcome::Rejected(Rejection::UnknownNetwork));
                        };
                        if !net.declares_slot(bungee_type, node, public_address) {
                            return Ok(Outcome::Rejected(Rejection::SlotNotDeclared));
                        }
                        let now = Utc::now();
                        mint_bungee(self.store.as_ref(), network, bungee_type, node, public_address, now)
                            .await?
                            .id
                    }
                }
            }
        };

        let Some(_guard) = self.in_flight.try_claim(id.as_str()) else {
            return Ok(Outcome::Busy);
        };
        self.place_bungee(&id).await
    }

    async fn place_bungee(&self, id: &BungeeId) -> Result<Outcome> {
        let store = self.store.as_ref();
        let Some(mut bungee) = store.bungee(id).await? else {
            return Ok(Outcome::Rejected(Rejection::UnknownInstance));
        };
        if bungee.is_started() {
            return Ok(Outcome::AlreadyProvisioned);
        }
        let (Some(node_id), Some(public_address)) = (bungee.node.clone(), bungee.public_address.clone()) else {
            return Ok(Outcome::Rejected(Rejection::SlotNotDeclared));
        };
        let Some(network) = store.network(&bungee.network).await? else {
            return Ok(Outcome::Rejected(Rejection::UnknownNetwork));
        };
        let Some(bungee_type) = store.bungee_type(&bungee.bungee_type).await? else {
            return Ok(Outcome::Rejected(Rejection::UnknownType));
        };
        if !network.declares_slot(&bungee_type.id, &node_id, &public_address) {
            return Ok(Outcome::Rejected(Rejection::SlotNotDeclared));
        }
        let Some(node) = store.node(&node_id).await? else {
            return Ok(Outcome::Rejected(Rejection::UnknownNode));
        };

        let now = Utc::now();
        let occupied = store
            .bungees(&BungeeFilter::network(&network.id).at_slot(&node_id, &public_address))
            .await?
            .iter()
            .any(|b| b.id != bungee.id && b.is_started() && !self.settings.liveness.is_expired(b.updated_at, now));
        if occupied {
            error!(
                "Tried to create multiple bungees at {} on node {} for network {}",
                public_address, node.name, network.name
            );
            return Ok(Outcome::Rejected(Rejection::SlotOccupied));
        }

        let name = bungee_container_name(&bungee_type, &public_address);
        let capacity = node_capacity(store, node.clone(), self.settings.liveness, now, Some(bungee.id.as_str())).await?;
        if !capacity.can_fit_bungee(&bungee_type) {
            warn!(
                "Cannot fit bungee {} for network {} on node {}",
                name, network.name, node.name
            );
            return Ok(Outcome::Rejected(Rejection::NoCapacity));
        }

        let spec = ContainerSpec {
            image: bungee_type
                .image
                .clone()
                .unwrap_or_else(|| self.settings.bungee_image.clone()),
            name: name.clone(),
            env: self.settings.env.render("bungee_id", bungee.id.as_str()),
            ports: vec![PortMapping {
                container_port: self.settings.bungee_port,
                host_ip: public_address.clone(),
                host_port: self.settings.bungee_port,
            }],
            binds: vec![self.settings.data_bind()],
            publish_all_ports: true,
        };

        let minted_at = bungee.updated_at;
        bungee.updated_at = Utc::now() + self.settings.start_grace;
        store.save_bungee(&bungee).await?;

        info!("Creating bungee {} for network {} on node {}", name, network.name, node.name);
        match self.launch(&node, &spec).await {
            Ok(container_id) => {
                bungee.container_id = Some(container_id.clone());
                bungee.updated_at = Utc::now() + self.settings.start_grace;
                if let Err(e) = store.save_bungee(&bungee).await {
                    self.discard(&node, &container_id, &name, &network.id, &e).await;
                    return Err(e.into());
                }
                Ok(Outcome::Provisioned {
                    node: node.id,
                    container_id,
                })
            }
            Err(e) => {
                bungee.updated_at = minted_at;
                if let Err(reset) = store.save_bungee(&bungee).await {
                    error!("Failed to reset bungee {} after a failed launch: {}", name, reset);
                }
                self.reporter.report(&FailureReport {
                    instance: name,
                    network: network.id.clone(),
                    node: Some(node.id.clone()),
                    error: e.to_string(),
                });
                Ok(Outcome::Rejected(Rejection::Exhausted {
                    node: Some(node.id),
                }))
            }
        }
    }

    /// Removes a container whose record could not be saved after launch,
    /// so no running container is left without a record.
    async fn discard(&self, node: &Node, container_id: &str, name: &str, network: &NetworkId, cause: &StoreError) {
        error!(
            "Failed to record container {} of {} on node {}, removing it: {}",
            container_id, name, node.name, cause
        );
        if let Err(e) = self.lifecycle.remove_container(node, container_id).await {
            error!("Failed to remove orphaned container {} on node {}: {}", container_id, node.name, e);
        }
        self.reporter.report(&FailureReport {
            instance: name.to_string(),
            network: network.clone(),
            node: Some(node.id.clone()),
            error: cause.to_string(),
        });
    }

    /// Runs remove-stale, create and start on one node as a unit.
    ///
    /// A failed start is retried as a whole unit up to `start_retries`
    /// extra times; a failed create or cleanup is returned at once.  On a
    /// final start failure the stuck container is removed best-effort.
    async fn launch(&self, node: &Node, spec: &ContainerSpec) -> std::result::Result<String, LaunchError> {
        let mut start_failures = 0;
        loop {
            self.lifecycle
                .remove_existing(node, &spec.name)
                .await
                .map_err(LaunchError::Cleanup)?;

            match self.lifecycle.create_and_start(node, spec).await {
                Ok(container_id) => return Ok(container_id),
                Err(LaunchError::Start { source, .. }) if start_failures < self.settings.start_retries => {
                    start_failures += 1;
                    warn!(
                        "Container {} failed to start on node {} ({}), retrying {}/{}",
                        spec.name, node.name, source, start_failures, self.settings.start_retries
                    );
                }
                Err(e @ LaunchError::Start { .. }) => {
                    if let Err(cleanup) = self.lifecycle.remove_existing(node, &spec.name).await {
                        warn!(
                            "Failed to roll back container {} on node {}: {}",
                            spec.name, node.name, cleanup
                        );
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Consumes both creation topics until stopped.
pub struct Worker {
    provisioner: Arc<Provisioner>,
    channel: Arc<dyn IntentChannel>,
    concurrency: usize,
}

impl Worker {
    pub fn new(provisioner: Arc<Provisioner>, channel: Arc<dyn IntentChannel>, concurrency: usize) -> Self {
        Self {
            provisioner,
            channel,
            concurrency,
        }
    }

    /// Pulls deliveries until `stop` flips, then closes the subscriptions
    /// and waits for the attempts already running.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut servers = self.channel.subscribe(SERVER_TOPIC).await?;
        let mut bungees = self.channel.subscribe(BUNGEE_TOPIC).await?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut attempts = JoinSet::new();

        info!("Provisioning worker listening on {} and {}", SERVER_TOPIC, BUNGEE_TOPIC);
        loop {
            if *stop.borrow() {
                break;
            }
            let delivery = tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                Some(delivery) = servers.recv() => delivery,
                Some(delivery) = bungees.recv() => delivery,
                else => break,
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                delivery.nack(true);
                break;
            };
            let provisioner = Arc::clone(&self.provisioner);
            attempts.spawn(async move {
                provisioner.dispatch(delivery).await;
                drop(permit);
            });

            while let Some(finished) = attempts.try_join_next() {
                if let Err(e) = finished {
                    error!("Provisioning task panicked: {}", e);
                }
            }
        }

        drop(servers);
        drop(bungees);
        info!(
            "Provisioning worker stopped accepting intents, waiting for {} attempts",
            attempts.len()
        );
        while let Some(finished) = attempts.join_next().await {
            if let Err(e) = finished {
                error!("Provisioning task panicked: {}", e);
            }
        }
        Ok(())
    }
}
