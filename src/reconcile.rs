//! Reconciliation loop.
//!
//! Every sweep walks each network through five steps in order:
//!
//! 1. reap exited containers on the network's member nodes,
//! 2. collect dead or superseded bungee records,
//! 3. mint a bungee for every declared proxy slot left empty,
//! 4. collect dead or superseded server records,
//! 5. mint servers up to the declared amount of every auto-start type.
//!
//! Filling is level-triggered: a slot or deficit is re-emitted on every
//! sweep until a record for it exists.  Failures are contained to the node,
//! instance or network they concern.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::channel::IntentChannel;
use crate::error::Result;
use crate::intent::{BungeeCreate, Intent, ServerCreate};
use crate::lifecycle::{bungee_container_name, server_container_name, Lifecycle};
use crate::store::{mint_bungee, mint_server, BungeeFilter, ServerFilter, StateStore};
use crate::types::{Bungee, Liveness, Network, NodeId, Server, ServerTypeId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub networks_swept: usize,
    pub networks_failed: usize,
    pub containers_reaped: usize,
    pub instances_expired: usize,
    pub intents_emitted: usize,
}

impl SweepStats {
    fn is_idle(&self) -> bool {
        self.networks_failed == 0
            && self.containers_reaped == 0
            && self.instances_expired == 0
            && self.intents_emitted == 0
    }
}

pub struct Reconciler {
    store: Arc<dyn StateStore>,
    lifecycle: Lifecycle,
    channel: Arc<dyn IntentChannel>,
    liveness: Liveness,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn StateStore>,
        lifecycle: Lifecycle,
        channel: Arc<dyn IntentChannel>,
        liveness: Liveness,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            lifecycle,
            channel,
            liveness,
            interval,
        }
    }

    /// Sweeps every `interval` until `stop` flips, then tells the
    /// provisioning worker to stop through `worker_stop`.
    pub async fn run(&self, mut stop: watch::Receiver<bool>, worker_stop: watch::Sender<bool>) {
        info!("Starting reconciliation loop, sweeping every {}s", self.interval.as_secs());
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.sweep(&stop).await;
                    if stats.is_idle() {
                        debug!("Sweep complete: {:?}", stats);
                    } else {
                        info!("Sweep complete: {:?}", stats);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }

        info!("Stopping reconciliation loop");
        if worker_stop.send(true).is_err() {
            debug!("Provisioning worker already gone");
        }
    }

    /// Runs one sweep over every network.  `stop` is only consulted
    /// between networks, never partway through one.
    pub async fn sweep(&self, stop: &watch::Receiver<bool>) -> SweepStats {
        let mut stats = SweepStats::default();
        let networks = match self.store.networks().await {
            Ok(networks) => networks,
            Err(e) => {
                error!("Failed to list networks: {}", e);
                return stats;
            }
        };

        for network in networks {
            if *stop.borrow() {
                info!("Stop requested, ending sweep before network {}", network.name);
                break;
            }
            match self.sweep_network(&network, &mut stats).await {
                Ok(()) => stats.networks_swept += 1,
                Err(e) => {
                    error!("Failed to reconcile network {}: {}", network.name, e);
                    stats.networks_failed += 1;
                }
            }
        }
        stats
    }

    async fn sweep_network(&self, network: &Network, stats: &mut SweepStats) -> Result<()> {
        debug!("Reconciling network {}", network.name);
        self.reap_dead_containers(network, stats).await;

        let now = Utc::now();
        self.collect_bungees(network, now, stats).await?;
        self.fill_bungees(network, stats).await?;
        self.collect_servers(network, now, stats).await?;
        self.fill_servers(network, stats).await?;
        Ok(())
    }

    async fn reap_dead_containers(&self, network: &Network, stats: &mut SweepStats) {
        let mut nodes = Vec::with_capacity(network.nodes.len());
        for member in &network.nodes {
            match self.store.node(&member.node).await {
                Ok(Some(node)) => nodes.push(node),
                Ok(None) => {}
                Err(e) => warn!("Failed to load node {}: {}", member.node, e),
            }
        }

        for node in &nodes {
            match self.lifecycle.reap_exited(node).await {
                Ok(reaped) => stats.containers_reaped += reaped,
                Err(e) => debug!("Skipping dead container sweep on node {}: {}", node.name, e),
            }
        }
    }

    async fn collect_bungees(&self, network: &Network, now: DateTime<Utc>, stats: &mut SweepStats) -> Result<()> {
        let bungees = self.store.bungees(&BungeeFilter::network(&network.id)).await?;

        let mut slots: BTreeMap<(NodeId, String), Vec<Bungee>> = BTreeMap::new();
        for bungee in bungees {
            match (&bungee.node, &bungee.public_address) {
                (Some(node), Some(address)) => slots
                    .entry((node.clone(), address.clone()))
                    .or_default()
                    .push(bungee),
                // Without both a node and an address the record is invalid.
                _ => {
                    info!("Removing incomplete bungee record {} in network {}", bungee.id, network.name);
                    self.retire_bungee(&bungee, true).await;
                    stats.instances_expired += 1;
                }
            }
        }

        // Records sharing a slot share the container name, so a superseded
        // record gives up only its row; the container belongs to the winner.
        for (_, records) in slots {
            for (bungee, superseded) in freshest_first(records, |b| b.updated_at) {
                if superseded {
                    info!("Removing superseded bungee {} in network {}", bungee.id, network.name);
                } else if self.liveness.is_expired(bungee.updated_at, now) {
                    info!(
                        "Removing timed out bungee {} at {} in network {}",
                        bungee.id,
                        bungee.public_address.as_deref().unwrap_or_default(),
                        network.name
                    );
                } else {
                    continue;
                }
                self.retire_bungee(&bungee, !superseded).await;
                stats.instances_expired += 1;
            }
        }
        Ok(())
    }

    /// Removes a bungee's container (best-effort, when `with_container`)
    /// and then its record.
    async fn retire_bungee(&self, bungee: &Bungee, with_container: bool) {
        if let (true, Some(node_id), Some(address)) = (with_container, &bungee.node, &bungee.public_address) {
            if let Err(e) = self.remove_bungee_container(node_id, bungee, address).await {
                error!("Failed to remove container of bungee {}: {}", bungee.id, e);
            }
        }
        if let Err(e) = self.store.remove_bungee(&bungee.id).await {
            error!("Failed to remove bungee record {}: {}", bungee.id, e);
        }
    }

    async fn remove_bungee_container(&self, node_id: &NodeId, bungee: &Bungee, address: &str) -> Result<()> {
        let (Some(node), Some(bungee_type)) = (
            self.store.node(node_id).await?,
            self.store.bungee_type(&bungee.bungee_type).await?,
        ) else {
            warn!("Cannot name the container of bungee {}, leaving it to the dead container sweep", bungee.id);
            return Ok(());
        };
        self.lifecycle
            .remove_existing(&node, &bungee_container_name(&bungee_type, address))
            .await?;
        Ok(())
    }

    async fn fill_bungees(&self, network: &Network, stats: &mut SweepStats) -> Result<()> {
        for slot in network.bungee_slots() {
            let Some(node) = self.store.node(slot.node).await? else {
                warn!("Network {} declares a bungee on unknown node {}", network.name, slot.node);
                continue;
            };
            if !node.has_public_address(slot.public_address) {
                warn!(
                    "Network {} declares address {} which node {} does not have",
                    network.name, slot.public_address, node.name
                );
                continue;
            }

            let occupants = self
                .store
                .bungees(&BungeeFilter::network(&network.id).at_slot(slot.node, slot.public_address))
                .await?;
            if !occupants.is_empty() {
                continue;
            }

            let bungee = mint_bungee(
                self.store.as_ref(),
                &network.id,
                slot.bungee_type,
                slot.node,
                slot.public_address,
                Utc::now(),
            )
            .await?;
            let intent = Intent::BungeeCreate(BungeeCreate::ById { bungee: bungee.id });
            self.emit(&intent, stats).await;
        }
        Ok(())
    }

    async fn collect_servers(&self, network: &Network, now: DateTime<Utc>, stats: &mut SweepStats) -> Result<()> {
        let servers = self.store.servers(&ServerFilter::network(&network.id)).await?;

        let mut ordinals: BTreeMap<(ServerTypeId, u32), Vec<Server>> = BTreeMap::new();
        for server in servers {
            ordinals
                .entry((server.server_type.clone(), server.number))
                .or_default()
                .push(server);
        }

        let mut type_names = HashMap::new();
        for ((server_type, number), records) in ordinals {
            if !type_names.contains_key(&server_type) {
                let name = self.store.server_type(&server_type).await?.map(|t| t.name);
                type_names.insert(server_type.clone(), name);
            }
            let type_name = type_names[&server_type].clone();

            let ranked = freshest_first(records, |s| s.updated_at);
            let winner_node = ranked.first().and_then(|(s, _)| s.node.clone());
            for (server, superseded) in ranked {
                // Same node and ordinal means the same container as the winner.
                let shares_container = superseded && server.node.is_some() && server.node == winner_node;
                if type_name.is_none() {
                    info!("Removing server {} of unknown type {} in network {}", server.id, server_type, network.name);
                } else if superseded {
                    info!("Removing superseded server {} in network {}", server.id, network.name);
                } else if self.liveness.is_expired(server.updated_at, now) {
                    info!("Removing timed out server {}.{} in network {}", server_type, number, network.name);
                } else {
                    continue;
                }
                self.retire_server(&server, !shares_container).await;
                stats.instances_expired += 1;
            }
        }
        Ok(())
    }

    async fn retire_server(&self, server: &Server, with_container: bool) {
        if let (true, Some(node_id)) = (with_container, &server.node) {
            if let Err(e) = self.remove_server_container(node_id, server).await {
                error!("Failed to remove container of server {}: {}", server.id, e);
            }
        }
        if let Err(e) = self.store.remove_server(&server.id).await {
            error!("Failed to remove server record {}: {}", server.id, e);
        }
    }

    async fn remove_server_container(&self, node_id: &NodeId, server: &Server) -> Result<()> {
        let (Some(node), Some(server_type)) = (
            self.store.node(node_id).await?,
            self.store.server_type(&server.server_type).await?,
        ) else {
            warn!("Cannot name the container of server {}, leaving it to the dead container sweep", server.id);
            return Ok(());
        };
        self.lifecycle
            .remove_existing(&node, &server_container_name(&server_type, server.number))
            .await?;
        Ok(())
    }

    async fn fill_servers(&self, network: &Network, stats: &mut SweepStats) -> Result<()> {
        for declared in network.server_types.iter().filter(|t| !t.manual_start) {
            if self.store.server_type(&declared.server_type).await?.is_none() {
                warn!("Network {} declares unknown server type {}", network.name, declared.server_type);
                continue;
            }

            let running = self
                .store
                .servers(&ServerFilter::network(&network.id).with_type(&declared.server_type))
                .await?
                .len();
            let missing = (declared.amount as usize).saturating_sub(running);
            if missing > 0 {
                debug!(
                    "Network {} runs {} of {} {} servers",
                    network.name, running, declared.amount, declared.server_type
                );
            }

            for _ in 0..missing {
                let server = mint_server(self.store.as_ref(), &network.id, &declared.server_type, Utc::now()).await?;
                debug!("Minted server {}.{} as {}", declared.server_type, server.number, server.id);
                let intent = Intent::ServerCreate(ServerCreate::ById { server: server.id });
                self.emit(&intent, stats).await;
            }
        }
        Ok(())
    }

    async fn emit(&self, intent: &Intent, stats: &mut SweepStats) {
        let published = match intent.to_payload() {
            Ok(payload) => self.channel.publish(intent.topic(), payload).await,
            Err(e) => Err(e),
        };
        match published {
            Ok(()) => stats.intents_emitted += 1,
            Err(e) => error!("Failed to publish intent to {}: {}", intent, e),
        }
    }
}

/// Orders records sharing one key by heartbeat, freshest first, and flags
/// every record but the first as superseded.
fn freshest_first<T>(mut records: Vec<T>, updated_at: impl Fn(&T) -> DateTime<Utc>) -> Vec<(T, bool)> {
    records.sort_by_key(|r| std::cmp::Reverse(updated_at(r)));
    records
        .into_iter()
        .enumerate()
        .map(|(i, r)| (r, i > 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalChannel, Subscription};
    use crate::intent::{BUNGEE_TOPIC, SERVER_TOPIC};
    use crate::runtime::mock::{Call, MockConnector};
    use crate::store::{MemoryStore, Topology};
    use crate::types::{BungeeType, NetworkNode, NetworkServerType, Node, ServerType};
    use chrono::Duration as TimeDelta;

    const GB: u64 = 1024;

    fn node(id: &str, address: &str) -> Node {
        Node {
            id: id.into(),
            name: id.to_string(),
            private_address: format!("10.0.1.{}", id.len()),
            public_addresses: vec![address.to_string()],
            ram_mb: 4 * GB,
        }
    }

    fn topology() -> Topology {
        Topology {
            nodes: vec![node("x", "203.0.113.1"), node("y", "203.0.113.2")],
            server_types: vec![
                ServerType {
                    id: "a".into(),
                    name: "a".into(),
                    ram_mb: GB,
                    image: None,
                },
                ServerType {
                    id: "event".into(),
                    name: "event".into(),
                    ram_mb: GB,
                    image: None,
                },
            ],
            bungee_types: vec![BungeeType {
                id: "proxy".into(),
                name: "proxy".into(),
                ram_mb: GB / 2,
                image: None,
            }],
            networks: vec![Network {
                id: "n".into(),
                name: "n".into(),
                nodes: vec![
                    NetworkNode {
                        node: "x".into(),
                        bungee_type: Some("proxy".into()),
                        public_address: Some("203.0.113.1".into()),
                    },
                    NetworkNode {
                        node: "y".into(),
                        bungee_type: None,
                        public_address: None,
                    },
                ],
                server_types: vec![
                    NetworkServerType {
                        server_type: "a".into(),
                        amount: 3,
                        manual_start: false,
                    },
                    NetworkServerType {
                        server_type: "event".into(),
                        amount: 2,
                        manual_start: true,
                    },
                ],
            }],
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        connector: MockConnector,
        reconciler: Reconciler,
        servers: Subscription,
        bungees: Subscription,
    }

    async fn harness(topology: Topology) -> Harness {
        let store = Arc::new(MemoryStore::from_topology(topology));
        let connector = MockConnector::new();
        let channel = Arc::new(LocalChannel::new(std::time::Duration::ZERO));
        let servers = channel.subscribe(SERVER_TOPIC).await.unwrap();
        let bungees = channel.subscribe(BUNGEE_TOPIC).await.unwrap();
        let reconciler = Reconciler::new(
            store.clone(),
            Lifecycle::new(Arc::new(connector.clone())),
            channel,
            Liveness::from_secs(60),
            std::time::Duration::from_secs(30),
        );
        Harness {
            store,
            connector,
            reconciler,
            servers,
            bungees,
        }
    }

    fn drain(sub: &mut Subscription) -> Vec<Intent> {
        let mut intents = Vec::new();
        while let Ok(delivery) = sub.try_recv() {
            intents.push(Intent::decode(delivery.topic(), delivery.payload()).unwrap());
            delivery.ack();
        }
        intents
    }

    async fn sweep(h: &Harness) -> SweepStats {
        let (_tx, rx) = watch::channel(false);
        h.reconciler.sweep(&rx).await
    }

    #[tokio::test]
    async fn fills_the_declared_amount_with_distinct_ordinals() {
        let mut h = harness(topology()).await;
        let stats = sweep(&h).await;
        assert_eq!(stats.networks_swept, 1);

        let intents = drain(&mut h.servers);
        assert_eq!(intents.len(), 3);
        let mut numbers = Vec::new();
        for intent in intents {
            let Intent::ServerCreate(ServerCreate::ById { server }) = intent else {
                panic!("unexpected intent {:?}", intent);
            };
            let record = h.store.server(&server).await.unwrap().unwrap();
            assert_eq!(record.server_type.to_string(), "a");
            assert!(!record.is_bound());
            numbers.push(record.number);
        }
        numbers.sort();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn pending_records_count_against_the_amount() {
        let mut h = harness(topology()).await;
        sweep(&h).await;
        assert_eq!(drain(&mut h.servers).len(), 3);

        sweep(&h).await;
        assert!(drain(&mut h.servers).is_empty());
    }

    #[tokio::test]
    async fn manual_start_types_are_never_filled() {
        let mut h = harness(topology()).await;
        sweep(&h).await;
        drain(&mut h.servers);
        let event = h
            .store
            .servers(&ServerFilter::network(&"n".into()).with_type(&"event".into()))
            .await
            .unwrap();
        assert!(event.is_empty());
    }

    #[tokio::test]
    async fn expired_server_is_removed_with_its_container_and_replaced() {
        let mut topology = topology();
        topology.networks[0].server_types[0].amount = 1;
        let mut h = harness(topology).await;

        let mut dead = Server::pending("n".into(), "a".into(), 1, Utc::now() - TimeDelta::seconds(61));
        dead.node = Some("x".into());
        dead.container_id = Some("c-dead".into());
        h.store.insert_server(&dead).await.unwrap();
        h.connector.seed_container("x", "a.1", "Up 2 hours");

        let stats = sweep(&h).await;
        assert_eq!(stats.instances_expired, 1);
        assert!(h.store.server(&dead.id).await.unwrap().is_none());
        assert!(h.connector.containers("x").is_empty());

        let intents = drain(&mut h.servers);
        assert_eq!(intents.len(), 1);
        let Intent::ServerCreate(ServerCreate::ById { server }) = &intents[0] else {
            panic!("unexpected intent {:?}", intents[0]);
        };
        assert_eq!(h.store.server(server).await.unwrap().unwrap().number, 1);
    }

    #[tokio::test]
    async fn live_servers_are_left_alone() {
        let mut topology = topology();
        topology.networks[0].server_types[0].amount = 1;
        let mut h = harness(topology).await;

        let mut live = Server::pending("n".into(), "a".into(), 1, Utc::now() + TimeDelta::minutes(5));
        live.node = Some("x".into());
        live.container_id = Some("c-live".into());
        h.store.insert_server(&live).await.unwrap();

        let stats = sweep(&h).await;
        assert_eq!(stats.instances_expired, 0);
        assert!(h.store.server(&live.id).await.unwrap().is_some());
        assert!(drain(&mut h.servers).is_empty());
    }

    #[tokio::test]
    async fn superseded_duplicates_are_collected() {
        let mut topology = topology();
        topology.networks[0].server_types[0].amount = 1;
        let h = harness(topology).await;

        let fresh = Server::pending("n".into(), "a".into(), 1, Utc::now());
        let stale = Server::pending("n".into(), "a".into(), 1, Utc::now() - TimeDelta::seconds(10));
        h.store.insert_server(&fresh).await.unwrap();
        h.store.insert_server(&stale).await.unwrap();

        sweep(&h).await;
        assert!(h.store.server(&fresh.id).await.unwrap().is_some());
        assert!(h.store.server(&stale.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn superseded_server_on_the_winners_node_keeps_the_container() {
        let mut topology = topology();
        topology.networks[0].server_types[0].amount = 2;
        let h = harness(topology).await;

        let mut fresh = Server::pending("n".into(), "a".into(), 1, Utc::now());
        fresh.node = Some("x".into());
        fresh.container_id = Some("c-fresh".into());
        let mut stale = Server::pending("n".into(), "a".into(), 1, Utc::now() - TimeDelta::seconds(10));
        stale.node = Some("x".into());
        stale.container_id = Some("c-stale".into());
        h.store.insert_server(&fresh).await.unwrap();
        h.store.insert_server(&stale).await.unwrap();
        h.connector.seed_container("x", "a.1", "Up 5 minutes");

        // A superseded record on another node owns a container of its own.
        let mut winner = Server::pending("n".into(), "a".into(), 2, Utc::now());
        winner.node = Some("x".into());
        let mut elsewhere = Server::pending("n".into(), "a".into(), 2, Utc::now() - TimeDelta::seconds(10));
        elsewhere.node = Some("y".into());
        h.store.insert_server(&winner).await.unwrap();
        h.store.insert_server(&elsewhere).await.unwrap();
        h.connector.seed_container("y", "a.2", "Up 5 minutes");

        let stats = sweep(&h).await;
        assert_eq!(stats.instances_expired, 2);
        assert!(h.store.server(&fresh.id).await.unwrap().is_some());
        assert!(h.store.server(&stale.id).await.unwrap().is_none());
        assert!(h.store.server(&elsewhere.id).await.unwrap().is_none());

        let on_x = h.connector.containers("x");
        assert_eq!(on_x.len(), 1);
        assert!(on_x[0].has_name("a.1"));
        assert!(h.connector.containers("y").is_empty());
    }

    #[tokio::test]
    async fn superseded_bungee_leaves_the_live_container_running() {
        let mut h = harness(topology()).await;
        let mut live = Bungee::pending(
            "n".into(),
            "proxy".into(),
            "x".into(),
            "203.0.113.1".into(),
            Utc::now(),
        );
        live.container_id = Some("c-live".into());
        let mut stale = Bungee::pending(
            "n".into(),
            "proxy".into(),
            "x".into(),
            "203.0.113.1".into(),
            Utc::now() - TimeDelta::seconds(10),
        );
        stale.container_id = Some("c-stale".into());
        h.store.insert_bungee(&live).await.unwrap();
        h.store.insert_bungee(&stale).await.unwrap();
        h.connector.seed_container("x", "proxy.203.0.113.1", "Up 1 hour");

        sweep(&h).await;
        assert!(h.store.bungee(&live.id).await.unwrap().is_some());
        assert!(h.store.bungee(&stale.id).await.unwrap().is_none());
        let on_x = h.connector.containers("x");
        assert_eq!(on_x.len(), 1);
        assert!(on_x[0].has_name("proxy.203.0.113.1"));
        assert!(drain(&mut h.bungees).is_empty());
    }

    #[tokio::test]
    async fn servers_of_unknown_types_are_collected() {
        let h = harness(topology()).await;
        let orphan = Server::pending("n".into(), "retired".into(), 1, Utc::now());
        h.store.insert_server(&orphan).await.unwrap();

        sweep(&h).await;
        assert!(h.store.server(&orphan.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_proxy_slot_gets_a_bungee() {
        let mut h = harness(topology()).await;
        sweep(&h).await;

        let intents = drain(&mut h.bungees);
        assert_eq!(intents.len(), 1);
        let Intent::BungeeCreate(BungeeCreate::ById { bungee }) = &intents[0] else {
            panic!("unexpected intent {:?}", intents[0]);
        };
        let record = h.store.bungee(bungee).await.unwrap().unwrap();
        assert_eq!(record.node.as_ref().map(NodeId::to_string), Some("x".to_string()));
        assert_eq!(record.public_address.as_deref(), Some("203.0.113.1"));

        // The pending record holds the slot on the next sweep.
        sweep(&h).await;
        assert!(drain(&mut h.bungees).is_empty());
    }

    #[tokio::test]
    async fn expired_and_incomplete_bungees_are_collected() {
        let mut h = harness(topology()).await;
        let mut dead = Bungee::pending(
            "n".into(),
            "proxy".into(),
            "x".into(),
            "203.0.113.1".into(),
            Utc::now() - TimeDelta::seconds(90),
        );
        dead.container_id = Some("c-dead".into());
        h.store.insert_bungee(&dead).await.unwrap();
        h.connector.seed_container("x", "proxy.203.0.113.1", "Up 1 hour");

        let mut incomplete = Bungee::pending(
            "n".into(),
            "proxy".into(),
            "y".into(),
            "203.0.113.2".into(),
            Utc::now(),
        );
        incomplete.public_address = None;
        h.store.insert_bungee(&incomplete).await.unwrap();

        let stats = sweep(&h).await;
        assert_eq!(stats.instances_expired, 2);
        assert!(h.store.bungee(&dead.id).await.unwrap().is_none());
        assert!(h.store.bungee(&incomplete.id).await.unwrap().is_none());
        assert!(h.connector.containers("x").is_empty());
        // The emptied slot is refilled in the same sweep.
        assert_eq!(drain(&mut h.bungees).len(), 1);
    }

    #[tokio::test]
    async fn slots_with_foreign_addresses_are_skipped() {
        let mut topology = topology();
        topology.networks[0].nodes[0].public_address = Some("198.51.100.7".into());
        let mut h = harness(topology).await;

        sweep(&h).await;
        assert!(drain(&mut h.bungees).is_empty());
    }

    #[tokio::test]
    async fn exited_containers_are_reaped_and_unreachable_nodes_skipped() {
        let h = harness(topology()).await;
        h.connector.seed_container("x", "a.9", "Exited (1) 10 minutes ago");
        h.connector.seed_container("x", "a.8", "Up 10 minutes");
        h.connector.unreachable("y");

        let stats = sweep(&h).await;
        assert_eq!(stats.containers_reaped, 1);
        assert_eq!(stats.networks_swept, 1);
        assert_eq!(h.connector.containers("x").len(), 1);
        // Unreachable nodes do not stop the rest of the sweep.
        assert_eq!(stats.intents_emitted, 4);
    }

    #[tokio::test]
    async fn container_removal_failure_still_drops_the_record() {
        let mut h = harness(topology()).await;
        let mut dead = Server::pending("n".into(), "a".into(), 1, Utc::now() - TimeDelta::seconds(61));
        dead.node = Some("y".into());
        h.store.insert_server(&dead).await.unwrap();
        h.connector.unreachable("y");

        sweep(&h).await;
        assert!(h.store.server(&dead.id).await.unwrap().is_none());
        assert_eq!(drain(&mut h.servers).len(), 3);
    }

    #[tokio::test]
    async fn stop_is_honoured_between_networks() {
        let mut topology = topology();
        let mut second = topology.networks[0].clone();
        second.id = "m".into();
        second.name = "m".into();
        topology.networks.push(second);
        let h = harness(topology).await;

        let (tx, rx) = watch::channel(true);
        let stats = h.reconciler.sweep(&rx).await;
        assert_eq!(stats.networks_swept, 0);
        drop(tx);

        let stats = sweep(&h).await;
        assert_eq!(stats.networks_swept, 2);
    }

    #[tokio::test]
    async fn run_stops_the_worker_after_the_stop_signal() {
        let h = harness(topology()).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (worker_tx, mut worker_rx) = watch::channel(false);

        let reconciler = h.reconciler;
        let handle = tokio::spawn(async move { reconciler.run(stop_rx, worker_tx).await });
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(*worker_rx.borrow_and_update());
        assert!(h.connector.calls().iter().all(|c| matches!(c, Call::List(_) | Call::Remove(..))));
    }
}
