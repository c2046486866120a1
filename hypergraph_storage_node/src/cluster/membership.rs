// Cluster membership and liveness tracking
//
// Keeps the local view of the cluster: which peers exist, when each was last
// heard from, and which of them are reachable. Background loops broadcast
// heartbeats and evict peers that went silent.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{ClusterEvent, ClusterEventListener, EventBus};
use crate::config::ClusterConfig;
use crate::error::{Result, StorageNodeError};
use crate::network::{
    DiscoverResponse, GoodbyePayload, HeartbeatPayload, NetworkClient, PeerCommand,
    PeerIntroduction, PeerMessage, PeerResponse,
};
use crate::types::{NodeId, NodeStatus, PeerInfo};

/// Membership timing and bootstrap settings
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub cluster_id: String,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    pub stale_threshold_minutes: u64,
    pub peer_timeout: Duration,
    pub seed_peers: Vec<String>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self::from(&ClusterConfig::default())
    }
}

impl From<&ClusterConfig> for MembershipConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            cluster_id: config.cluster_id.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            cleanup_interval: config.cleanup_interval(),
            stale_threshold_minutes: config.stale_threshold_minutes,
            peer_timeout: config.peer_timeout(),
            seed_peers: config.seed_peers.clone(),
        }
    }
}

/// Snapshot of membership counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembershipStats {
    pub known_peers: usize,
    pub active_peers: usize,
    pub heartbeats_sent: u64,
    pub heartbeat_failures: u64,
    pub failed_sends: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct MembershipCounters {
    heartbeats_sent: AtomicU64,
    heartbeat_failures: AtomicU64,
    failed_sends: AtomicU64,
    evictions: AtomicU64,
}

pub struct ClusterMembership {
    local: RwLock<PeerInfo>,
    config: MembershipConfig,
    peers: RwLock<HashMap<NodeId, PeerInfo>>,
    network: Arc<dyn NetworkClient>,
    events: EventBus,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: MembershipCounters,
}

impl ClusterMembership {
    pub fn new(local: PeerInfo, config: MembershipConfig, network: Arc<dyn NetworkClient>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut local = local;
        local.status = NodeStatus::Initializing;
        Self {
            local: RwLock::new(local),
            config,
            peers: RwLock::new(HashMap::new()),
            network,
            events: EventBus::new(),
            running: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            counters: MembershipCounters::default(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local.read().id.clone()
    }

    pub fn local_info(&self) -> PeerInfo {
        self.local.read().clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.local.read().status
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Introduction other peers store for this node
    pub fn introduction(&self) -> PeerIntroduction {
        let mut intro = PeerIntroduction::from(&*self.local.read());
        intro.cluster_id = self.config.cluster_id.clone();
        intro
    }

    /// Register an observer; observers run in registration order
    pub fn add_event_listener(&self, listener: Arc<dyn ClusterEventListener>) {
        self.events.subscribe(listener);
    }

    /// Deliver an event about `node_id` to every observer
    pub fn emit(&self, event: ClusterEvent, node_id: &NodeId) {
        self.events.emit(event, node_id);
    }

    /// Join the cluster and start the heartbeat and cleanup loops.
    ///
    /// Calling it on a running instance does nothing.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.local.write().status = NodeStatus::Initializing;
        self.shutdown.send_replace(false);

        self.announce_to_seeds().await;

        {
            let mut local = self.local.write();
            local.status = NodeStatus::Active;
            local.last_heartbeat = Utc::now();
        }

        let heartbeat = tokio::spawn(Arc::clone(self).heartbeat_loop(self.shutdown.subscribe()));
        let cleanup = tokio::spawn(Arc::clone(self).cleanup_loop(self.shutdown.subscribe()));
        self.tasks.lock().extend([heartbeat, cleanup]);

        info!(
            "Node {} joined cluster {} with {} known peers",
            self.local_id(),
            self.config.cluster_id,
            self.peer_count()
        );
        Ok(())
    }

    /// Say goodbye to every peer, then stop the background loops.
    ///
    /// Calling it on a stopped instance does nothing.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let goodbye = GoodbyePayload {
            node_id: self.local_id(),
        };
        match PeerMessage::new(PeerCommand::Goodbye, self.local_id(), &goodbye) {
            Ok(message) => {
                let delivered = self.broadcast(message).await;
                debug!("Goodbye delivered to {} peers", delivered);
            }
            Err(e) => warn!("Failed to encode goodbye: {}", e),
        }

        self.local.write().status = NodeStatus::Offline;
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let grace = self.config.heartbeat_interval.max(self.config.cleanup_interval);
        for mut task in tasks {
            if timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        info!("Node {} left cluster {}", self.local_id(), self.config.cluster_id);
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    self.send_heartbeats().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Heartbeat loop stopped");
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can be stale yet
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    self.cleanup();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Cleanup loop stopped");
    }

    /// Validate and store a peer. Returns true when the peer was not known before.
    pub fn register_peer(&self, introduction: PeerIntroduction) -> Result<bool> {
        if introduction.id.trim().is_empty() {
            return Err(StorageNodeError::InvalidPeer("empty node id".into()));
        }
        if introduction.id == self.local_id() {
            return Err(StorageNodeError::InvalidPeer(format!(
                "{} is the local node",
                introduction.id
            )));
        }
        if introduction.host.trim().is_empty() || introduction.port == 0 {
            return Err(StorageNodeError::InvalidPeer(format!(
                "{} has no usable address",
                introduction.id
            )));
        }
        if !introduction.cluster_id.is_empty() && introduction.cluster_id != self.config.cluster_id {
            return Err(StorageNodeError::InvalidPeer(format!(
                "{} belongs to cluster {}",
                introduction.id, introduction.cluster_id
            )));
        }

        let id = introduction.id.clone();
        let is_new = {
            let mut peers = self.peers.write();
            match peers.get_mut(&id) {
                Some(peer) => {
                    peer.host = introduction.host;
                    peer.port = introduction.port;
                    if !introduction.display_name.is_empty() {
                        peer.display_name = introduction.display_name;
                    }
                    peer.status = NodeStatus::Active;
                    peer.last_heartbeat = Utc::now();
                    false
                }
                None => {
                    let mut peer = PeerInfo::new(id.clone(), introduction.host, introduction.port);
                    if !introduction.display_name.is_empty() {
                        peer.display_name = introduction.display_name;
                    }
                    peer.status = NodeStatus::Active;
                    peers.insert(id.clone(), peer);
                    true
                }
            }
        };

        if is_new {
            info!("Peer {} joined", id);
            self.events.emit(ClusterEvent::NodeJoined, &id);
        }
        Ok(is_new)
    }

    /// Record a heartbeat; unknown senders that include their address are registered.
    pub fn on_heartbeat(&self, heartbeat: HeartbeatPayload) -> bool {
        if heartbeat.node_id == self.local_id() {
            return false;
        }

        let known = {
            let mut peers = self.peers.write();
            match peers.get_mut(&heartbeat.node_id) {
                Some(peer) => {
                    peer.last_heartbeat = Utc::now();
                    peer.status = heartbeat.status;
                    true
                }
                None => false,
            }
        };
        if known {
            return true;
        }

        match heartbeat.introduction {
            Some(mut intro) => {
                intro.id = heartbeat.node_id.clone();
                match self.register_peer(intro) {
                    Ok(_) => {
                        if let Some(peer) = self.peers.write().get_mut(&heartbeat.node_id) {
                            peer.status = heartbeat.status;
                        }
                        true
                    }
                    Err(e) => {
                        warn!("Ignoring heartbeat from {}: {}", heartbeat.node_id, e);
                        false
                    }
                }
            }
            None => {
                warn!("Heartbeat from unknown peer {} without an address", heartbeat.node_id);
                false
            }
        }
    }

    /// Forget a peer and emit `NodeLeft` if it was known
    pub fn remove_peer(&self, node_id: &str) -> bool {
        let removed = self.peers.write().remove(node_id).is_some();
        if removed {
            info!("Peer {} left", node_id);
            self.events.emit(ClusterEvent::NodeLeft, &node_id.to_string());
        }
        removed
    }

    /// Evict stale peers now
    pub fn cleanup(&self) -> Vec<NodeId> {
        self.cleanup_at(Utc::now())
    }

    /// Evict every peer whose last heartbeat is older than the threshold at `now`.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let threshold = self.config.stale_threshold_minutes;
        let evicted: Vec<NodeId> = {
            let mut peers = self.peers.write();
            let stale: Vec<NodeId> = peers
                .values()
                .filter(|peer| peer.is_stale(threshold, now))
                .map(|peer| peer.id.clone())
                .collect();
            for id in &stale {
                peers.remove(id);
            }
            stale
        };

        for id in &evicted {
            info!("Evicting stale peer {} (no heartbeat for {} minutes)", id, threshold);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.events.emit(ClusterEvent::NodeLeft, id);
        }
        evicted
    }

    /// Send `message` to `peer`, bounded by the peer timeout
    pub async fn send_to(&self, peer: &PeerInfo, message: PeerMessage) -> Result<PeerResponse> {
        let result = match timeout(self.config.peer_timeout, self.network.send(peer, message)).await {
            Ok(result) => result.and_then(PeerResponse::into_result),
            Err(_) => Err(StorageNodeError::Timeout),
        };
        if let Err(e) = &result {
            self.counters.failed_sends.fetch_add(1, Ordering::Relaxed);
            warn!("Peer {} at {} failed: {}", peer.id, peer.address(), e);
        }
        result
    }

    /// Send `message` to every known peer concurrently and collect the answers
    pub async fn broadcast_with_responses(&self, message: PeerMessage) -> Vec<(PeerInfo, Result<PeerResponse>)> {
        let peers = self.peers();
        let sends = peers.iter().map(|peer| self.send_to(peer, message.clone()));
        let results = join_all(sends).await;
        peers.into_iter().zip(results).collect()
    }

    /// Send `message` to every known peer; returns the number of successful sends.
    pub async fn broadcast(&self, message: PeerMessage) -> usize {
        self.broadcast_with_responses(message)
            .await
            .iter()
            .filter(|(_, result)| result.is_ok())
            .count()
    }

    async fn send_heartbeats(&self) -> usize {
        let heartbeat = HeartbeatPayload {
            node_id: self.local_id(),
            status: self.status(),
            introduction: Some(self.introduction()),
        };
        let message = match PeerMessage::new(PeerCommand::Heartbeat, self.local_id(), &heartbeat) {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to encode heartbeat: {}", e);
                return 0;
            }
        };

        let results = self.broadcast_with_responses(message).await;
        let mut delivered = 0;
        for (peer, result) in results {
            match result {
                Ok(_) => {
                    delivered += 1;
                    self.counters.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.counters.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
                    if let Some(known) = self.peers.write().get_mut(&peer.id) {
                        known.status = NodeStatus::Offline;
                    }
                }
            }
        }
        delivered
    }

    /// Register with every seed peer and learn the peers they know
    async fn announce_to_seeds(&self) {
        for seed in &self.config.seed_peers {
            let Some((host, port)) = parse_address(seed) else {
                warn!("Ignoring malformed seed address {}", seed);
                continue;
            };
            // The seed's id is unknown until it answers
            let placeholder = PeerInfo::new(seed.clone(), host, port);
            if let Err(e) = self.join_via(&placeholder).await {
                warn!("Could not join through seed {}: {}", seed, e);
            }
        }
    }

    /// Register with `peer`, then register every peer it reports
    pub async fn join_via(&self, peer: &PeerInfo) -> Result<()> {
        let register = PeerMessage::new(PeerCommand::Register, self.local_id(), &self.introduction())?;
        let response = self.send_to(peer, register).await?;
        let intro: PeerIntroduction = response.decode_payload()?;
        let seed_id = intro.id.clone();
        self.register_peer(intro)?;

        let Some(seed) = self.peer(&seed_id) else {
            return Ok(());
        };
        let discover = PeerMessage::new(PeerCommand::Discover, self.local_id(), &Value::Null)?;
        let response = self.send_to(&seed, discover).await?;
        let discovered: DiscoverResponse = response.decode_payload()?;
        let local_id = self.local_id();
        for intro in discovered.peers.into_iter().filter(|p| p.id != local_id) {
            if let Err(e) = self.register_peer(intro) {
                debug!("Skipping discovered peer: {}", e);
            }
        }
        Ok(())
    }

    /// Answer membership commands; other commands yield `None`.
    pub fn handle_message(&self, message: &PeerMessage) -> Option<PeerResponse> {
        let local_id = self.local_id();
        let response = match message.command {
            PeerCommand::Register => match message
                .decode_payload::<PeerIntroduction>()
                .and_then(|intro| self.register_peer(intro))
            {
                Ok(_) => PeerResponse::ok(local_id, &self.introduction()),
                Err(e) => PeerResponse::error(local_id, e.to_string()),
            },
            PeerCommand::Discover => {
                let mut peers: Vec<PeerIntroduction> = self.peers().iter().map(PeerIntroduction::from).collect();
                for peer in &mut peers {
                    peer.cluster_id = self.config.cluster_id.clone();
                }
                PeerResponse::ok(local_id, &DiscoverResponse { peers })
            }
            PeerCommand::Heartbeat => match message.decode_payload::<HeartbeatPayload>() {
                Ok(heartbeat) => {
                    self.on_heartbeat(heartbeat);
                    PeerResponse::ack(local_id)
                }
                Err(e) => PeerResponse::error(local_id, e.to_string()),
            },
            PeerCommand::Goodbye => match message.decode_payload::<GoodbyePayload>() {
                Ok(goodbye) => {
                    self.remove_peer(&goodbye.node_id);
                    PeerResponse::ack(local_id)
                }
                Err(e) => PeerResponse::error(local_id, e.to_string()),
            },
            _ => return None,
        };
        Some(response)
    }

    /// Known peers sorted by id
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn peer(&self, node_id: &str) -> Option<PeerInfo> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Local node followed by every known peer
    pub fn cluster_nodes(&self) -> Vec<PeerInfo> {
        let mut nodes = vec![self.local_info()];
        nodes.extend(self.peers());
        nodes
    }

    /// Sorted ids of the local node and every known peer
    pub fn member_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.read().keys().cloned().collect();
        ids.push(self.local_id());
        ids.sort();
        ids
    }

    pub fn stats(&self) -> MembershipStats {
        let peers = self.peers.read();
        MembershipStats {
            known_peers: peers.len(),
            active_peers: peers.values().filter(|p| p.status == NodeStatus::Active).count(),
            heartbeats_sent: self.counters.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_failures: self.counters.heartbeat_failures.load(Ordering::Relaxed),
            failed_sends: self.counters.failed_sends.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Split "host:port"
pub fn parse_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse::<u16>().ok().filter(|p| *p > 0)?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InProcessNetwork;
    use chrono::Duration as ChronoDuration;

    fn membership(id: &str, port: u16, network: Arc<InProcessNetwork>) -> Arc<ClusterMembership> {
        let config = MembershipConfig {
            cluster_id: "t1".into(),
            heartbeat_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(50),
            stale_threshold_minutes: 5,
            peer_timeout: Duration::from_millis(200),
            seed_peers: vec![],
        };
        Arc::new(ClusterMembership::new(PeerInfo::new(id, "127.0.0.1", port), config, network))
    }

    fn intro(id: &str, port: u16) -> PeerIntroduction {
        PeerIntroduction {
            id: id.into(),
            host: "127.0.0.1".into(),
            port,
            display_name: String::new(),
            cluster_id: "t1".into(),
        }
    }

    fn record_events(membership: &ClusterMembership) -> Arc<Mutex<Vec<(ClusterEvent, NodeId)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        membership.add_event_listener(Arc::new(move |event: &ClusterEvent, node: &NodeId| {
            sink.lock().push((event.clone(), node.clone()));
        }));
        seen
    }

    #[test]
    fn test_register_peer_validation() {
        let m = membership("n1", 7001, InProcessNetwork::new());
        let events = record_events(&m);

        assert!(m.register_peer(intro("n2", 7002)).unwrap());
        assert!(!m.register_peer(intro("n2", 7003)).unwrap());
        assert_eq!(m.peer("n2").unwrap().port, 7003);

        assert!(matches!(m.register_peer(intro("n1", 7001)), Err(StorageNodeError::InvalidPeer(_))));
        assert!(matches!(m.register_peer(intro("", 7001)), Err(StorageNodeError::InvalidPeer(_))));
        assert!(matches!(m.register_peer(intro("n3", 0)), Err(StorageNodeError::InvalidPeer(_))));
        let mut foreign = intro("n4", 7004);
        foreign.cluster_id = "other".into();
        assert!(m.register_peer(foreign).is_err());

        assert_eq!(*events.lock(), vec![(ClusterEvent::NodeJoined, "n2".to_string())]);
        assert_eq!(m.member_ids(), vec!["n1".to_string(), "n2".to_string()]);
    }

    #[test]
    fn test_heartbeat_discovers_unknown_peer() {
        let m = membership("n1", 7001, InProcessNetwork::new());
        let events = record_events(&m);

        let known = m.on_heartbeat(HeartbeatPayload {
            node_id: "n2".into(),
            status: NodeStatus::Active,
            introduction: Some(intro("n2", 7002)),
        });
        assert!(known);
        assert_eq!(m.peer("n2").unwrap().status, NodeStatus::Active);
        assert_eq!(events.lock().len(), 1);

        assert!(!m.on_heartbeat(HeartbeatPayload {
            node_id: "n9".into(),
            status: NodeStatus::Active,
            introduction: None,
        }));
        assert!(m.peer("n9").is_none());
    }

    #[test]
    fn test_cleanup_evicts_stale_peer_once() {
        let m = membership("n1", 7001, InProcessNetwork::new());
        m.register_peer(intro("n2", 7002)).unwrap();
        m.register_peer(intro("n3", 7003)).unwrap();
        let events = record_events(&m);

        m.peers.write().get_mut("n2").unwrap().last_heartbeat = Utc::now() - ChronoDuration::minutes(10);

        assert_eq!(m.cleanup(), vec!["n2".to_string()]);
        assert!(m.cleanup().is_empty());
        assert_eq!(*events.lock(), vec![(ClusterEvent::NodeLeft, "n2".to_string())]);
        assert_eq!(m.stats().evictions, 1);
        assert!(m.peer("n3").is_some());

        let later = Utc::now() + ChronoDuration::minutes(6);
        assert_eq!(m.cleanup_at(later), vec!["n3".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_counts_successes_and_skips_failures() {
        let network = InProcessNetwork::new();
        let a = membership("a", 7101, network.clone());
        let b = membership("b", 7102, network.clone());
        let b_handler = handler(&b);
        network.register("127.0.0.1:7102", b_handler.clone());

        a.register_peer(intro("b", 7102)).unwrap();
        a.register_peer(intro("ghost", 7199)).unwrap();

        let message = PeerMessage::new(PeerCommand::Discover, "a", &Value::Null).unwrap();
        assert_eq!(a.broadcast(message).await, 1);
        assert_eq!(a.stats().failed_sends, 1);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle_and_goodbye() {
        let network = InProcessNetwork::new();
        let a = membership("a", 7201, network.clone());
        let b = membership("b", 7202, network.clone());
        let (a_handler, b_handler) = (handler(&a), handler(&b));
        network.register("127.0.0.1:7201", a_handler.clone());
        network.register("127.0.0.1:7202", b_handler.clone());

        assert_eq!(a.status(), NodeStatus::Initializing);
        b.start().await.unwrap();
        a.join_via(&PeerInfo::new("seed", "127.0.0.1", 7202)).await.unwrap();
        a.start().await.unwrap();
        a.start().await.unwrap();
        assert_eq!(a.status(), NodeStatus::Active);
        assert!(b.peer("a").is_some());

        // Heartbeats flow while both run
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(a.stats().heartbeats_sent > 0);

        let left = record_events(&b);
        a.stop().await;
        a.stop().await;
        assert_eq!(a.status(), NodeStatus::Offline);
        assert!(b.peer("a").is_none());
        assert_eq!(*left.lock(), vec![(ClusterEvent::NodeLeft, "a".to_string())]);

        // No heartbeats after stop
        let sent = a.stats().heartbeats_sent;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(a.stats().heartbeats_sent, sent);
        b.stop().await;
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("10.0.0.1:7420"), Some(("10.0.0.1".to_string(), 7420)));
        assert_eq!(parse_address("10.0.0.1"), None);
        assert_eq!(parse_address(":7420"), None);
        assert_eq!(parse_address("host:0"), None);
    }

    struct MembershipHandler(Arc<ClusterMembership>);

    fn handler(membership: &Arc<ClusterMembership>) -> Arc<dyn crate::network::PeerMessageHandler> {
        Arc::new(MembershipHandler(membership.clone()))
    }

    #[async_trait::async_trait]
    impl crate::network::PeerMessageHandler for MembershipHandler {
        async fn handle(&self, message: PeerMessage) -> PeerResponse {
            self.0
                .handle_message(&message)
                .unwrap_or_else(|| PeerResponse::error(self.0.local_id(), "unsupported"))
        }
    }
}
