use anyhow::Result;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use super::types::{GossipMessage, MembershipEvent, Node, NodeId, NodeStatus};
use crate::config::HeartbeatConfig;
use crate::error::{ClusterError, ClusterResult};

/// Window during which a node that was suspected is treated as a poor
/// snapshot source.
const RECENT_FAILURE_WINDOW: Duration = Duration::from_secs(300);

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    seeds: Vec<SocketAddr>,
    removed: DashMap<NodeId, ()>,
    suspected_at: DashMap<NodeId, Instant>,
    events: broadcast::Sender<MembershipEvent>,
    config: HeartbeatConfig,
}

impl MembershipService {
    /// Binds the gossip socket on the replication address and registers the
    /// local node. The seed list is contacted once the service is started.
    pub async fn new(
        node_id: NodeId,
        client_addr: SocketAddr,
        replication_bind: SocketAddr,
        seeds: Vec<SocketAddr>,
        config: HeartbeatConfig,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(replication_bind).await?;
        let replication_addr = socket.local_addr()?;

        let local_node = Node {
            id: node_id,
            client_addr,
            replication_addr,
            status: NodeStatus::Alive,
            incarnation: 1,
            last_heartbeat: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let seeds = seeds
            .into_iter()
            .filter(|seed| *seed != replication_addr)
            .collect();

        let (events, _) = broadcast::channel(256);

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            seeds,
            removed: DashMap::new(),
            suspected_at: DashMap::new(),
            events,
            config,
        }))
    }

    pub fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting membership service on {} ({} seed(s))",
            self.local_node.replication_addr,
            self.seeds.len()
        );

        let heartbeat_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.heartbeat_loop().await;
            })
        };

        let receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        vec![heartbeat_handle, receive_handle, failure_detection_handle]
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_node.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Restores removal tombstones recovered from the write-ahead log.
    pub fn preload_removed(&self, ids: impl IntoIterator<Item = NodeId>) {
        for id in ids {
            if id == self.local_node.id {
                continue;
            }
            self.removed.insert(id.clone(), ());
            if let Some(mut member) = self.members.get_mut(&id) {
                member.status = NodeStatus::Removed;
            }
        }
    }

    /// Sends a join request to a peer's replication address.
    pub async fn join(&self, peer: SocketAddr) -> Result<()> {
        let msg = GossipMessage::Join {
            node: self.current_local(),
        };
        let encoded = bincode::serialize(&msg)?;
        self.socket.send_to(&encoded, peer).await?;
        tracing::debug!("Sent join request to {}", peer);
        Ok(())
    }

    pub fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.members.get(id).map(|entry| entry.value().clone())
    }

    pub fn find_by_address(&self, addr: &str) -> Option<Node> {
        self.members
            .iter()
            .find(|entry| entry.value().has_address(addr))
            .map(|entry| entry.value().clone())
    }

    /// All known members sorted by id, removed ones included.
    pub fn members(&self) -> Vec<Node> {
        let mut members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    /// Alive members including the local node, sorted by id.
    pub fn list_alive(&self) -> Vec<Node> {
        let mut alive: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| entry.value().clone())
            .collect();
        alive.sort_by(|a, b| a.id.cmp(&b.id));
        alive
    }

    /// Alive and suspected members; suspicion alone never costs a node its
    /// place in the topology.
    pub fn list_active(&self) -> Vec<Node> {
        let mut active: Vec<Node> = self
            .members
            .iter()
            .filter(|entry| !entry.value().is_removed())
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    pub fn is_alive(&self, id: &NodeId) -> bool {
        self.members
            .get(id)
            .map(|member| member.is_alive())
            .unwrap_or(false)
    }

    pub fn is_removed(&self, id: &NodeId) -> bool {
        self.removed.contains_key(id)
    }

    pub fn recently_suspected(&self, id: &NodeId) -> bool {
        self.suspected_at
            .get(id)
            .map(|at| at.elapsed() < RECENT_FAILURE_WINDOW)
            .unwrap_or(false)
    }

    /// Marks a peer as suspected. Returns `true` on an Alive -> Suspected
    /// transition.
    pub fn mark_suspected(&self, id: &NodeId) -> bool {
        if id == &self.local_node.id {
            return false;
        }

        let transitioned = match self.members.get_mut(id) {
            Some(mut member) if member.status == NodeStatus::Alive => {
                member.status = NodeStatus::Suspected;
                true
            }
            _ => false,
        };

        if transitioned {
            tracing::warn!("Node {} suspected", id);
            self.suspected_at.insert(id.clone(), Instant::now());
            self.publish(MembershipEvent::Suspected(id.clone()));
        }

        transitioned
    }

    /// Administrative removal. Idempotent: removing an already removed node
    /// returns `Ok(false)`.
    pub async fn remove(&self, id: &NodeId) -> ClusterResult<bool> {
        if id == &self.local_node.id {
            return Err(ClusterError::InvalidRequest(
                "a node cannot remove itself".to_string(),
            ));
        }
        if self.is_removed(id) {
            return Ok(false);
        }
        if !self.members.contains_key(id) {
            return Err(ClusterError::UnknownNode(id.to_string()));
        }

        let newly_removed = self.mark_removed(id);
        if newly_removed {
            self.broadcast_message(GossipMessage::Removed {
                node_id: id.clone(),
            })
            .await;
        }

        Ok(newly_removed)
    }

    /// Applies a removal learned from a peer or from the local admin call.
    pub fn mark_removed(&self, id: &NodeId) -> bool {
        if id == &self.local_node.id {
            tracing::warn!("Peers report this node as removed; ignoring");
            return false;
        }
        if self.removed.insert(id.clone(), ()).is_some() {
            return false;
        }
        if let Some(mut member) = self.members.get_mut(id) {
            member.status = NodeStatus::Removed;
        }

        info!("Node {} removed from cluster", id);
        self.publish(MembershipEvent::Removed(id.clone()));
        true
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscriber simply means nothing is listening yet.
        let _ = self.events.send(event);
    }

    fn current_local(&self) -> Node {
        let mut node = self.local_node.clone();
        node.incarnation = self.incarnation.load(Ordering::SeqCst);
        node
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            interval.tick().await;

            let msg = GossipMessage::Heartbeat {
                from: self.current_local(),
            };
            let encoded = match bincode::serialize(&msg) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::error!("Failed to serialize heartbeat: {}", e);
                    continue;
                }
            };

            let targets: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id && !entry.value().is_removed()
                })
                .map(|entry| entry.value().clone())
                .collect();

            for target in &targets {
                if let Err(e) = self.socket.send_to(&encoded, target.replication_addr).await {
                    tracing::debug!("Failed to send heartbeat to {}: {}", target.id, e);
                }
            }

            for seed in &self.seeds {
                let known = self
                    .members
                    .iter()
                    .any(|entry| entry.value().replication_addr == *seed);
                if !known && let Err(e) = self.join(*seed).await {
                    tracing::debug!("Join via seed {} failed: {}", seed, e);
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling gossip from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize gossip from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::debug!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Heartbeat { from } => {
                self.handle_heartbeat(from, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
            }

            GossipMessage::Join { node } => {
                self.handle_heartbeat(node, src).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }

            GossipMessage::Removed { node_id } => {
                self.mark_removed(&node_id);
            }
        }

        Ok(())
    }

    /// Direct contact from a peer: the strongest liveness evidence there is.
    async fn handle_heartbeat(&self, from: Node, src: SocketAddr) -> Result<()> {
        if from.id == self.local_node.id {
            return Ok(());
        }
        if self.is_removed(&from.id) {
            tracing::debug!("Ignoring heartbeat from removed node {}", from.id);
            return Ok(());
        }

        let mut event = None;
        match self.members.get_mut(&from.id) {
            Some(mut member) => {
                member.last_heartbeat = Some(Instant::now());
                member.client_addr = from.client_addr;
                member.replication_addr = from.replication_addr;
                member.incarnation = member.incarnation.max(from.incarnation);
                if member.status == NodeStatus::Suspected {
                    member.status = NodeStatus::Alive;
                    event = Some(MembershipEvent::Recovered(from.id.clone()));
                }
            }
            None => {
                tracing::info!(
                    "Discovered member {} (client={}, replication={})",
                    from.id,
                    from.client_addr,
                    from.replication_addr
                );
                let mut node = from.clone();
                node.status = NodeStatus::Alive;
                node.last_heartbeat = Some(Instant::now());
                self.members.insert(node.id.clone(), node);
                event = Some(MembershipEvent::Joined(from.id.clone()));
            }
        }

        if let Some(event) = event {
            if let MembershipEvent::Recovered(id) = &event {
                tracing::info!("Node {} is alive again", id);
            }
            self.publish(event);
        }

        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            members: self.members(),
        };
        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        Ok(())
    }

    fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_heartbeat = Some(Instant::now());
            member.incarnation = member.incarnation.max(from_incarnation);
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, incoming: Node) {
        if incoming.id == self.local_node.id {
            return;
        }
        if incoming.status == NodeStatus::Removed {
            self.mark_removed(&incoming.id);
            return;
        }
        if self.is_removed(&incoming.id) {
            return;
        }

        let mut event = None;
        match self.members.get_mut(&incoming.id) {
            Some(mut existing) => {
                if incoming.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {}: inc {} -> {}",
                        incoming.id,
                        existing.incarnation,
                        incoming.incarnation
                    );
                    if existing.status == NodeStatus::Suspected
                        && incoming.status == NodeStatus::Alive
                    {
                        existing.last_heartbeat = Some(Instant::now());
                        event = Some(MembershipEvent::Recovered(incoming.id.clone()));
                    }
                    existing.status = incoming.status;
                    existing.incarnation = incoming.incarnation;
                }
            }
            None => {
                tracing::info!(
                    "Discovered member {} via gossip at {}",
                    incoming.id,
                    incoming.replication_addr
                );
                let mut node = incoming.clone();
                node.last_heartbeat = Some(Instant::now());
                let alive = node.is_alive();
                self.members.insert(node.id.clone(), node);
                if alive {
                    event = Some(MembershipEvent::Joined(incoming.id.clone()));
                }
            }
        }

        if let Some(event) = event {
            self.publish(event);
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            let current = self.incarnation.load(Ordering::SeqCst);
            if incarnation >= current {
                let refuted = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!("Refuting suspicion with incarnation {}", refuted);
                if let Some(mut me) = self.members.get_mut(&node_id) {
                    me.incarnation = refuted;
                }
                self.broadcast_message(GossipMessage::Alive {
                    node_id,
                    incarnation: refuted,
                })
                .await;
            }
            return;
        }

        let suspected = self
            .members
            .get(&node_id)
            .map(|member| member.is_alive() && incarnation >= member.incarnation)
            .unwrap_or(false);
        if suspected {
            self.mark_suspected(&node_id);
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let mut recovered = false;
        if let Some(mut existing) = self.members.get_mut(&node_id) {
            if existing.is_removed() {
                return;
            }
            if incarnation > existing.incarnation
                || (incarnation == existing.incarnation
                    && existing.status == NodeStatus::Suspected)
            {
                recovered = existing.status == NodeStatus::Suspected;
                existing.status = NodeStatus::Alive;
                existing.incarnation = incarnation;
                existing.last_heartbeat = Some(Instant::now());
            }
        } else {
            tracing::debug!("Alive message for unknown node {}", node_id);
        }

        if recovered {
            tracing::info!("Node {} refuted suspicion (inc={})", node_id, incarnation);
            self.publish(MembershipEvent::Recovered(node_id));
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut newly_suspected = Vec::new();
            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();
                if member.id == self.local_node.id || member.status != NodeStatus::Alive {
                    continue;
                }

                match member.last_heartbeat {
                    Some(last) if now.duration_since(last) > self.config.suspect_timeout => {
                        tracing::warn!(
                            "Node {} suspected (no contact for {:?})",
                            member.id,
                            now.duration_since(last)
                        );
                        member.status = NodeStatus::Suspected;
                        newly_suspected.push((member.id.clone(), member.incarnation));
                    }
                    Some(_) => {}
                    None => member.last_heartbeat = Some(now),
                }
            }

            for (node_id, incarnation) in newly_suspected {
                self.suspected_at.insert(node_id.clone(), now);
                self.publish(MembershipEvent::Suspected(node_id.clone()));
                self.broadcast_message(GossipMessage::Suspect {
                    node_id,
                    incarnation,
                })
                .await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let encoded = match bincode::serialize(&msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize gossip message: {}", e);
                return;
            }
        };

        let targets: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| entry.value().id != self.local_node.id && !entry.value().is_removed())
            .map(|entry| entry.value().replication_addr)
            .collect();

        for addr in targets {
            if let Err(e) = self.socket.send_to(&encoded, addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", addr, e);
            }
        }
    }
}
