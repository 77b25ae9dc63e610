//! The gossip membership actor.
//!
//! One task owns the UDP socket and the member table. Every probe
//! interval it sends its full view to a few random alive peers;
//! receiving any packet merges the carried view and refreshes the
//! sender's liveness. A peer silent past the suspicion window is marked
//! failed. `leave` broadcasts a goodbye so peers mark the node left
//! rather than failed.
//!
//! Per-member incarnation numbers (set by the owning node at startup)
//! order conflicting states: higher incarnation wins, and at equal
//! incarnation a departure (left/failed) overrides alive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryError, DiscoveryResult};

/// The tag under which a node advertises its RPC address.
pub const RPC_ADDR_TAG: &str = "rpc_addr";

/// Largest gossip datagram we will parse.
const DATAGRAM_BYTES_MAX: usize = 64 * 1024;

/// How many random peers receive each gossip round.
const GOSSIP_FANOUT: usize = 3;

/// Probe intervals a peer may miss before it is suspected failed.
const SUSPICION_MULTIPLIER: u32 = 5;

/// Receives membership change events.
///
/// Callbacks are invoked from spawned tasks so a slow handler never
/// stalls the gossip loop.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// A peer appeared; `addr` is the peer's advertised RPC address.
    async fn join(&self, name: &str, addr: &str);

    /// A peer left or failed.
    async fn leave(&self, name: &str);
}

/// Membership configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// This node's unique name.
    pub node_name: String,
    /// UDP address the gossip listens on.
    pub bind_addr: SocketAddr,
    /// Tags published to peers; must include [`RPC_ADDR_TAG`].
    pub tags: HashMap<String, String>,
    /// Gossip addresses contacted once at startup.
    pub start_join_addrs: Vec<String>,
    /// Interval between gossip rounds.
    pub probe_interval: Duration,
}

impl DiscoveryConfig {
    /// Creates a configuration with the default probe interval.
    #[must_use]
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            tags: HashMap::new(),
            start_join_addrs: Vec::new(),
            probe_interval: Duration::from_millis(500),
        }
    }

    /// Adds a published tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the addresses gossiped to at startup.
    #[must_use]
    pub fn with_start_join_addrs(mut self, addrs: Vec<String>) -> Self {
        self.start_join_addrs = addrs;
        self
    }
}

/// A member's liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Responding to gossip.
    Alive,
    /// Said goodbye gracefully.
    Left,
    /// Went silent past the suspicion window.
    Failed,
}

/// One member of the cluster, the local node included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's unique name.
    pub name: String,
    /// The member's gossip address.
    pub addr: String,
    /// Published tags, notably the RPC address.
    pub tags: HashMap<String, String>,
    /// Current liveness.
    pub status: MemberStatus,
    /// Startup-assigned ordering for conflicting states.
    pub incarnation: u64,
}

impl Member {
    /// The member's advertised RPC address, when published.
    #[must_use]
    pub fn rpc_addr(&self) -> Option<&str> {
        self.tags.get(RPC_ADDR_TAG).map(String::as_str)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
enum Packet {
    /// Full-state exchange; any packet doubles as a liveness signal.
    Sync { members: Vec<Member> },
    /// Graceful departure.
    Goodbye { name: String, incarnation: u64 },
}

enum Command {
    Members(oneshot::Sender<Vec<Member>>),
    Leave(oneshot::Sender<()>),
}

/// Handle to the membership actor.
pub struct Membership {
    commands: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

impl Membership {
    /// Binds the gossip socket, starts the actor, and contacts the
    /// configured join addresses.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn start(
        handler: Arc<dyn Handler>,
        config: DiscoveryConfig,
    ) -> DiscoveryResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|e| DiscoveryError::io("gossip bind", e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| DiscoveryError::io("gossip local addr", e))?;

        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        let local = Member {
            name: config.node_name.clone(),
            addr: local_addr.to_string(),
            tags: config.tags.clone(),
            status: MemberStatus::Alive,
            incarnation,
        };

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let actor = Actor {
            socket: Arc::new(socket),
            local_name: config.node_name.clone(),
            members: HashMap::from([(config.node_name.clone(), local)]),
            last_heard: HashMap::new(),
            handler,
            probe_interval: config.probe_interval,
        };
        tokio::spawn(actor.run(commands_rx, config.start_join_addrs));

        info!(name = %config.node_name, addr = %local_addr, "membership started");
        Ok(Self {
            commands: commands_tx,
            local_addr,
        })
    }

    /// The gossip socket's bound address.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A snapshot of the member table, local node included.
    ///
    /// # Errors
    /// Returns [`DiscoveryError::Closed`] after [`Membership::leave`].
    pub async fn members(&self) -> DiscoveryResult<Vec<Member>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Members(tx))
            .await
            .map_err(|_| DiscoveryError::Closed)?;
        rx.await.map_err(|_| DiscoveryError::Closed)
    }

    /// Broadcasts a graceful goodbye and stops gossiping. Idempotent.
    ///
    /// # Errors
    /// Currently infallible; kept fallible for parity with the other
    /// lifecycle calls.
    pub async fn leave(&self) -> DiscoveryResult<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).await.is_err() {
            return Ok(()); // already gone
        }
        let _ = rx.await;
        Ok(())
    }
}

struct Actor {
    socket: Arc<UdpSocket>,
    local_name: String,
    members: HashMap<String, Member>,
    last_heard: HashMap<String, Instant>,
    handler: Arc<dyn Handler>,
    probe_interval: Duration,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, join_addrs: Vec<String>) {
        // Announce ourselves to the seed nodes.
        for addr in join_addrs {
            self.send_sync(&addr).await;
        }

        let mut probe = interval(self.probe_interval);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut buf = vec![0u8; DATAGRAM_BYTES_MAX];

        loop {
            tokio::select! {
                Some(command) = commands.recv() => match command {
                    Command::Members(reply) => {
                        let _ = reply.send(self.members.values().cloned().collect());
                    }
                    Command::Leave(reply) => {
                        self.broadcast_goodbye().await;
                        let _ = reply.send(());
                        return;
                    }
                },
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, from)) => self.handle_packet(&buf[..n], from),
                        Err(e) => warn!(error = %e, "gossip receive failed"),
                    }
                }
                _ = probe.tick() => {
                    self.detect_failures();
                    self.gossip_round().await;
                }
            }
        }
    }

    fn handle_packet(&mut self, data: &[u8], from: SocketAddr) {
        let packet: Packet = match serde_json::from_slice(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(from = %from, error = %e, "undecodable gossip datagram");
                return;
            }
        };

        match packet {
            Packet::Sync { members } => {
                for member in members {
                    self.merge(member);
                }
            }
            Packet::Goodbye { name, incarnation } => {
                if let Some(member) = self.members.get_mut(&name) {
                    if member.status == MemberStatus::Alive && member.incarnation <= incarnation {
                        member.status = MemberStatus::Left;
                        self.fire_leave(&name);
                    }
                }
            }
        }
    }

    /// Merges one remote view of a member into the local table.
    fn merge(&mut self, incoming: Member) {
        if incoming.name == self.local_name {
            return;
        }

        match self.members.get_mut(&incoming.name) {
            None => {
                let name = incoming.name.clone();
                let alive = incoming.status == MemberStatus::Alive;
                let rpc_addr = incoming.rpc_addr().map(str::to_string);
                self.members.insert(name.clone(), incoming);
                self.last_heard.insert(name.clone(), Instant::now());
                if alive {
                    debug!(name = %name, "member joined");
                    if let Some(addr) = rpc_addr {
                        self.fire_join(&name, &addr);
                    }
                }
            }
            Some(current) => {
                let newer = incoming.incarnation > current.incarnation;
                let departed_now = incoming.incarnation == current.incarnation
                    && current.status == MemberStatus::Alive
                    && incoming.status != MemberStatus::Alive;

                if newer {
                    let was_alive = current.status == MemberStatus::Alive;
                    let now_alive = incoming.status == MemberStatus::Alive;
                    let rpc_addr = incoming.rpc_addr().map(str::to_string);
                    *current = incoming;
                    let name = current.name.clone();
                    self.last_heard.insert(name.clone(), Instant::now());
                    if now_alive && !was_alive {
                        if let Some(addr) = rpc_addr {
                            self.fire_join(&name, &addr);
                        }
                    } else if was_alive && !now_alive {
                        self.fire_leave(&name);
                    }
                } else if departed_now {
                    current.status = incoming.status;
                    let name = current.name.clone();
                    self.fire_leave(&name);
                } else if incoming.incarnation == current.incarnation
                    && current.status == MemberStatus::Alive
                {
                    self.last_heard.insert(current.name.clone(), Instant::now());
                }
            }
        }
    }

    fn detect_failures(&mut self) {
        let suspicion = self.probe_interval * SUSPICION_MULTIPLIER;
        let mut failed = Vec::new();
        for member in self.members.values_mut() {
            if member.name == self.local_name || member.status != MemberStatus::Alive {
                continue;
            }
            let silent = self
                .last_heard
                .get(&member.name)
                .map_or(true, |heard| heard.elapsed() > suspicion);
            if silent {
                member.status = MemberStatus::Failed;
                failed.push(member.name.clone());
            }
        }
        for name in failed {
            warn!(name = %name, "member failed");
            self.fire_leave(&name);
        }
    }

    async fn gossip_round(&mut self) {
        let mut peers: Vec<String> = self
            .members
            .values()
            .filter(|m| m.name != self.local_name && m.status == MemberStatus::Alive)
            .map(|m| m.addr.clone())
            .collect();
        peers.shuffle(&mut rand::thread_rng());

        for addr in peers.into_iter().take(GOSSIP_FANOUT) {
            self.send_sync(&addr).await;
        }
    }

    async fn send_sync(&self, addr: &str) {
        let packet = Packet::Sync {
            members: self.members.values().cloned().collect(),
        };
        self.send_packet(&packet, addr).await;
    }

    async fn broadcast_goodbye(&mut self) {
        let incarnation = self
            .members
            .get(&self.local_name)
            .map_or(0, |m| m.incarnation);
        if let Some(local) = self.members.get_mut(&self.local_name) {
            local.status = MemberStatus::Left;
        }

        let packet = Packet::Goodbye {
            name: self.local_name.clone(),
            incarnation,
        };
        let peers: Vec<String> = self
            .members
            .values()
            .filter(|m| m.name != self.local_name && m.status == MemberStatus::Alive)
            .map(|m| m.addr.clone())
            .collect();
        for addr in peers {
            self.send_packet(&packet, addr.as_str()).await;
        }
        info!(name = %self.local_name, "left the cluster");
    }

    async fn send_packet(&self, packet: &Packet, addr: &str) {
        let data = serde_json::to_vec(packet).expect("gossip packet serializes");
        if let Err(e) = self.socket.send_to(&data, addr).await {
            debug!(addr = %addr, error = %e, "gossip send failed");
        }
    }

    fn fire_join(&self, name: &str, rpc_addr: &str) {
        let handler = Arc::clone(&self.handler);
        let name = name.to_string();
        let rpc_addr = rpc_addr.to_string();
        tokio::spawn(async move {
            handler.join(&name, &rpc_addr).await;
        });
    }

    fn fire_leave(&self, name: &str) {
        let handler = Arc::clone(&self.handler);
        let name = name.to_string();
        tokio::spawn(async move {
            handler.leave(&name).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct RecordingHandler {
        joins: Mutex<Vec<(String, String)>>,
        leaves: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn join(&self, name: &str, addr: &str) {
            self.joins
                .lock()
                .unwrap()
                .push((name.to_string(), addr.to_string()));
        }

        async fn leave(&self, name: &str) {
            self.leaves.lock().unwrap().push(name.to_string());
        }
    }

    async fn start_member(
        name: &str,
        handler: Arc<RecordingHandler>,
        join_addrs: Vec<String>,
    ) -> Membership {
        let config = DiscoveryConfig::new(name, "127.0.0.1:0".parse().unwrap())
            .with_tag(RPC_ADDR_TAG, format!("10.0.0.1:{name}"))
            .with_start_join_addrs(join_addrs);
        Membership::start(handler, config).await.unwrap()
    }

    async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
        let result = timeout(Duration::from_secs(3), async {
            loop {
                if check() {
                    return;
                }
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        assert!(result.is_ok(), "timed out waiting for: {what}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_members_join_then_one_leaves() {
        let handler = Arc::new(RecordingHandler::default());

        let first = start_member("0", Arc::clone(&handler), vec![]).await;
        let seed = vec![first.bind_addr().to_string()];
        let second = start_member("1", Arc::new(RecordingHandler::default()), seed.clone()).await;
        let third = start_member("2", Arc::new(RecordingHandler::default()), seed).await;

        // Scenario: within the window the seed sees the whole cluster and
        // its handler observed two joins and no leaves.
        eventually("full membership", || {
            let joins = handler.joins.lock().unwrap().len();
            let leaves = handler.leaves.lock().unwrap().len();
            joins == 2 && leaves == 0
        })
        .await;
        eventually("member table", || member_count(&first) == 3).await;

        third.leave().await.unwrap();

        eventually("goodbye observed", || {
            let leaves = handler.leaves.lock().unwrap();
            leaves.as_slice() == ["2"]
        })
        .await;
        eventually("status left", || {
            let members = block_members(&first);
            members
                .iter()
                .any(|m| m.name == "2" && m.status == MemberStatus::Left)
        })
        .await;

        // The join events carried the advertised RPC address.
        let joins = handler.joins.lock().unwrap();
        assert!(joins.iter().all(|(_, addr)| addr.starts_with("10.0.0.1:")));
        drop(joins);

        first.leave().await.unwrap();
        second.leave().await.unwrap();
    }

    // Test-only synchronous bridges into the async members() call.
    fn member_count(membership: &Membership) -> usize {
        block_members(membership).len()
    }

    fn block_members(membership: &Membership) -> Vec<Member> {
        let handle = tokio::runtime::Handle::current();
        tokio::task::block_in_place(|| handle.block_on(membership.members())).unwrap()
    }
}
