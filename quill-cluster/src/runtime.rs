//! The raft runtime actor.
//!
//! One task owns the [`RaftNode`] and everything it needs: storage, the
//! state machine, and the transport. A single `tokio::select!` loop
//! multiplexes commands from the [`RaftHandle`], inbound peer messages,
//! and the tick timer, executing the node's outputs in order after each
//! step. Persistence outputs always precede the messages that depend on
//! them, so executing in order is sufficient for correctness.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quill_core::{LogIndex, ServerId};
use quill_raft::{
    Configuration, EntryKind, HardState, InstallSnapshotRequest, LogStore, Message, RaftLog,
    RaftNode, RaftOptions, RaftOutput, Server, SnapshotMeta, SnapshotStore, StableStore,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::fsm::StateMachine;
use crate::storage::SegmentedLogStore;
use crate::transport::Transport;

/// Parameters for spawning the runtime.
pub(crate) struct RuntimeConfig {
    pub local_id: ServerId,
    pub advertise_addr: String,
    pub bootstrap: bool,
    pub tick_interval: Duration,
    pub election_ticks: u32,
    pub snapshot_threshold: u64,
}

/// Commands the handle can issue.
enum Command {
    Propose {
        data: Bytes,
        reply: oneshot::Sender<ClusterResult<Bytes>>,
    },
    AddServer {
        id: ServerId,
        addr: String,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    RemoveServer {
        id: ServerId,
        reply: oneshot::Sender<ClusterResult<()>>,
    },
    Inspect {
        reply: oneshot::Sender<ClusterStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A point-in-time view of the cluster, for `GetServers` and leader
/// checks.
#[derive(Debug, Clone)]
pub(crate) struct ClusterStatus {
    pub leader_id: Option<ServerId>,
    pub is_leader: bool,
    pub servers: Vec<quill_api::Server>,
}

/// Replies parked until their entry commits.
enum Pending {
    Apply(oneshot::Sender<ClusterResult<Bytes>>),
    Config(oneshot::Sender<ClusterResult<()>>),
}

impl Pending {
    fn fail(self, err: ClusterError) {
        match self {
            Self::Apply(tx) => {
                let _ = tx.send(Err(err));
            }
            Self::Config(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// Handle for talking to the runtime actor.
#[derive(Clone)]
pub(crate) struct RaftHandle {
    commands: mpsc::Sender<Command>,
    leader_rx: watch::Receiver<Option<ServerId>>,
}

impl RaftHandle {
    /// Proposes a command and waits for its apply result.
    pub(crate) async fn propose(&self, data: Bytes, timeout: Duration) -> ClusterResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Propose { data, reply: tx })
            .await
            .map_err(|_| ClusterError::Closed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::Closed),
            Err(_) => Err(ClusterError::Unavailable),
        }
    }

    pub(crate) async fn add_server(
        &self,
        id: ServerId,
        addr: String,
        timeout: Duration,
    ) -> ClusterResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::AddServer {
                id,
                addr,
                reply: tx,
            })
            .await
            .map_err(|_| ClusterError::Closed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::Closed),
            Err(_) => Err(ClusterError::Unavailable),
        }
    }

    pub(crate) async fn remove_server(
        &self,
        id: ServerId,
        timeout: Duration,
    ) -> ClusterResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::RemoveServer { id, reply: tx })
            .await
            .map_err(|_| ClusterError::Closed)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::Closed),
            Err(_) => Err(ClusterError::Unavailable),
        }
    }

    pub(crate) async fn inspect(&self) -> ClusterResult<ClusterStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Inspect { reply: tx })
            .await
            .map_err(|_| ClusterError::Closed)?;
        rx.await.map_err(|_| ClusterError::Closed)
    }

    /// Blocks until some node is leader, or the timeout fires.
    pub(crate) async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<ServerId> {
        let mut rx = self.leader_rx.clone();
        let wait = async {
            loop {
                if let Some(leader) = rx.borrow_and_update().clone() {
                    return leader;
                }
                if rx.changed().await.is_err() {
                    // Runtime gone; pend forever and let the timeout fire.
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClusterError::Unavailable)
    }

    pub(crate) async fn shutdown(&self) -> ClusterResult<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { reply: tx })
            .await
            .is_err()
        {
            return Ok(()); // already gone
        }
        let _ = rx.await;
        Ok(())
    }
}

/// The actor state.
struct Runtime {
    node: RaftNode,
    fsm: Arc<dyn StateMachine>,
    log_store: Arc<SegmentedLogStore>,
    stable: Arc<dyn StableStore>,
    snapshots: Arc<dyn SnapshotStore>,
    transport: Arc<Transport>,
    pending: HashMap<LogIndex, Pending>,
    /// Peer addresses observed on inbound frames; lets a node reply
    /// before the configuration naming the peer has reached it.
    learned_addrs: HashMap<ServerId, String>,
    applied_since_snapshot: u64,
    snapshot_threshold: u64,
    leader_tx: watch::Sender<Option<ServerId>>,
}

/// Recovers persisted state and spawns the runtime actor.
///
/// Recovery order matters: the state machine is restored from the latest
/// snapshot (or reset when there is none) so that re-applying the raft
/// log's committed suffix reproduces exactly the pre-crash state.
pub(crate) fn spawn(
    config: &RuntimeConfig,
    fsm: Arc<dyn StateMachine>,
    log_store: Arc<SegmentedLogStore>,
    stable: Arc<dyn StableStore>,
    snapshots: Arc<dyn SnapshotStore>,
    transport: Arc<Transport>,
    incoming: mpsc::Receiver<(String, Message)>,
) -> ClusterResult<RaftHandle> {
    // 1. Bring the state machine to the snapshot point.
    let snapshot = snapshots.latest()?;
    let (snap_index, snap_term, snap_config) = match snapshot {
        Some((meta, mut reader)) => {
            fsm.restore(&mut reader)?;
            (meta.last_index, meta.last_term, Some(meta.configuration))
        }
        None => {
            fsm.restore(&mut std::io::empty())?;
            (LogIndex::new(0), quill_core::Term::new(0), None)
        }
    };

    // 2. Recover the raft log window and hard state.
    let hard_state = stable.load()?.unwrap_or_default();
    let mut entries = log_store.entries_from(snap_index.next())?;

    // 3. The latest configuration in the log wins; fall back to the
    //    snapshot's, then to an empty one (a node waiting to be joined).
    let mut configuration = entries
        .iter()
        .rev()
        .find(|e| e.kind == EntryKind::Configuration)
        .and_then(|e| Configuration::decode(&e.data))
        .or(snap_config)
        .unwrap_or_default();

    // 4. Bootstrap a single-voter cluster on first start.
    if config.bootstrap && configuration.servers.is_empty() && log_store.is_empty()? {
        let single = Configuration::single(config.local_id.clone(), config.advertise_addr.clone());
        let entry = quill_raft::Entry::new(
            quill_core::Term::new(1),
            LogIndex::new(1),
            EntryKind::Configuration,
            single.encode(),
        );
        log_store.append(std::slice::from_ref(&entry))?;
        entries.push(entry);
        configuration = single;
        info!(id = %config.local_id, "bootstrapped single-voter cluster");
    }

    let node = RaftNode::new(
        RaftOptions::new(config.local_id.clone()).with_election_ticks(config.election_ticks),
        hard_state,
        RaftLog::recovered(snap_index, snap_term, entries),
        configuration,
    );

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (leader_tx, leader_rx) = watch::channel(None);

    let runtime = Runtime {
        node,
        fsm,
        log_store,
        stable,
        snapshots,
        transport,
        pending: HashMap::new(),
        learned_addrs: HashMap::new(),
        applied_since_snapshot: 0,
        snapshot_threshold: config.snapshot_threshold,
        leader_tx,
    };
    tokio::spawn(runtime.run(cmd_rx, incoming, config.tick_interval));

    Ok(RaftHandle {
        commands: cmd_tx,
        leader_rx,
    })
}

impl Runtime {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut incoming: mpsc::Receiver<(String, Message)>,
        tick_interval: Duration,
    ) {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(command) = commands.recv() => {
                    if self.handle_command(command) {
                        return;
                    }
                }
                Some((from_addr, message)) = incoming.recv() => {
                    self.learned_addrs.insert(message.from().clone(), from_addr);
                    let outputs = self.node.handle_message(message);
                    self.execute(outputs);
                }
                _ = ticker.tick() => {
                    let outputs = self.node.tick();
                    self.execute(outputs);
                }
            }
            self.publish_leader();
        }
    }

    /// Returns true when the runtime should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Propose { data, reply } => {
                if !self.node.is_leader() {
                    let _ = reply.send(Err(self.not_leader()));
                    return false;
                }
                match self.node.propose(EntryKind::Command, data) {
                    Some((index, outputs)) => {
                        self.pending.insert(index, Pending::Apply(reply));
                        self.execute(outputs);
                    }
                    None => {
                        let _ = reply.send(Err(self.not_leader()));
                    }
                }
            }
            Command::AddServer { id, addr, reply } => {
                if !self.node.is_leader() {
                    let _ = reply.send(Err(self.not_leader()));
                    return false;
                }
                // Idempotent: already a voter at this address.
                if self.node.configuration().addr_of(&id) == Some(addr.as_str()) {
                    let _ = reply.send(Ok(()));
                    return false;
                }
                let mut grown = self.node.configuration().clone();
                grown.servers.retain(|s| s.id != id);
                grown.servers.push(Server {
                    id: id.clone(),
                    addr,
                });
                info!(id = %id, "adding voter");
                self.propose_configuration(grown, reply);
            }
            Command::RemoveServer { id, reply } => {
                if !self.node.is_leader() {
                    let _ = reply.send(Err(self.not_leader()));
                    return false;
                }
                if !self.node.configuration().contains(&id) {
                    let _ = reply.send(Ok(()));
                    return false;
                }
                let mut shrunk = self.node.configuration().clone();
                shrunk.servers.retain(|s| s.id != id);
                info!(id = %id, "removing server");
                self.propose_configuration(shrunk, reply);
            }
            Command::Inspect { reply } => {
                let leader_id = self.node.leader_id().cloned();
                let servers = self
                    .node
                    .configuration()
                    .servers
                    .iter()
                    .map(|s| quill_api::Server {
                        id: s.id.as_str().to_string(),
                        rpc_addr: s.addr.clone(),
                        is_leader: Some(&s.id) == leader_id.as_ref(),
                    })
                    .collect();
                let _ = reply.send(ClusterStatus {
                    is_leader: self.node.is_leader(),
                    leader_id,
                    servers,
                });
            }
            Command::Shutdown { reply } => {
                info!("raft runtime shutting down");
                for (_, pending) in self.pending.drain() {
                    pending.fail(ClusterError::Closed);
                }
                self.transport.close();
                if let Err(e) = self.log_store.close() {
                    warn!(error = %e, "raft log close failed");
                }
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn propose_configuration(
        &mut self,
        configuration: Configuration,
        reply: oneshot::Sender<ClusterResult<()>>,
    ) {
        match self.node.propose_configuration(&configuration) {
            Some((index, outputs)) => {
                self.pending.insert(index, Pending::Config(reply));
                self.execute(outputs);
            }
            None => {
                let _ = reply.send(Err(self.not_leader()));
            }
        }
    }

    fn not_leader(&self) -> ClusterError {
        let hint = self
            .node
            .leader_id()
            .and_then(|id| self.node.configuration().addr_of(id))
            .map(str::to_string);
        ClusterError::NotLeader { leader_hint: hint }
    }

    fn execute(&mut self, outputs: Vec<RaftOutput>) {
        for output in outputs {
            match output {
                RaftOutput::PersistHardState(hs) => self.persist_hard_state(&hs),
                RaftOutput::PersistEntries(entries) => {
                    if let Err(e) = self.log_store.append(&entries) {
                        error!(error = %e, "failed to persist raft entries");
                    }
                }
                RaftOutput::TruncateLog { from } => {
                    if let Err(e) = self.log_store.truncate_suffix(from) {
                        error!(error = %e, "failed to truncate raft log");
                    }
                }
                RaftOutput::SendMessage(message) => self.send(message),
                RaftOutput::CommitEntry(entry) => self.apply_committed(&entry),
                RaftOutput::SendSnapshot { to } => self.send_snapshot(&to),
                RaftOutput::ApplySnapshot(request) => self.install_snapshot(request),
                RaftOutput::BecameLeader => {
                    info!(term = self.node.term().get(), "became cluster leader");
                }
                RaftOutput::SteppedDown => {
                    info!("stepped down from leadership");
                    let hint = self.not_leader();
                    for (_, pending) in self.pending.drain() {
                        pending.fail(match &hint {
                            ClusterError::NotLeader { leader_hint } => ClusterError::NotLeader {
                                leader_hint: leader_hint.clone(),
                            },
                            _ => ClusterError::Unavailable,
                        });
                    }
                }
            }
        }
    }

    fn persist_hard_state(&self, hs: &HardState) {
        if let Err(e) = self.stable.save(hs) {
            error!(error = %e, "failed to persist hard state");
        }
    }

    fn send(&self, message: Message) {
        let to = message.to().clone();
        let addr = self
            .node
            .configuration()
            .addr_of(&to)
            .or_else(|| self.learned_addrs.get(&to).map(String::as_str));
        match addr {
            Some(addr) => self.transport.send(addr, message),
            None => debug!(to = %to, "no address for peer, dropping message"),
        }
    }

    fn apply_committed(&mut self, entry: &quill_raft::Entry) {
        let result = match entry.kind {
            EntryKind::Command => Some(self.fsm.apply(entry.term.get(), &entry.data)),
            EntryKind::Configuration | EntryKind::Noop => None,
        };

        match self.pending.remove(&entry.index) {
            Some(Pending::Apply(tx)) => {
                let _ = tx.send(result.unwrap_or_else(|| Ok(Bytes::new())));
            }
            Some(Pending::Config(tx)) => {
                let _ = tx.send(Ok(()));
            }
            None => {
                if let Some(Err(e)) = result {
                    // A follower apply failure is unrecoverable drift.
                    error!(index = entry.index.get(), error = %e, "state machine apply failed");
                }
            }
        }

        self.applied_since_snapshot += 1;
        if self.applied_since_snapshot >= self.snapshot_threshold {
            self.take_snapshot();
        }
    }

    fn take_snapshot(&mut self) {
        let last_index = self.node.last_applied();
        let Some(last_term) = self.node.log().term_at(last_index) else {
            return;
        };
        let meta = SnapshotMeta {
            last_index,
            last_term,
            configuration: self.node.configuration().clone(),
        };

        let snapshot = match self.fsm.snapshot() {
            Ok(reader) => reader,
            Err(e) => {
                error!(error = %e, "state machine snapshot failed");
                return;
            }
        };
        let mut reader = snapshot;
        if let Err(e) = self.snapshots.create(&meta, &mut reader) {
            error!(error = %e, "failed to persist snapshot");
            return;
        }
        if let Err(e) = self.log_store.truncate_prefix(last_index) {
            warn!(error = %e, "failed to compact raft log");
        }
        self.node.compacted(last_index);
        self.applied_since_snapshot = 0;
        info!(last_index = last_index.get(), "snapshot taken, raft log compacted");
    }

    fn send_snapshot(&self, to: &ServerId) {
        let latest = match self.snapshots.latest() {
            Ok(Some(latest)) => latest,
            Ok(None) => {
                debug!(to = %to, "no snapshot to ship");
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to open snapshot for shipping");
                return;
            }
        };
        let (meta, mut reader) = latest;
        let mut data = Vec::new();
        if let Err(e) = reader.read_to_end(&mut data) {
            error!(error = %e, "failed to read snapshot for shipping");
            return;
        }

        debug!(to = %to, last_index = meta.last_index.get(), "shipping snapshot");
        self.send(Message::InstallSnapshot(InstallSnapshotRequest {
            term: self.node.term(),
            leader_id: self.node.id().clone(),
            to: to.clone(),
            last_index: meta.last_index,
            last_term: meta.last_term,
            configuration: meta.configuration.encode(),
            data: Bytes::from(data),
        }));
    }

    fn install_snapshot(&mut self, request: InstallSnapshotRequest) {
        let Some(configuration) = Configuration::decode(&request.configuration) else {
            warn!("dropping snapshot with undecodable configuration");
            return;
        };

        let mut cursor = std::io::Cursor::new(&request.data[..]);
        if let Err(e) = self.fsm.restore(&mut cursor) {
            error!(error = %e, "state machine restore failed");
            return;
        }

        let meta = SnapshotMeta {
            last_index: request.last_index,
            last_term: request.last_term,
            configuration: configuration.clone(),
        };
        let mut cursor = std::io::Cursor::new(&request.data[..]);
        if let Err(e) = self.snapshots.create(&meta, &mut cursor) {
            error!(error = %e, "failed to persist installed snapshot");
        }
        if let Err(e) = self.log_store.reset(request.last_index.next()) {
            error!(error = %e, "failed to reset raft log after install");
        }

        info!(
            last_index = request.last_index.get(),
            "installed snapshot from leader"
        );
        self.applied_since_snapshot = 0;

        let leader = request.leader_id.clone();
        let outputs = self.node.snapshot_installed(
            request.last_index,
            request.last_term,
            configuration,
            &leader,
        );
        self.execute(outputs);
    }

    fn publish_leader(&self) {
        let leader = self.node.leader_id().cloned();
        self.leader_tx.send_if_modified(|current| {
            if *current == leader {
                false
            } else {
                *current = leader;
                true
            }
        });
    }
}
