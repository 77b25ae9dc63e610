//! The replicated log.
//!
//! [`ReplicatedLog`] presents the local log's append/read contract with
//! writes routed through consensus: an append is proposed to raft, and
//! the caller sees the offset the state machine assigned when the
//! proposal committed. Reads stay local (and are therefore not
//! linearizable across leadership changes; callers that need strong
//! reads go to the leader and tolerate the window).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message as _;
use quill_api::Record;
use quill_core::ServerId;
use quill_log::{Log, LogConfig};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::error::{ClusterError, ClusterResult};
use crate::fsm::LogStateMachine;
use crate::runtime::{self, RuntimeConfig};
use crate::storage::{FileSnapshotStore, FileStableStore, SegmentedLogStore};
use crate::transport::Transport;

/// Configuration for a replicated log node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's unique id (its node name).
    pub local_id: ServerId,
    /// The address peers dial for consensus traffic; the same host:port
    /// pair serves the application RPC, so it doubles as the advertised
    /// `rpc_addr`.
    pub advertise_addr: String,
    /// Form a single-voter cluster when no prior state exists.
    pub bootstrap: bool,
    /// Leader heartbeat interval; also the runtime's tick interval.
    pub heartbeat_timeout: Duration,
    /// Base election timeout (randomized up to twice this).
    pub election_timeout: Duration,
    /// How long an append waits for its commit before giving up.
    pub commit_timeout: Duration,
    /// Applied commands between snapshots.
    pub snapshot_threshold: u64,
    /// Segment thresholds for the data log.
    pub segment: LogConfig,
}

impl ClusterConfig {
    /// Production-shaped defaults for the given identity.
    #[must_use]
    pub fn new(local_id: ServerId, advertise_addr: impl Into<String>) -> Self {
        Self {
            local_id,
            advertise_addr: advertise_addr.into(),
            bootstrap: false,
            heartbeat_timeout: Duration::from_millis(50),
            election_timeout: Duration::from_millis(300),
            commit_timeout: Duration::from_secs(5),
            snapshot_threshold: 8192,
            segment: LogConfig::default(),
        }
    }

    /// Enables single-voter bootstrap.
    #[must_use]
    pub const fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    fn election_ticks(&self) -> u32 {
        let heartbeat = self.heartbeat_timeout.as_millis().max(1);
        let election = self.election_timeout.as_millis().max(heartbeat + 1);
        u32::try_from(election.div_ceil(heartbeat)).unwrap_or(u32::MAX).max(2)
    }
}

/// The append/read surface backed by consensus.
pub struct ReplicatedLog {
    local: Arc<Log>,
    handle: runtime::RaftHandle,
    commit_timeout: Duration,
}

impl ReplicatedLog {
    /// Opens (or recovers) a replicated log under `data_dir`.
    ///
    /// `raft_conns` delivers inbound consensus connections from the
    /// stream layer; the caller owns the listener and the demux loop.
    ///
    /// # Errors
    /// Returns an error if any store fails to open or recover.
    pub fn open(
        data_dir: impl AsRef<Path>,
        config: &ClusterConfig,
        mut raft_conns: mpsc::Receiver<TcpStream>,
    ) -> ClusterResult<Self> {
        let data_dir = data_dir.as_ref();

        let local = Arc::new(Log::open(data_dir.join("log"), config.segment)?);
        let fsm = Arc::new(LogStateMachine::new(Arc::clone(&local)));

        let raft_dir = data_dir.join("raft");
        std::fs::create_dir_all(&raft_dir).map_err(|e| ClusterError::io("raft mkdir", e))?;
        let log_store = Arc::new(SegmentedLogStore::open(
            raft_dir.join("log"),
            LogConfig::default()
                .with_max_store_bytes(4 * 1024 * 1024)
                .with_max_index_bytes(1024 * 1024),
        )?);
        let stable = Arc::new(FileStableStore::new(raft_dir.join("stable.json")));
        let snapshots = Arc::new(FileSnapshotStore::open(raft_dir.join("snapshots"))?);

        let (transport, incoming) = Transport::new(config.advertise_addr.clone());
        let transport = Arc::new(transport);

        // Feed demuxed consensus connections into the transport.
        let inbound = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(conn) = raft_conns.recv().await {
                inbound.handle_inbound(conn);
            }
        });

        let handle = runtime::spawn(
            &RuntimeConfig {
                local_id: config.local_id.clone(),
                advertise_addr: config.advertise_addr.clone(),
                bootstrap: config.bootstrap,
                tick_interval: config.heartbeat_timeout,
                election_ticks: config.election_ticks(),
                snapshot_threshold: config.snapshot_threshold,
            },
            fsm,
            log_store,
            stable,
            snapshots,
            transport,
            incoming,
        )?;

        info!(id = %config.local_id, dir = %data_dir.display(), "replicated log open");

        Ok(Self {
            local,
            handle,
            commit_timeout: config.commit_timeout,
        })
    }

    /// Appends a record through consensus. Leader only.
    ///
    /// # Errors
    /// [`ClusterError::NotLeader`] on followers, or
    /// [`ClusterError::Unavailable`] when the proposal does not commit
    /// in time.
    pub async fn append(&self, record: Record) -> ClusterResult<u64> {
        let command = Bytes::from(record.encode_to_vec());
        let response = self.handle.propose(command, self.commit_timeout).await?;
        let bytes: [u8; 8] = response[..]
            .try_into()
            .map_err(|_| ClusterError::Corrupt {
                what: "apply response",
            })?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Reads a record from the local log.
    ///
    /// # Errors
    /// Propagates the local log's errors, notably offset-out-of-range.
    pub fn read(&self, offset: u64) -> ClusterResult<Record> {
        Ok(self.local.read(offset)?)
    }

    /// Adds a voter. Leader only; a no-op when the server is already a
    /// voter at the same address.
    ///
    /// # Errors
    /// [`ClusterError::NotLeader`] on followers.
    pub async fn join(&self, id: &str, addr: &str) -> ClusterResult<()> {
        self.handle
            .add_server(ServerId::new(id), addr.to_string(), self.commit_timeout)
            .await
    }

    /// Removes a server. Leader only; a no-op when unknown.
    ///
    /// # Errors
    /// [`ClusterError::NotLeader`] on followers.
    pub async fn leave(&self, id: &str) -> ClusterResult<()> {
        self.handle
            .remove_server(ServerId::new(id), self.commit_timeout)
            .await
    }

    /// Waits until the cluster has a leader.
    ///
    /// # Errors
    /// [`ClusterError::Unavailable`] if none emerges within `timeout`.
    pub async fn wait_for_leader(&self, timeout: Duration) -> ClusterResult<ServerId> {
        self.handle.wait_for_leader(timeout).await
    }

    /// True when this node currently leads the cluster.
    ///
    /// # Errors
    /// [`ClusterError::Closed`] after shutdown.
    pub async fn is_leader(&self) -> ClusterResult<bool> {
        Ok(self.handle.inspect().await?.is_leader)
    }

    /// The cluster's servers as reported by the consensus configuration,
    /// leader flagged.
    ///
    /// # Errors
    /// [`ClusterError::Closed`] after shutdown.
    pub async fn get_servers(&self) -> ClusterResult<Vec<quill_api::Server>> {
        Ok(self.handle.inspect().await?.servers)
    }

    /// The lowest readable offset of the local log.
    ///
    /// # Errors
    /// Propagates the local log's errors.
    pub fn lowest_offset(&self) -> ClusterResult<u64> {
        Ok(self.local.lowest_offset()?)
    }

    /// The highest written offset of the local log.
    ///
    /// # Errors
    /// Propagates the local log's errors.
    pub fn highest_offset(&self) -> ClusterResult<u64> {
        Ok(self.local.highest_offset()?)
    }

    /// Subscribes to the local log's next-offset watch; the value moves
    /// on every apply, leader or follower.
    #[must_use]
    pub fn watch_next_offset(&self) -> watch::Receiver<u64> {
        self.local.watch_next_offset()
    }

    /// Shuts down consensus, then closes the local log. Idempotent.
    ///
    /// # Errors
    /// Returns the local log's close error, if any.
    pub async fn close(&self) -> ClusterResult<()> {
        self.handle.shutdown().await?;
        self.local.close()?;
        Ok(())
    }
}

impl std::fmt::Debug for ReplicatedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedLog")
            .field("dir", &self.local.dir())
            .finish()
    }
}
