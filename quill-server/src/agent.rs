//! The agent: one struct that runs a whole node.
//!
//! Startup wires, in order: the multiplexed listener, the replicated
//! log, the gRPC server on the demuxed RPC stream, and gossip
//! membership whose join/leave events drive voter admission. Shutdown
//! runs the reverse recipe — gossip leave, consensus stop, RPC stop,
//! log close — and every step runs even when an earlier one fails; the
//! log close is the last line of defense for durability.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quill_api::LogServer;
use quill_cluster::{bind_listener, ClusterConfig, ReplicatedLog, StreamLayer};
use quill_core::ServerId;
use quill_discovery::{DiscoveryConfig, Handler, Membership, RPC_ADDR_TAG};
use quill_log::LogConfig;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::auth::{authenticate, Authorizer};
use crate::error::{ServerError, ServerResult};
use crate::service::LogService;

/// Everything an agent needs to run a node.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This node's unique name; doubles as its raft server id.
    pub node_name: String,
    /// UDP address for gossip.
    pub bind_addr: SocketAddr,
    /// TCP port for the multiplexed RPC/consensus listener, bound on
    /// the gossip address's host. Zero picks a free port.
    pub rpc_port: u16,
    /// Where the logs and raft state live.
    pub data_dir: PathBuf,
    /// Gossip addresses to contact at startup.
    pub start_join_addrs: Vec<String>,
    /// Form a single-voter cluster when no prior state exists.
    pub bootstrap: bool,
    /// Segment thresholds for the data log.
    pub segment: LogConfig,
}

impl AgentConfig {
    /// A configuration with default thresholds.
    #[must_use]
    pub fn new(node_name: impl Into<String>, bind_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            node_name: node_name.into(),
            bind_addr,
            rpc_port: 0,
            data_dir,
            start_join_addrs: Vec::new(),
            bootstrap: false,
            segment: LogConfig::default(),
        }
    }
}

/// A running node.
pub struct Agent {
    replicated: Arc<ReplicatedLog>,
    membership: Membership,
    rpc_addr: String,
    grpc_stop: Mutex<Option<oneshot::Sender<()>>>,
    shutdown: Mutex<bool>,
}

/// Bridges membership events into voter admission. Join and leave are
/// leader-only operations; on followers they come back `NotLeader`,
/// which is the expected no-op.
struct VoterAdmission {
    replicated: Arc<ReplicatedLog>,
}

#[async_trait]
impl Handler for VoterAdmission {
    async fn join(&self, name: &str, addr: &str) {
        match self.replicated.join(name, addr).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {}
            Err(e) => warn!(name, error = %e, "voter admission failed"),
        }
    }

    async fn leave(&self, name: &str) {
        match self.replicated.leave(name).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {}
            Err(e) => warn!(name, error = %e, "voter removal failed"),
        }
    }
}

impl Agent {
    /// Starts a node.
    ///
    /// # Errors
    /// Returns an error if any component fails to start.
    pub async fn start(
        config: AgentConfig,
        authorizer: Arc<dyn Authorizer>,
    ) -> ServerResult<Self> {
        // One listener carries both consensus and RPC traffic.
        let rpc_bind: SocketAddr = (config.bind_addr.ip(), config.rpc_port).into();
        let listener = bind_listener(rpc_bind).map_err(internal("bind rpc listener"))?;
        let rpc_addr = listener
            .local_addr()
            .map_err(internal("rpc listener addr"))?
            .to_string();

        let (raft_tx, raft_rx) = mpsc::channel(64);
        let (rpc_tx, rpc_rx) = mpsc::channel(64);
        tokio::spawn(StreamLayer::new(listener).run(raft_tx, rpc_tx));

        let cluster_config = ClusterConfig {
            segment: config.segment,
            ..ClusterConfig::new(ServerId::new(config.node_name.clone()), rpc_addr.clone())
        }
        .with_bootstrap(config.bootstrap);
        let replicated = Arc::new(ReplicatedLog::open(
            &config.data_dir,
            &cluster_config,
            raft_rx,
        )?);

        if config.bootstrap {
            replicated
                .wait_for_leader(Duration::from_secs(3))
                .await?;
        }

        // gRPC on the demuxed connections.
        let service = LogService::new(
            Arc::clone(&replicated) as _,
            authorizer,
            Arc::clone(&replicated) as _,
        );
        let incoming = ReceiverStream::new(rpc_rx).map(Ok::<_, std::io::Error>);
        let (grpc_stop_tx, grpc_stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(LogServer::with_interceptor(service, authenticate))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = grpc_stop_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "gRPC server exited with error");
            }
        });

        // Membership last: once we gossip, peers will start joining us.
        let membership = Membership::start(
            Arc::new(VoterAdmission {
                replicated: Arc::clone(&replicated),
            }),
            DiscoveryConfig::new(config.node_name.clone(), config.bind_addr)
                .with_tag(RPC_ADDR_TAG, rpc_addr.clone())
                .with_start_join_addrs(config.start_join_addrs.clone()),
        )
        .await
        .map_err(|e| ServerError::Internal {
            message: e.to_string(),
        })?;

        info!(
            name = %config.node_name,
            rpc_addr = %rpc_addr,
            gossip_addr = %membership.bind_addr(),
            "agent started"
        );

        Ok(Self {
            replicated,
            membership,
            rpc_addr,
            grpc_stop: Mutex::new(Some(grpc_stop_tx)),
            shutdown: Mutex::new(false),
        })
    }

    /// The address clients (and peers) dial.
    #[must_use]
    pub fn rpc_addr(&self) -> &str {
        &self.rpc_addr
    }

    /// The gossip address peers join through.
    #[must_use]
    pub fn gossip_addr(&self) -> SocketAddr {
        self.membership.bind_addr()
    }

    /// The node's replicated log.
    #[must_use]
    pub fn replicated_log(&self) -> Arc<ReplicatedLog> {
        Arc::clone(&self.replicated)
    }

    /// Stops the node: gossip leave, consensus stop, RPC stop, log
    /// close. Idempotent; every step runs even if an earlier one fails
    /// and the first error is reported.
    ///
    /// # Errors
    /// The first failing step's error.
    pub async fn shutdown(&self) -> ServerResult<()> {
        let mut done = self.shutdown.lock().await;
        if *done {
            return Ok(());
        }
        *done = true;

        let mut first_error = None;

        if let Err(e) = self.membership.leave().await {
            warn!(error = %e, "gossip leave failed");
            first_error.get_or_insert(ServerError::Internal {
                message: e.to_string(),
            });
        }

        if let Some(stop) = self.grpc_stop.lock().await.take() {
            let _ = stop.send(());
        }

        if let Err(e) = self.replicated.close().await {
            warn!(error = %e, "replicated log close failed");
            first_error.get_or_insert(e.into());
        }

        info!("agent stopped");
        first_error.map_or(Ok(()), Err)
    }
}

fn internal(operation: &'static str) -> impl Fn(std::io::Error) -> ServerError {
    move |e| ServerError::Internal {
        message: format!("{operation}: {e}"),
    }
}
