//! Quill server binary.

#![deny(unsafe_code)]
#![deny(clippy::all)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use quill_server::{AclAuthorizer, Agent, AgentConfig};

/// Quill distributed commit log server.
#[derive(Parser, Debug)]
#[command(name = "quill-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Unique node name; also the raft server id.
    #[arg(long, default_value = "node-0")]
    node_name: String,

    /// UDP address for gossip membership.
    #[arg(long, default_value = "127.0.0.1:8401")]
    bind_addr: SocketAddr,

    /// TCP port for the RPC/consensus listener (0 picks a free port).
    #[arg(long, default_value = "8400")]
    rpc_port: u16,

    /// Directory for log segments and raft state.
    #[arg(long, default_value = "/var/lib/quill")]
    data_dir: PathBuf,

    /// Gossip addresses of existing cluster members to join.
    #[arg(long)]
    start_join_addrs: Vec<String>,

    /// Bootstrap a single-voter cluster when no state exists.
    #[arg(long)]
    bootstrap: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        node_name = %args.node_name,
        bind_addr = %args.bind_addr,
        rpc_port = args.rpc_port,
        data_dir = %args.data_dir.display(),
        bootstrap = args.bootstrap,
        "starting quill server"
    );

    let config = AgentConfig {
        rpc_port: args.rpc_port,
        start_join_addrs: args.start_join_addrs,
        bootstrap: args.bootstrap,
        ..AgentConfig::new(args.node_name, args.bind_addr, args.data_dir)
    };

    // TODO: load ACL rules from a policy source once one is settled on;
    // until then every authenticated and anonymous subject is allowed.
    let agent = Agent::start(config, Arc::new(AclAuthorizer::permissive())).await?;
    info!(rpc_addr = %agent.rpc_addr(), "serving");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    agent.shutdown().await?;
    Ok(())
}
