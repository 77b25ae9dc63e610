//! Server-list resolution.
//!
//! A resolver holds one connection to a seed endpoint and keeps a
//! watch-published list of `{rpc_addr, is_leader}` pairs fresh: a
//! background task refreshes periodically, and `resolve_now` forces a
//! refresh (safe to call from any task, any number of times).

use std::time::Duration;

use quill_api::{GetServersRequest, LogClient, Server};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::error::ClientResult;

/// How often the background task refreshes on its own.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// A self-refreshing view of the cluster's servers.
pub struct Resolver {
    servers_rx: watch::Receiver<Vec<Server>>,
    refresh_tx: mpsc::Sender<()>,
}

impl Resolver {
    /// Connects to the seed endpoint and performs the initial
    /// resolution before returning.
    ///
    /// # Errors
    /// Returns an error if the endpoint is unreachable or the first
    /// `GetServers` call fails.
    pub async fn connect(endpoint: impl Into<String>) -> ClientResult<Self> {
        let channel = Endpoint::from_shared(endpoint.into())?.connect().await?;
        let mut client = LogClient::new(channel);

        let initial = fetch(&mut client).await?;
        let (servers_tx, servers_rx) = watch::channel(initial);
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut ticker = interval(REFRESH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately and we already resolved.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    triggered = refresh_rx.recv() => {
                        if triggered.is_none() {
                            return; // resolver dropped
                        }
                    }
                }

                match fetch(&mut client).await {
                    Ok(servers) => {
                        servers_tx.send_if_modified(|current| {
                            if *current == servers {
                                false
                            } else {
                                debug!(count = servers.len(), "server list changed");
                                *current = servers;
                                true
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to resolve servers"),
                }

                if servers_tx.is_closed() {
                    return; // resolver dropped
                }
            }
        });

        Ok(Self {
            servers_rx,
            refresh_tx,
        })
    }

    /// The most recently resolved server list.
    #[must_use]
    pub fn servers(&self) -> Vec<Server> {
        self.servers_rx.borrow().clone()
    }

    /// Subscribes to server-list updates.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Vec<Server>> {
        self.servers_rx.clone()
    }

    /// Requests an immediate refresh. Non-blocking; coalesces with any
    /// refresh already queued.
    pub fn resolve_now(&self) {
        let _ = self.refresh_tx.try_send(());
    }
}

async fn fetch(client: &mut LogClient<Channel>) -> ClientResult<Vec<Server>> {
    let response = client.get_servers(GetServersRequest {}).await?;
    Ok(response.into_inner().servers)
}
