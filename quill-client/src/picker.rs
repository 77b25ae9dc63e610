//! Routing policy and the cluster client.
//!
//! Produces must land on the leader; consumes spread round-robin across
//! followers (any replica serves reads) and fall back to the leader when
//! it is the only server standing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use quill_api::{ConsumeRequest, LogClient, ProduceRequest, Record, Server};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::resolver::Resolver;

/// Pure routing decisions over a resolved server list.
#[derive(Debug, Default)]
pub struct Picker {
    current: AtomicUsize,
}

impl Picker {
    /// A fresh picker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The server a produce goes to: the leader.
    #[must_use]
    pub fn pick_produce<'a>(&self, servers: &'a [Server]) -> Option<&'a Server> {
        servers.iter().find(|s| s.is_leader)
    }

    /// The server a consume goes to: followers round-robin, the leader
    /// only when no follower is available.
    #[must_use]
    pub fn pick_consume<'a>(&self, servers: &'a [Server]) -> Option<&'a Server> {
        let followers: Vec<&Server> = servers.iter().filter(|s| !s.is_leader).collect();
        if followers.is_empty() {
            return servers.iter().find(|s| s.is_leader);
        }
        let slot = self.current.fetch_add(1, Ordering::Relaxed) % followers.len();
        Some(followers[slot])
    }
}

/// A log client that discovers the cluster and routes per operation.
pub struct ClusterClient {
    resolver: Resolver,
    picker: Picker,
    clients: Mutex<HashMap<String, LogClient<Channel>>>,
}

impl ClusterClient {
    /// Connects to a seed endpoint (e.g. `http://10.0.0.5:8400`) and
    /// resolves the cluster through it.
    ///
    /// # Errors
    /// Returns an error if the seed is unreachable.
    pub async fn connect(endpoint: impl Into<String>) -> ClientResult<Self> {
        let resolver = Resolver::connect(endpoint).await?;
        Ok(Self {
            resolver,
            picker: Picker::new(),
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Appends a record via the leader. A stale leader answer triggers
    /// one re-resolve and retry.
    ///
    /// # Errors
    /// Returns the final attempt's error.
    pub async fn produce(&self, value: Vec<u8>) -> ClientResult<u64> {
        match self.produce_once(value.clone()).await {
            Ok(offset) => Ok(offset),
            Err(e) if e.is_retryable() => {
                debug!(error = %e, "produce failed, re-resolving leader");
                self.resolver.resolve_now();
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                self.produce_once(value).await
            }
            Err(e) => Err(e),
        }
    }

    async fn produce_once(&self, value: Vec<u8>) -> ClientResult<u64> {
        let servers = self.resolver.servers();
        if servers.is_empty() {
            return Err(ClientError::NoServers);
        }
        let leader = self
            .picker
            .pick_produce(&servers)
            .ok_or(ClientError::NoLeader)?;

        let mut client = self.client_for(&leader.rpc_addr).await?;
        let response = client
            .produce(ProduceRequest {
                record: Some(Record {
                    value,
                    ..Default::default()
                }),
            })
            .await?;
        Ok(response.into_inner().offset)
    }

    /// Reads the record at `offset` from a follower (or the leader when
    /// it stands alone).
    ///
    /// # Errors
    /// Returns the server's error, notably out-of-range.
    pub async fn consume(&self, offset: u64) -> ClientResult<Record> {
        let servers = self.resolver.servers();
        let target = self
            .picker
            .pick_consume(&servers)
            .ok_or(ClientError::NoServers)?;

        let mut client = self.client_for(&target.rpc_addr).await?;
        let response = client.consume(ConsumeRequest { offset }).await?;
        response
            .into_inner()
            .record
            .ok_or_else(|| ClientError::Rpc(tonic::Status::internal("response without record")))
    }

    /// The resolver backing this client.
    #[must_use]
    pub const fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    async fn client_for(&self, addr: &str) -> ClientResult<LogClient<Channel>> {
        if let Some(client) = self.clients.lock().expect("client cache poisoned").get(addr) {
            return Ok(client.clone());
        }

        let channel = Endpoint::from_shared(format!("http://{addr}"))?
            .connect()
            .await?;
        let client = LogClient::new(channel);
        self.clients
            .lock()
            .expect("client cache poisoned")
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }
}
