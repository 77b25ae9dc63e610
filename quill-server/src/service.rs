//! The log.v1 gRPC service.
//!
//! Handlers are written against capability traits so the same service
//! fronts a plain [`quill_log::Log`] in tests and the replicated log in
//! production. Every data operation authorizes first, then acts; errors
//! map to stable status codes in `error.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use quill_api::{
    ConsumeRequest, ConsumeResponse, GetServersRequest, GetServersResponse, Log as LogRpc,
    ProduceRequest, ProduceResponse, Record, Server,
};
use quill_cluster::ReplicatedLog;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use crate::auth::{subject_of, Authorizer, CONSUME_ACTION, OBJECT_WILDCARD, PRODUCE_ACTION};
use crate::error::ServerResult;

/// The log the service appends to and reads from.
///
/// Writes go through consensus in production; reads are local either
/// way. The next-offset watch moves on every apply, which is what lets
/// consume streams wait for records that do not exist yet instead of
/// polling.
#[async_trait]
pub trait CommitLog: Send + Sync + 'static {
    /// Appends a record, returning its offset.
    async fn append(&self, record: Record) -> ServerResult<u64>;

    /// Reads the record at `offset`.
    async fn read(&self, offset: u64) -> ServerResult<Record>;

    /// Subscribes to the next offset to be assigned.
    fn watch_next_offset(&self) -> watch::Receiver<u64>;
}

#[async_trait]
impl CommitLog for quill_log::Log {
    async fn append(&self, record: Record) -> ServerResult<u64> {
        Ok(quill_log::Log::append(self, record)?)
    }

    async fn read(&self, offset: u64) -> ServerResult<Record> {
        Ok(quill_log::Log::read(self, offset)?)
    }

    fn watch_next_offset(&self) -> watch::Receiver<u64> {
        quill_log::Log::watch_next_offset(self)
    }
}

#[async_trait]
impl CommitLog for ReplicatedLog {
    async fn append(&self, record: Record) -> ServerResult<u64> {
        Ok(ReplicatedLog::append(self, record).await?)
    }

    async fn read(&self, offset: u64) -> ServerResult<Record> {
        Ok(ReplicatedLog::read(self, offset)?)
    }

    fn watch_next_offset(&self) -> watch::Receiver<u64> {
        ReplicatedLog::watch_next_offset(self)
    }
}

/// Source of the cluster's server list for `GetServers`.
#[async_trait]
pub trait ServerLister: Send + Sync + 'static {
    /// The current servers, leader flagged.
    async fn get_servers(&self) -> ServerResult<Vec<Server>>;
}

#[async_trait]
impl ServerLister for ReplicatedLog {
    async fn get_servers(&self) -> ServerResult<Vec<Server>> {
        Ok(ReplicatedLog::get_servers(self).await?)
    }
}

/// A fixed server list, for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct StaticServerLister {
    servers: Vec<Server>,
}

impl StaticServerLister {
    /// Wraps a fixed list.
    #[must_use]
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }
}

#[async_trait]
impl ServerLister for StaticServerLister {
    async fn get_servers(&self) -> ServerResult<Vec<Server>> {
        Ok(self.servers.clone())
    }
}

/// The service implementation behind the generated `Log` trait.
pub struct LogService {
    commit_log: Arc<dyn CommitLog>,
    authorizer: Arc<dyn Authorizer>,
    lister: Arc<dyn ServerLister>,
    /// Buffered responses per consume stream before backpressure.
    stream_buffer: usize,
}

impl LogService {
    /// Wires the service with its collaborators.
    pub fn new(
        commit_log: Arc<dyn CommitLog>,
        authorizer: Arc<dyn Authorizer>,
        lister: Arc<dyn ServerLister>,
    ) -> Self {
        Self {
            commit_log,
            authorizer,
            lister,
            stream_buffer: 64,
        }
    }

    fn authorize(&self, subject: &str, action: &'static str) -> Result<(), Status> {
        self.authorizer
            .authorize(subject, OBJECT_WILDCARD, action)
            .map_err(Status::from)
    }

    async fn produce_record(&self, record: Option<Record>) -> Result<ProduceResponse, Status> {
        let record = record.ok_or_else(|| Status::invalid_argument("record is required"))?;
        let offset = self.commit_log.append(record).await.map_err(Status::from)?;
        Ok(ProduceResponse { offset })
    }
}

#[tonic::async_trait]
impl LogRpc for LogService {
    async fn produce(
        &self,
        request: Request<ProduceRequest>,
    ) -> Result<Response<ProduceResponse>, Status> {
        let subject = subject_of(&request);
        self.authorize(&subject, PRODUCE_ACTION)?;

        let response = self.produce_record(request.into_inner().record).await?;
        debug!(offset = response.offset, "produced record");
        Ok(Response::new(response))
    }

    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<ConsumeResponse>, Status> {
        let subject = subject_of(&request);
        self.authorize(&subject, CONSUME_ACTION)?;

        let offset = request.into_inner().offset;
        let record = self.commit_log.read(offset).await.map_err(Status::from)?;
        Ok(Response::new(ConsumeResponse {
            record: Some(record),
        }))
    }

    type ProduceStreamStream = ReceiverStream<Result<ProduceResponse, Status>>;

    async fn produce_stream(
        &self,
        request: Request<Streaming<ProduceRequest>>,
    ) -> Result<Response<Self::ProduceStreamStream>, Status> {
        let subject = subject_of(&request);
        self.authorize(&subject, PRODUCE_ACTION)?;

        let mut inbound = request.into_inner();
        let commit_log = Arc::clone(&self.commit_log);
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        tokio::spawn(async move {
            // One response per request, in order.
            while let Some(next) = inbound.message().await.transpose() {
                let result = match next {
                    Ok(req) => match req.record {
                        Some(record) => commit_log
                            .append(record)
                            .await
                            .map(|offset| ProduceResponse { offset })
                            .map_err(Status::from),
                        None => Err(Status::invalid_argument("record is required")),
                    },
                    Err(status) => Err(status),
                };
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    return;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ConsumeStreamStream = ReceiverStream<Result<ConsumeResponse, Status>>;

    async fn consume_stream(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<Self::ConsumeStreamStream>, Status> {
        let subject = subject_of(&request);
        self.authorize(&subject, CONSUME_ACTION)?;

        let mut offset = request.into_inner().offset;
        let commit_log = Arc::clone(&self.commit_log);
        let mut next_offset = commit_log.watch_next_offset();
        let (tx, rx) = mpsc::channel(self.stream_buffer);

        tokio::spawn(async move {
            loop {
                match commit_log.read(offset).await {
                    Ok(record) => {
                        let response = ConsumeResponse {
                            record: Some(record),
                        };
                        if tx.send(Ok(response)).await.is_err() {
                            return; // client went away
                        }
                        offset += 1;
                    }
                    // Not written yet: wait for the log to grow past the
                    // requested offset instead of polling.
                    Err(e) if e.is_offset_out_of_range() => loop {
                        if *next_offset.borrow_and_update() > offset {
                            break;
                        }
                        tokio::select! {
                            changed = next_offset.changed() => {
                                if changed.is_err() {
                                    return; // log closed
                                }
                            }
                            () = tx.closed() => return,
                        }
                    },
                    Err(e) => {
                        let _ = tx.send(Err(Status::from(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> Result<Response<GetServersResponse>, Status> {
        let servers = self.lister.get_servers().await.map_err(Status::from)?;
        Ok(Response::new(GetServersResponse { servers }))
    }
}

