//! TCP transport for raft peer traffic.
//!
//! Outbound connections are established lazily, one writer task per peer
//! address, reconnecting on failure. Undeliverable messages are dropped:
//! raft's heartbeats and retries make redelivery the protocol's job, not
//! the transport's. Inbound connections (handed over by the stream layer
//! with the sentinel already consumed) are each read by a spawned task
//! that fans decoded messages into one channel for the runtime.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use quill_raft::Message;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::{read_message, write_message};
use crate::stream::StreamLayer;

/// Messages queued per peer before the transport starts dropping.
const PEER_QUEUE_DEPTH: usize = 256;

/// Pause after a failed dial before the next attempt.
const REDIAL_DELAY: Duration = Duration::from_millis(100);

/// The raft peer transport.
pub struct Transport {
    /// Our advertised address, stamped on every outbound frame so peers
    /// can reply before they know the cluster configuration.
    advertise_addr: String,
    incoming_tx: mpsc::Sender<(String, Message)>,
    peers: Mutex<HashMap<String, mpsc::Sender<Message>>>,
}

impl Transport {
    /// Creates the transport. The returned receiver yields every message
    /// decoded from inbound peer connections, paired with the sender's
    /// advertised address.
    #[must_use]
    pub fn new(advertise_addr: impl Into<String>) -> (Self, mpsc::Receiver<(String, Message)>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);
        (
            Self {
                advertise_addr: advertise_addr.into(),
                incoming_tx,
                peers: Mutex::new(HashMap::new()),
            },
            incoming_rx,
        )
    }

    /// Spawns a reader for an inbound peer connection.
    pub fn handle_inbound(&self, mut stream: TcpStream) {
        let incoming = self.incoming_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_message(&mut stream).await {
                    Ok(Some(framed)) => {
                        if incoming.send(framed).await.is_err() {
                            return; // runtime gone
                        }
                    }
                    Ok(None) => return, // peer closed cleanly
                    Err(e) => {
                        debug!(error = %e, "inbound raft connection failed");
                        return;
                    }
                }
            }
        });
    }

    /// Queues a message for the peer at `addr`, spawning the writer task
    /// on first use. Messages to unreachable peers are dropped.
    pub fn send(&self, addr: &str, message: Message) {
        let mut peers = self.peers.lock().expect("transport lock poisoned");
        let sender = peers
            .entry(addr.to_string())
            .or_insert_with(|| spawn_writer(addr.to_string(), self.advertise_addr.clone()));

        if sender.try_send(message).is_err() {
            // Queue full or writer exited; reset so the next send redials.
            warn!(addr, "peer queue unavailable, dropping message");
            peers.remove(addr);
        }
    }

    /// Drops every peer writer. In-flight messages are discarded.
    pub fn close(&self) {
        self.peers.lock().expect("transport lock poisoned").clear();
    }
}

/// One writer task per peer: drains the queue, (re)dialing as needed.
fn spawn_writer(addr: String, advertise_addr: String) -> mpsc::Sender<Message> {
    let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_DEPTH);

    tokio::spawn(async move {
        let mut conn: Option<TcpStream> = None;

        while let Some(message) = rx.recv().await {
            if conn.is_none() {
                match StreamLayer::dial(&addr).await {
                    Ok(stream) => conn = Some(stream),
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "dial failed, dropping message");
                        tokio::time::sleep(REDIAL_DELAY).await;
                        continue;
                    }
                }
            }

            if let Some(stream) = conn.as_mut() {
                if let Err(e) = write_message(stream, &advertise_addr, &message).await {
                    debug!(addr = %addr, error = %e, "write failed, resetting connection");
                    conn = None;
                }
            }
        }
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{bind_listener, StreamLayer};
    use quill_core::{LogIndex, ServerId, Term};
    use quill_raft::{AppendEntriesResponse, Message};

    #[tokio::test]
    async fn test_send_and_receive_through_stream_layer() {
        // Receiver side: stream layer + transport.
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (raft_tx, mut raft_rx) = mpsc::channel(4);
        let (rpc_tx, _rpc_rx) = mpsc::channel(4);
        tokio::spawn(StreamLayer::new(listener).run(raft_tx, rpc_tx));

        let (receiver, mut incoming) = Transport::new(addr.clone());
        tokio::spawn(async move {
            while let Some(conn) = raft_rx.recv().await {
                receiver.handle_inbound(conn);
            }
        });

        // Sender side.
        let (sender, _sender_incoming) = Transport::new("127.0.0.1:7001");
        let message = Message::AppendEntriesResponse(AppendEntriesResponse {
            term: Term::new(1),
            from: ServerId::new("node-1"),
            to: ServerId::new("node-0"),
            success: true,
            match_index: LogIndex::new(3),
        });
        sender.send(&addr, message.clone());

        let (from_addr, received) = tokio::time::timeout(Duration::from_secs(3), incoming.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(from_addr, "127.0.0.1:7001");
        assert_eq!(received, message);
    }
}
