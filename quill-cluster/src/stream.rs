//! Single-port stream demultiplexing.
//!
//! Consensus traffic and application RPC share one TCP listener so
//! operators configure one address. The first byte of each inbound
//! connection selects the plane: [`RAFT_SENTINEL`] routes to the raft
//! transport, anything else is application RPC. The sentinel is consumed
//! on the raft path (outbound dials write it before anything else); the
//! RPC path re-injects the byte so the gRPC server sees the original
//! stream.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tonic::transport::server::{Connected, TcpConnectInfo};
use tracing::{debug, warn};

/// First byte of every outbound consensus connection.
pub const RAFT_SENTINEL: u8 = 0x01;

/// Builds a TCP listener with `SO_REUSEADDR`, ready for tokio.
///
/// # Errors
/// Returns an error if the socket cannot be created or bound.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Accepts connections on one listener and routes each to the raft or
/// RPC plane by its first byte.
pub struct StreamLayer {
    listener: TcpListener,
}

impl StreamLayer {
    /// Wraps an already-bound listener.
    #[must_use]
    pub const fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    /// The listener's local address.
    ///
    /// # Errors
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until both receivers hang up or the task is
    /// dropped. Raft connections are delivered with the sentinel already
    /// consumed; RPC connections replay their first byte.
    pub async fn run(
        self,
        raft_conns: mpsc::Sender<TcpStream>,
        rpc_conns: mpsc::Sender<PeekedStream>,
    ) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let raft_conns = raft_conns.clone();
            let rpc_conns = rpc_conns.clone();
            tokio::spawn(async move {
                if let Err(e) = route(stream, peer, &raft_conns, &rpc_conns).await {
                    debug!(peer = %peer, error = %e, "connection dropped before routing");
                }
            });
        }
    }

    /// Dials a peer's consensus plane: connect, then write the sentinel.
    ///
    /// # Errors
    /// Returns an error if the connection or the sentinel write fails.
    pub async fn dial(addr: &str) -> std::io::Result<TcpStream> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&[RAFT_SENTINEL]).await?;
        Ok(stream)
    }
}

async fn route(
    mut stream: TcpStream,
    peer: SocketAddr,
    raft_conns: &mpsc::Sender<TcpStream>,
    rpc_conns: &mpsc::Sender<PeekedStream>,
) -> std::io::Result<()> {
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    if first[0] == RAFT_SENTINEL {
        debug!(peer = %peer, "accepted raft connection");
        let _ = raft_conns.send(stream).await;
    } else {
        let _ = rpc_conns.send(PeekedStream::new(stream, first[0])).await;
    }
    Ok(())
}

/// A TCP stream whose first byte was peeked during routing and is
/// replayed to the first reader.
pub struct PeekedStream {
    inner: TcpStream,
    first: Option<u8>,
}

impl PeekedStream {
    /// Wraps a stream, re-injecting `first` ahead of its remaining bytes.
    #[must_use]
    pub const fn new(inner: TcpStream, first: u8) -> Self {
        Self {
            inner,
            first: Some(first),
        }
    }
}

impl AsyncRead for PeekedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(byte) = self.first.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeekedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connected for PeekedStream {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn demuxed() -> (SocketAddr, mpsc::Receiver<TcpStream>, mpsc::Receiver<PeekedStream>) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (raft_tx, raft_rx) = mpsc::channel(4);
        let (rpc_tx, rpc_rx) = mpsc::channel(4);
        tokio::spawn(StreamLayer::new(listener).run(raft_tx, rpc_tx));
        (addr, raft_rx, rpc_rx)
    }

    #[tokio::test]
    async fn test_sentinel_routes_to_raft() {
        let (addr, mut raft_rx, _rpc_rx) = demuxed().await;

        let mut conn = StreamLayer::dial(&addr.to_string()).await.unwrap();
        conn.write_all(b"after-sentinel").await.unwrap();

        let mut accepted = raft_rx.recv().await.unwrap();
        let mut buf = vec![0u8; 14];
        accepted.read_exact(&mut buf).await.unwrap();
        // The sentinel itself was consumed by the router.
        assert_eq!(&buf, b"after-sentinel");
    }

    #[tokio::test]
    async fn test_other_bytes_route_to_rpc_with_replay() {
        let (addr, _raft_rx, mut rpc_rx) = demuxed().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"PRI * HTTP/2.0").await.unwrap();

        let mut accepted = rpc_rx.recv().await.unwrap();
        let mut buf = vec![0u8; 14];
        accepted.read_exact(&mut buf).await.unwrap();
        // The peeked byte is replayed: the RPC server sees the original
        // stream from its first byte.
        assert_eq!(&buf, b"PRI * HTTP/2.0");
    }
}
