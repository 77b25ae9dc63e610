//! Resolver and cluster-client tests against a real service.

use std::sync::Arc;

use quill_api::{LogServer, Server as ApiServer};
use quill_client::{ClusterClient, Resolver};
use quill_log::{Log, LogConfig};
use quill_server::{authenticate, AclAuthorizer, LogService, StaticServerLister};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

async fn start_server() -> (String, tempfile::TempDir) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());
    let lister = StaticServerLister::new(vec![ApiServer {
        id: "node-0".to_string(),
        rpc_addr: addr.clone(),
        is_leader: true,
    }]);
    let service = LogService::new(
        log,
        Arc::new(AclAuthorizer::permissive()),
        Arc::new(lister),
    );

    tokio::spawn(
        Server::builder()
            .add_service(LogServer::with_interceptor(service, authenticate))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    (addr, dir)
}

#[tokio::test]
async fn test_resolver_discovers_and_tags_the_leader() {
    let (addr, _dir) = start_server().await;

    let resolver = Resolver::connect(format!("http://{addr}")).await.unwrap();
    let servers = resolver.servers();

    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].rpc_addr, addr);
    assert!(servers[0].is_leader);
}

#[tokio::test]
async fn test_cluster_client_produces_and_consumes() {
    let (addr, _dir) = start_server().await;

    let client = ClusterClient::connect(format!("http://{addr}")).await.unwrap();

    let offset = client.produce(b"through the picker".to_vec()).await.unwrap();
    assert_eq!(offset, 0);

    // With the leader standing alone, consume falls back to it.
    let record = client.consume(0).await.unwrap();
    assert_eq!(record.value, b"through the picker".to_vec());
    assert_eq!(record.offset, 0);
}
