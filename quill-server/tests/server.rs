//! Service-level tests against a plain local log.

use std::sync::Arc;
use std::time::Duration;

use quill_api::{ConsumeRequest, GetServersRequest, LogClient, LogServer, ProduceRequest, Record, Server as ApiServer};
use quill_log::{Log, LogConfig};
use quill_server::{authenticate, AclAuthorizer, LogService, StaticServerLister};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Server};
use tonic::Code;

async fn start_server(authorizer: AclAuthorizer) -> (LogClient<Channel>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(Log::open(dir.path(), LogConfig::default()).unwrap());

    let lister = StaticServerLister::new(vec![ApiServer {
        id: "node-0".to_string(),
        rpc_addr: "127.0.0.1:0".to_string(),
        is_leader: true,
    }]);
    let service = LogService::new(log, Arc::new(authorizer), Arc::new(lister));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(
        Server::builder()
            .add_service(LogServer::with_interceptor(service, authenticate))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    let client = LogClient::connect(format!("http://{addr}")).await.unwrap();
    (client, dir)
}

fn record(value: &str) -> Record {
    Record {
        value: value.as_bytes().to_vec(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_produce_consume_single_record() {
    let (mut client, _dir) = start_server(AclAuthorizer::permissive()).await;

    let produced = client
        .produce(ProduceRequest {
            record: Some(record("hello world")),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(produced.offset, 0);

    let consumed = client
        .consume(ConsumeRequest { offset: 0 })
        .await
        .unwrap()
        .into_inner();
    let got = consumed.record.unwrap();
    assert_eq!(got.value, b"hello world".to_vec());
    assert_eq!(got.offset, 0);
}

#[tokio::test]
async fn test_consume_past_boundary_is_out_of_range() {
    let (mut client, _dir) = start_server(AclAuthorizer::permissive()).await;

    client
        .produce(ProduceRequest {
            record: Some(record("only")),
        })
        .await
        .unwrap();

    let status = client
        .consume(ConsumeRequest { offset: 1 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);
}

#[tokio::test]
async fn test_produce_and_consume_streams() {
    let (mut client, _dir) = start_server(AclAuthorizer::permissive()).await;

    // Bidirectional produce: one response per request, in order.
    let requests = tokio_stream::iter(vec![
        ProduceRequest {
            record: Some(record("first")),
        },
        ProduceRequest {
            record: Some(record("second")),
        },
    ]);
    let mut responses = client.produce_stream(requests).await.unwrap().into_inner();
    assert_eq!(responses.next().await.unwrap().unwrap().offset, 0);
    assert_eq!(responses.next().await.unwrap().unwrap().offset, 1);
    assert!(responses.next().await.is_none());

    // Server streaming from offset 0 replays both, in order.
    let mut stream = client
        .consume_stream(ConsumeRequest { offset: 0 })
        .await
        .unwrap()
        .into_inner();
    for (offset, value) in [(0u64, "first"), (1, "second")] {
        let got = stream.next().await.unwrap().unwrap().record.unwrap();
        assert_eq!(got.offset, offset);
        assert_eq!(got.value, value.as_bytes().to_vec());
    }

    // The stream then blocks rather than erroring or ending...
    let pending = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(pending.is_err(), "stream must wait for the next record");

    // ...and resumes as soon as a record lands at the awaited offset.
    client
        .produce(ProduceRequest {
            record: Some(record("third")),
        })
        .await
        .unwrap();
    let got = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("stream resumes after produce")
        .unwrap()
        .unwrap();
    assert_eq!(got.record.unwrap().offset, 2);
}

#[tokio::test]
async fn test_unauthorized_client_is_denied() {
    // An empty ACL refuses everyone, including the anonymous subject.
    let (mut client, _dir) = start_server(AclAuthorizer::new()).await;

    let status = client
        .produce(ProduceRequest {
            record: Some(record("nope")),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);

    let status = client
        .consume(ConsumeRequest { offset: 0 })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn test_get_servers_reports_the_lister() {
    let (mut client, _dir) = start_server(AclAuthorizer::permissive()).await;

    let servers = client
        .get_servers(GetServersRequest {})
        .await
        .unwrap()
        .into_inner()
        .servers;
    assert_eq!(servers.len(), 1);
    assert!(servers[0].is_leader);
}
