//! End-to-end replication tests: real sockets, real disks, short timers.

use std::sync::Arc;
use std::time::Duration;

use quill_api::{Record, RecordKind};
use quill_cluster::{bind_listener, ClusterConfig, ClusterError, ReplicatedLog, StreamLayer};
use quill_core::ServerId;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

struct TestNode {
    log: Arc<ReplicatedLog>,
    addr: String,
    _dir: tempfile::TempDir,
}

async fn start_node(name: &str, bootstrap: bool) -> TestNode {
    let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (raft_tx, raft_rx) = mpsc::channel(16);
    let (rpc_tx, _rpc_rx) = mpsc::channel(16);
    tokio::spawn(StreamLayer::new(listener).run(raft_tx, rpc_tx));

    let config = ClusterConfig {
        heartbeat_timeout: Duration::from_millis(20),
        election_timeout: Duration::from_millis(100),
        commit_timeout: Duration::from_secs(3),
        ..ClusterConfig::new(ServerId::new(name), addr.clone())
    }
    .with_bootstrap(bootstrap);

    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(ReplicatedLog::open(dir.path(), &config, raft_rx).unwrap());
    TestNode {
        log,
        addr,
        _dir: dir,
    }
}

fn record(value: &str) -> Record {
    Record {
        value: value.as_bytes().to_vec(),
        offset: 0,
        term: 0,
        kind: RecordKind::Append as i32,
    }
}

/// Polls `check` until it passes or the deadline expires.
async fn eventually<F, Fut>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = timeout(deadline, async {
        loop {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_node_bootstrap_append_read() {
    let node = start_node("node-0", true).await;

    node.log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();

    let offset = node.log.append(record("hello world")).await.unwrap();
    assert_eq!(offset, 0);
    assert_eq!(node.log.append(record("second")).await.unwrap(), 1);

    let got = node.log.read(0).unwrap();
    assert_eq!(got.value, b"hello world".to_vec());
    assert!(got.term > 0, "commit stamps the leader's term");

    // Reading past the end is out of range, not an error of any other kind.
    let err = node.log.read(2).unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Log(quill_log::LogError::OffsetOutOfRange { offset: 2 })
    ));

    node.log.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_append_on_unbootstrapped_node_fails() {
    let node = start_node("node-0", false).await;

    // No configuration, no election, no leader.
    let err = node.log.append(record("nope")).await.unwrap_err();
    assert!(err.is_retryable());

    node.log.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_node_replication_and_membership() {
    let leader = start_node("node-0", true).await;
    let follower1 = start_node("node-1", false).await;
    let follower2 = start_node("node-2", false).await;

    leader
        .log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();

    leader.log.join("node-1", &follower1.addr).await.unwrap();
    leader.log.join("node-2", &follower2.addr).await.unwrap();
    // Joining again with the same address is a no-op.
    leader.log.join("node-1", &follower1.addr).await.unwrap();

    for i in 0..3 {
        let offset = leader.log.append(record(&format!("value-{i}"))).await.unwrap();
        assert_eq!(offset, i);
    }

    // Followers converge on the same records at the same offsets.
    for follower in [&follower1, &follower2] {
        eventually("follower replication", Duration::from_secs(5), || {
            let log = Arc::clone(&follower.log);
            async move {
                (0..3).all(|i| {
                    log.read(i)
                        .is_ok_and(|r| r.value == format!("value-{i}").into_bytes())
                })
            }
        })
        .await;
    }

    let servers = leader.log.get_servers().await.unwrap();
    assert_eq!(servers.len(), 3);
    assert_eq!(servers.iter().filter(|s| s.is_leader).count(), 1);
    assert!(servers.iter().any(|s| s.id == "node-0" && s.is_leader));

    leader.log.leave("node-2").await.unwrap();
    eventually("membership shrink", Duration::from_secs(3), || {
        let log = Arc::clone(&leader.log);
        async move { log.get_servers().await.unwrap().len() == 2 }
    })
    .await;

    for node in [&leader, &follower1, &follower2] {
        node.log.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_failover() {
    let leader = start_node("node-0", true).await;
    let follower1 = start_node("node-1", false).await;
    let follower2 = start_node("node-2", false).await;

    leader
        .log
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();
    leader.log.join("node-1", &follower1.addr).await.unwrap();
    leader.log.join("node-2", &follower2.addr).await.unwrap();

    let offset = leader.log.append(record("before failover")).await.unwrap();

    // Both followers must have the record before we kill the leader.
    for follower in [&follower1, &follower2] {
        eventually("replication before failover", Duration::from_secs(5), || {
            let log = Arc::clone(&follower.log);
            async move { log.read(offset).is_ok() }
        })
        .await;
    }

    leader.log.close().await.unwrap();

    // One of the survivors takes over.
    eventually("new leader", Duration::from_secs(10), || {
        let a = Arc::clone(&follower1.log);
        let b = Arc::clone(&follower2.log);
        async move {
            a.is_leader().await.unwrap_or(false) || b.is_leader().await.unwrap_or(false)
        }
    })
    .await;

    let new_leader = if follower1.log.is_leader().await.unwrap() {
        &follower1
    } else {
        &follower2
    };

    let next = new_leader
        .log
        .append(record("after failover"))
        .await
        .unwrap();
    assert_eq!(next, offset + 1);

    for follower in [&follower1, &follower2] {
        eventually("replication after failover", Duration::from_secs(5), || {
            let log = Arc::clone(&follower.log);
            async move {
                log.read(next)
                    .is_ok_and(|r| r.value == b"after failover".to_vec())
            }
        })
        .await;
    }

    follower1.log.close().await.unwrap();
    follower2.log.close().await.unwrap();
}
