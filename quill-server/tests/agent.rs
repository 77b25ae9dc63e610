//! Whole-node tests: gossip discovery drives voter admission, writes
//! replicate, followers redirect producers to the leader.

use std::sync::Arc;
use std::time::Duration;

use quill_api::{ConsumeRequest, GetServersRequest, LogClient, ProduceRequest, Record};
use quill_server::{AclAuthorizer, Agent, AgentConfig};
use tokio::time::{sleep, timeout};
use tonic::transport::Channel;
use tonic::Code;

struct TestAgent {
    agent: Agent,
    _dir: tempfile::TempDir,
}

async fn start_agent(name: &str, join_addrs: Vec<String>, bootstrap: bool) -> TestAgent {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        start_join_addrs: join_addrs,
        bootstrap,
        ..AgentConfig::new(name, "127.0.0.1:0".parse().unwrap(), dir.path().to_path_buf())
    };
    let agent = Agent::start(config, Arc::new(AclAuthorizer::permissive()))
        .await
        .unwrap();
    TestAgent { agent, _dir: dir }
}

async fn client_of(agent: &Agent) -> LogClient<Channel> {
    LogClient::connect(format!("http://{}", agent.rpc_addr()))
        .await
        .unwrap()
}

fn record(value: &str) -> Record {
    Record {
        value: value.as_bytes().to_vec(),
        ..Default::default()
    }
}

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
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agents_discover_replicate_and_redirect() {
    let leader = start_agent("node-0", vec![], true).await;
    let seed = vec![leader.agent.gossip_addr().to_string()];
    let follower1 = start_agent("node-1", seed.clone(), false).await;
    let follower2 = start_agent("node-2", seed, false).await;

    // Discovery turns into voter admission: the leader eventually
    // reports all three servers, exactly one of them leader.
    let mut leader_client = client_of(&leader.agent).await;
    eventually("voter admission", Duration::from_secs(10), || {
        let mut client = leader_client.clone();
        async move {
            let servers = client
                .get_servers(GetServersRequest {})
                .await
                .map(|r| r.into_inner().servers)
                .unwrap_or_default();
            servers.len() == 3 && servers.iter().filter(|s| s.is_leader).count() == 1
        }
    })
    .await;

    // A write through the leader becomes readable on every node.
    let offset = leader_client
        .produce(ProduceRequest {
            record: Some(record("replicated")),
        })
        .await
        .unwrap()
        .into_inner()
        .offset;

    for follower in [&follower1, &follower2] {
        let mut client = client_of(&follower.agent).await;
        eventually("follower serves the record", Duration::from_secs(10), || {
            let mut client = client.clone();
            async move {
                client
                    .consume(ConsumeRequest { offset })
                    .await
                    .is_ok_and(|r| {
                        r.into_inner()
                            .record
                            .is_some_and(|rec| rec.value == b"replicated".to_vec())
                    })
            }
        })
        .await;
        // Followers refuse produce with the code clients re-resolve on.
        let status = client
            .produce(ProduceRequest {
                record: Some(record("wrong node")),
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);
    }

    // A graceful leave shrinks the voter set.
    follower2.agent.shutdown().await.unwrap();
    eventually("voter removal", Duration::from_secs(10), || {
        let mut client = leader_client.clone();
        async move {
            client
                .get_servers(GetServersRequest {})
                .await
                .map(|r| r.into_inner().servers)
                .is_ok_and(|servers| servers.len() == 2)
        }
    })
    .await;

    leader.agent.shutdown().await.unwrap();
    follower1.agent.shutdown().await.unwrap();
}
