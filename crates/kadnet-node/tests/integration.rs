//! End-to-end tests running real nodes over loopback TCP.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use kadnet_core::{Error, NodeId, PeerRecord, TcpTransport};
use kadnet_dht::Dht;
use kadnet_node::config::{Config, DhtSettings, NetworkConfig};
use kadnet_node::Node;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn test_config(seeds: Vec<SocketAddr>) -> Config {
    Config {
        network: NetworkConfig {
            listen_port: 0,
            bind_address: "127.0.0.1".to_string(),
            public_address: "127.0.0.1".to_string(),
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
        },
        dht: DhtSettings {
            id_bits: 32,
            request_timeout_ms: 500,
            inbound_timeout_ms: 500,
            refresh_interval_secs: 1,
            ..Default::default()
        },
    }
}

async fn start(seeds: Vec<SocketAddr>) -> Node {
    Node::start(&test_config(seeds), CancellationToken::new())
        .await
        .unwrap()
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_two_nodes_know_each_other() {
    let a = start(vec![]).await;
    let b = start(vec![a.listen_addr()]).await;

    wait_until("both tables to fill", || {
        a.dht().len() == 1 && b.dht().len() == 1
    })
    .await;

    assert_eq!(a.dht().peers(), vec![b.local()]);
    assert_eq!(b.dht().peers(), vec![a.local()]);
    assert_eq!(b.local().address, b.listen_addr());

    a.shutdown();
    b.shutdown();
    a.wait().await.unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn test_lookup_across_three_nodes() {
    let a = start(vec![]).await;
    let b = start(vec![a.listen_addr()]).await;
    wait_until("b to join", || b.dht().contains(&a.local().id)).await;

    let c = start(vec![b.listen_addr()]).await;
    wait_until("c to learn a through b", || c.dht().contains(&a.local().id)).await;

    let found = c.dht().lookup(a.local().id).await.unwrap();
    assert_eq!(found.first(), Some(&a.local()));
    assert!(found.contains(&b.local()));
    assert!(!found.contains(&c.local()));

    for node in [a, b, c] {
        node.shutdown();
        node.wait().await.unwrap();
    }
}

#[tokio::test]
async fn test_ping_silent_listener_times_out() {
    // Connections complete in the backlog but nothing ever answers.
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();

    let config = test_config(vec![]);
    let local = PeerRecord::new(
        NodeId::random(32).unwrap(),
        SocketAddr::from(([127, 0, 0, 1], 1)),
    );
    let transport = TcpTransport::new(32);
    let dht = Dht::new(local, config.dht_config(), transport).unwrap();

    let start = Instant::now();
    let result = dht.ping(silent_addr).await;

    assert!(matches!(result, Err(Error::Timeout)), "{result:?}");
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(dht.is_empty());
    assert!(dht.transport().inflight().is_empty());
    drop(silent);
}

#[tokio::test]
async fn test_ping_client() {
    let a = start(vec![]).await;

    let peer = kadnet_node::ping(&test_config(vec![]), a.listen_addr())
        .await
        .unwrap();
    assert_eq!(peer, a.local());

    // The node learned the client at the port it actually served from.
    let known = a.dht().peers();
    assert_eq!(known.len(), 1);
    assert_ne!(known[0].address.port(), 0);
    assert_ne!(known[0].address.port(), a.listen_addr().port());

    a.shutdown();
    a.wait().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_seed_does_not_stop_node() {
    // Bind then drop to get a port nothing listens on.
    let closed = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let a = start(vec![closed]).await;
    let b = start(vec![a.listen_addr()]).await;

    wait_until("a to learn b", || a.dht().contains(&b.local().id)).await;
    assert!(a.inflight_count() <= a.dht().config().alpha);

    a.shutdown();
    b.shutdown();
    tokio::time::timeout(Duration::from_secs(2), a.wait())
        .await
        .expect("node did not stop")
        .unwrap();
    b.wait().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_fatal() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config(vec![]);
    config.network.listen_port = taken.local_addr().unwrap().port();

    let result = Node::start(&config, CancellationToken::new()).await;
    assert!(result.is_err());
}
