//! Inbound flows routed to node listeners.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use embednet::sim::MemNetwork;
use embednet::{ListenerError, Node, NodeError};

mod common;

use common::{node_config, FailAt, Recording};

const PEER: &str = "100.100.100.100:40000";

async fn running_node(dir: &tempfile::TempDir, network: &Arc<MemNetwork>) -> (Node, IpAddr, IpAddr) {
    let node = Node::builder(node_config(dir.path(), "sink"))
        .subsystems(Recording::new(Arc::clone(network), FailAt::Nowhere))
        .build();
    node.up(&CancellationToken::new()).await.unwrap();
    let (v4, v6) = node.overlay_ips();
    (node, IpAddr::V4(v4.unwrap()), IpAddr::V6(v6.unwrap()))
}

fn peer() -> SocketAddr {
    PEER.parse().unwrap()
}

#[tokio::test]
async fn injected_tcp_flow_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, v4, _) = running_node(&dir, &network).await;
    let listener = node.listen("tcp", ":80").await.unwrap();
    assert_eq!(listener.addr(), ":80");

    let mut client = network.inject_tcp(peer(), SocketAddr::new(v4, 80)).unwrap();
    let mut conn = listener.accept().await.unwrap();
    assert_eq!(conn.peer_addr(), peer());
    assert_eq!(conn.local_addr(), SocketAddr::new(v4, 80));

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    conn.write_all(b"world").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    node.close().await.unwrap();
}

#[tokio::test]
async fn most_specific_listener_wins() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, v4, v6) = running_node(&dir, &network).await;
    let wildcard = node.listen("tcp", ":8080").await.unwrap();
    let specific = node.listen("tcp4", &format!("{v4}:8080")).await.unwrap();

    let _v4_client = network.inject_tcp(peer(), SocketAddr::new(v4, 8080)).unwrap();
    let conn = specific.accept().await.unwrap();
    assert_eq!(conn.local_addr().ip(), v4);

    let v6_peer: SocketAddr = "[fd7a:115c:a1e0::99]:40000".parse().unwrap();
    let _v6_client = network.inject_tcp(v6_peer, SocketAddr::new(v6, 8080)).unwrap();
    let conn = wildcard.accept().await.unwrap();
    assert_eq!(conn.local_addr().ip(), v6);

    node.close().await.unwrap();
}

#[tokio::test]
async fn duplicate_listen_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, _, _) = running_node(&dir, &network).await;
    let _first = node.listen("tcp", ":80").await.unwrap();

    match node.listen("tcp", "0.0.0.0:80").await {
        Err(NodeError::AlreadyBound { network, addr }) => {
            assert_eq!(network, "tcp");
            assert_eq!(addr, "0.0.0.0:80");
        }
        other => panic!("unexpected listen outcome: {other:?}"),
    }
    // A different transport on the same port is fine.
    let _udp = node.listen("udp", ":80").await.unwrap();

    node.close().await.unwrap();
}

#[tokio::test]
async fn unaccepted_flow_is_dropped_after_grace() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, v4, _) = running_node(&dir, &network).await;
    let listener = node.listen("tcp", ":80").await.unwrap();

    let mut ignored = network.inject_tcp(peer(), SocketAddr::new(v4, 80)).unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), ignored.read(&mut buf))
        .await
        .expect("dropped flow was never closed")
        .unwrap();
    assert_eq!(read, 0);

    // The listener still serves the next flow.
    let _client = network.inject_tcp(peer(), SocketAddr::new(v4, 80)).unwrap();
    let conn = tokio::time::timeout(Duration::from_secs(1), listener.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn.peer_addr(), peer());

    node.close().await.unwrap();
}

#[tokio::test]
async fn closed_listener_stops_receiving() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, v4, _) = running_node(&dir, &network).await;
    let listener = node.listen("tcp", ":80").await.unwrap();

    listener.close();
    listener.close();
    assert_eq!(listener.accept().await.unwrap_err(), ListenerError::Closed);

    let err = network.inject_tcp(peer(), SocketAddr::new(v4, 80)).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

    // The key is free again.
    let _again = node.listen("tcp", ":80").await.unwrap();
    node.close().await.unwrap();
}

#[tokio::test]
async fn blocked_accept_wakes_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, _, _) = running_node(&dir, &network).await;
    let listener = Arc::new(node.listen("tcp", ":80").await.unwrap());

    let waiter = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.accept().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    listener.close();
    assert_eq!(waiter.await.unwrap(), Err(ListenerError::Closed));

    node.close().await.unwrap();
}

#[tokio::test]
async fn udp_flow_keeps_datagrams() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, v4, _) = running_node(&dir, &network).await;
    let listener = node.listen("udp", ":53").await.unwrap();

    let mut client = network.inject_udp(peer(), SocketAddr::new(v4, 53)).unwrap();
    client.send(b"query-1").unwrap();
    client.send(b"query-2").unwrap();

    let conn = listener.accept().await.unwrap();
    let mut packets = conn.into_packet().expect("udp flow is packet oriented");
    assert_eq!(packets.recv_packet().await.unwrap(), b"query-1");
    assert_eq!(packets.recv_packet().await.unwrap(), b"query-2");

    packets.send(b"answer").unwrap();
    assert_eq!(client.recv_packet().await.unwrap(), b"answer");

    node.close().await.unwrap();
}

#[tokio::test]
async fn listeners_are_reported_by_control_api() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemNetwork::new();
    let (node, v4, _) = running_node(&dir, &network).await;
    let _web = node.listen("tcp", ":80").await.unwrap();
    let _dns = node.listen("udp4", &format!("{v4}:53")).await.unwrap();

    let listeners = node.local_client().await.unwrap().listeners().await.unwrap();
    let summary: Vec<_> = listeners
        .iter()
        .map(|l| (l.network.as_str(), l.host, l.port))
        .collect();
    assert_eq!(summary, vec![("udp4", Some(v4), 53), ("tcp", None, 80)]);

    node.close().await.unwrap();
}
