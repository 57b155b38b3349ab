//! PoR over TCP loopback.
//!
//! Run with: cargo test --test por_test -- --nocapture

use porlink::{spawn_node, FailureReason, NetConfig, PeerId, PorEvent, TcpNode};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;

fn config(por_enabled: bool) -> NetConfig {
    let mut config = NetConfig {
        listen_port: 0,
        por_enabled,
        handshake_timeout_ms: 2_000,
        ..Default::default()
    };
    config.por.request_timeout_ms = 1_000;
    config.por.max_retries = 2;
    config
}

async fn node(config: &NetConfig) -> TcpNode {
    spawn_node(config, PeerId::random()).await.unwrap()
}

fn loopback(node: &TcpNode) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], node.local_addr().port()))
}

/// Wait up to `secs` for an event matching `pred`.
async fn wait_for<F>(events: &mut broadcast::Receiver<PorEvent>, secs: u64, pred: F) -> PorEvent
where
    F: Fn(&PorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(secs), async {
        loop {
            match events.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event not observed in time")
}

#[tokio::test]
async fn test_two_nodes_complete_por_exchange() {
    let node0 = node(&config(true)).await;
    let node1 = node(&config(true)).await;
    let id0 = node0.node.local_id();
    let id1 = node1.node.local_id();

    let mut events0 = node0.node.subscribe();
    let mut events1 = node1.node.subscribe();

    assert_eq!(node0.connect(loopback(&node1)).await.unwrap(), id1);

    // Node 0 → "Sending PoR request"
    let sent = wait_for(&mut events0, 5, |e| matches!(e, PorEvent::RequestSent { peer, .. } if *peer == id1)).await;
    let nonce = sent.nonce();

    // Node 1 → "Received PoR request", "Sending PoR response"
    wait_for(&mut events1, 5, |e| {
        matches!(e, PorEvent::RequestReceived { peer, nonce: n, .. } if *peer == id0 && *n == nonce)
    })
    .await;
    wait_for(&mut events1, 5, |e| {
        matches!(e, PorEvent::ResponseSent { peer, nonce: n, .. } if *peer == id0 && *n == nonce)
    })
    .await;

    // Node 0 → "Received PoR response", completed
    wait_for(&mut events0, 5, |e| matches!(e, PorEvent::ResponseReceived { nonce: n, .. } if *n == nonce)).await;
    let done = wait_for(&mut events0, 5, |e| matches!(e, PorEvent::Completed { nonce: n, .. } if *n == nonce)).await;
    match done {
        PorEvent::Completed { peer, rtt, .. } => {
            assert_eq!(peer, id1);
            assert!(rtt < Duration::from_secs(5));
        }
        other => panic!("unexpected {:?}", other),
    }

    // Node 1 → the echo was acknowledged
    wait_for(&mut events1, 5, |e| {
        matches!(e, PorEvent::AckReceived { peer, nonce: n, .. } if *peer == id0 && *n == nonce)
    })
    .await;

    let counters = node0.node.counters();
    assert!(counters.sessions_completed >= 1);
    assert!(counters.acks_sent >= 1);
    assert_eq!(counters.sessions_failed, 0);

    node0.shutdown().await;
    node1.shutdown().await;
}

#[tokio::test]
async fn test_manual_initiate_and_unknown_peer() {
    let node0 = node(&config(true)).await;
    let node1 = node(&config(true)).await;
    let id1 = node1.node.local_id();

    assert!(node0.node.initiate(id1).is_err());

    node0.connect(loopback(&node1)).await.unwrap();
    let mut events0 = node0.node.subscribe();
    let handle = node0.node.initiate(id1).unwrap();

    wait_for(&mut events0, 5, |e| matches!(e, PorEvent::Completed { nonce, .. } if *nonce == handle.nonce)).await;

    node0.shutdown().await;
    node1.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_times_out_after_retries() {
    let mut fast = config(true);
    fast.por.request_timeout_ms = 200;
    fast.por.max_retries = 1;
    let node0 = node(&fast).await;
    // PoR disabled: receives requests but never answers
    let node1 = node(&config(false)).await;
    let id1 = node1.node.local_id();

    let mut events0 = node0.node.subscribe();
    node0.connect(loopback(&node1)).await.unwrap();
    let handle = node0.node.initiate(id1).unwrap();

    let ev = wait_for(&mut events0, 5, |e| e.is_terminal() && e.nonce() == handle.nonce).await;
    assert!(matches!(ev, PorEvent::TimedOut { attempts: 2, .. }));
    assert_eq!(node0.node.counters().retries, 1);

    node0.shutdown().await;
    node1.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_fails_pending_session() {
    let mut slow = config(true);
    slow.por.request_timeout_ms = 30_000;
    let node0 = node(&slow).await;
    let node1 = node(&config(false)).await;
    let id1 = node1.node.local_id();

    let mut events0 = node0.node.subscribe();
    node0.connect(loopback(&node1)).await.unwrap();
    let handle = node0.node.initiate(id1).unwrap();
    wait_for(&mut events0, 5, |e| matches!(e, PorEvent::RequestSent { nonce, .. } if *nonce == handle.nonce)).await;

    node1.shutdown().await;

    let ev = wait_for(&mut events0, 5, |e| e.is_terminal() && e.nonce() == handle.nonce).await;
    assert!(matches!(ev, PorEvent::Failed { reason: FailureReason::PeerDisconnected, .. }));
    assert!(!node0.node.registry().is_connected(&id1));

    node0.shutdown().await;
}
