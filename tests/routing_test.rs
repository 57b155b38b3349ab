//! Multi-node routing and retry behavior over the in-process transport.

use porlink::net::{Connection, MemoryHub, MemoryTransport, PeerRegistry, Route, RoutedMessage};
use porlink::{Direction, FailureReason, NetConfig, PeerId, PorEvent, PorNode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct SimNode {
    node: Arc<PorNode>,
    transport: Arc<MemoryTransport>,
}

impl SimNode {
    fn id(&self) -> PeerId {
        self.node.local_id()
    }
}

fn config() -> NetConfig {
    let mut config = NetConfig { por_enabled: true, ..Default::default() };
    config.por.request_timeout_ms = 200;
    config.por.max_retries = 2;
    config
}

fn spawn(hub: &Arc<MemoryHub>, config: &NetConfig) -> SimNode {
    let id = PeerId::random();
    let registry = Arc::new(PeerRegistry::new(id, config));
    let (transport, inbox) = hub.join(id);
    let node = PorNode::start(config, registry, transport.clone(), inbox);
    SimNode { node, transport }
}

fn link(a: &SimNode, b: &SimNode) {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    a.node.registry().on_connect(Connection::new(b.id(), addr, Direction::Outbound, true)).unwrap();
    b.node.registry().on_connect(Connection::new(a.id(), addr, Direction::Inbound, true)).unwrap();
}

async fn wait_for<F>(events: &mut broadcast::Receiver<PorEvent>, pred: F) -> PorEvent
where
    F: Fn(&PorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
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

fn saw(events: &mut broadcast::Receiver<PorEvent>, nonce: u64) -> bool {
    let mut found = false;
    while let Ok(ev) = events.try_recv() {
        found |= ev.nonce() == nonce;
    }
    found
}

#[tokio::test]
async fn test_request_crosses_intermediate_and_response_routes_back() {
    let hub = MemoryHub::new();
    let a = spawn(&hub, &config());
    let b = spawn(&hub, &config());
    let c = spawn(&hub, &config());
    link(&a, &b);
    link(&b, &c);

    // A learned earlier that C sits behind B
    a.node.routing().record_route_back(c.id(), b.id());
    assert_eq!(a.node.routing().resolve(&c.id()), Route::NextHop(b.id()));

    let mut events_a = a.node.subscribe();
    let mut events_c = c.node.subscribe();
    let nonce = 0xC0FFEE;

    a.node
        .dispatcher()
        .send(RoutedMessage::request(a.id(), c.id(), nonce, 8, b"hello".to_vec()))
        .unwrap();

    let received = wait_for(&mut events_c, |e| matches!(e, PorEvent::RequestReceived { nonce: n, .. } if *n == nonce)).await;
    assert_eq!(received.peer(), a.id());
    match received {
        PorEvent::RequestReceived { path, .. } => assert_eq!(path, vec![b.id()]),
        other => panic!("unexpected {:?}", other),
    }

    // C is not connected to A; its answer follows the learned route back through B
    assert_eq!(c.node.routing().resolve(&a.id()), Route::NextHop(b.id()));
    let answered = wait_for(&mut events_a, |e| matches!(e, PorEvent::ResponseReceived { nonce: n, .. } if *n == nonce)).await;
    assert_eq!(answered.peer(), c.id());
    match answered {
        PorEvent::ResponseReceived { path, .. } => assert_eq!(path, vec![b.id()]),
        other => panic!("unexpected {:?}", other),
    }

    assert!(b.node.counters().forwarded >= 2);
}

#[tokio::test]
async fn test_ttl_one_stops_at_first_hop() {
    let hub = MemoryHub::new();
    let a = spawn(&hub, &config());
    let b = spawn(&hub, &config());
    let c = spawn(&hub, &config());
    link(&a, &b);
    link(&b, &c);
    a.node.routing().record_route_back(c.id(), b.id());

    let mut events_c = c.node.subscribe();
    let nonce = 0xDEAD;
    a.node
        .dispatcher()
        .send(RoutedMessage::request(a.id(), c.id(), nonce, 1, vec![]))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!saw(&mut events_c, nonce));
    assert_eq!(b.node.counters().ttl_expired, 1);
}

#[tokio::test]
async fn test_lost_request_is_retried_with_same_nonce() {
    let hub = MemoryHub::new();
    let a = spawn(&hub, &config());
    let b = spawn(&hub, &config());
    let mut events_a = a.node.subscribe();

    a.transport.set_lossy(b.id(), true);
    link(&a, &b);
    let handle = a.node.initiate(b.id()).unwrap();

    wait_for(&mut events_a, |e| {
        matches!(e, PorEvent::RequestSent { nonce, attempt: 2, .. } if *nonce == handle.nonce)
    })
    .await;
    a.transport.set_lossy(b.id(), false);

    let done = wait_for(&mut events_a, |e| e.is_terminal() && e.nonce() == handle.nonce).await;
    assert!(matches!(done, PorEvent::Completed { .. }));
    assert!(a.node.counters().retries >= 1);
    assert!(a.node.registry().safe_peers().contains(&b.id()));
}

#[tokio::test]
async fn test_unanswered_session_times_out() {
    let hub = MemoryHub::new();
    let a = spawn(&hub, &config());
    let b = spawn(&hub, &config());
    let mut events_a = a.node.subscribe();

    a.transport.set_lossy(b.id(), true);
    link(&a, &b);
    let handle = a.node.initiate(b.id()).unwrap();

    let done = wait_for(&mut events_a, |e| e.is_terminal() && e.nonce() == handle.nonce).await;
    assert!(matches!(done, PorEvent::TimedOut { attempts: 3, .. }));
    assert!(!a.node.registry().safe_peers().contains(&b.id()));

    // Nothing fires for that session afterwards
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!saw(&mut events_a, handle.nonce));
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_session() {
    let hub = MemoryHub::new();
    let mut slow = config();
    slow.por.request_timeout_ms = 10_000;
    let a = spawn(&hub, &slow);
    let b = spawn(&hub, &slow);
    let mut events_a = a.node.subscribe();

    a.transport.set_lossy(b.id(), true);
    link(&a, &b);
    let handle = a.node.initiate(b.id()).unwrap();

    a.node.registry().on_disconnect(&b.id());

    let done = wait_for(&mut events_a, |e| e.is_terminal() && e.nonce() == handle.nonce).await;
    assert!(matches!(done, PorEvent::Failed { reason: FailureReason::PeerDisconnected, .. }));
    assert_eq!(a.node.manager().pending_count(), 0);
    assert_eq!(a.node.routing().resolve(&b.id()), Route::Unreachable);
}
