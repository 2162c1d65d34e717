// crates/trimatrix-p2p/tests/network.rs
//
// Loopback integration tests for the peer network: handshake, discovery,
// replication, broadcast fault containment, the ledger sync protocol, and
// the unknown-message path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use uuid::Uuid;

use trimatrix_core::{LedgerWriter, MatrixConfig, MatrixError, Triad, TriadStore};
use trimatrix_p2p::envelope::{HandshakePayload, Message};
use trimatrix_p2p::{NetworkConfig, PeerNetwork, PeerStatus, DEFAULT_PROTOCOL};
use trimatrix_store::MatrixStore;

fn temp_db_path(label: &str) -> String {
    let dir = std::env::temp_dir();
    let path = dir.join(format!("trimatrix_net_test_{}_{}", label, Uuid::new_v4()));
    path.to_string_lossy().to_string()
}

async fn open_store(label: &str) -> Arc<MatrixStore> {
    let store = MatrixStore::open(&temp_db_path(label), MatrixConfig::default()).unwrap();
    store.initialize().await.unwrap();
    Arc::new(store)
}

fn test_network_config(max_peers: usize) -> NetworkConfig {
    NetworkConfig {
        max_peers,
        discovery_interval: Duration::from_secs(3600),
        handshake_timeout: Duration::from_secs(2),
        shutdown_timeout: Duration::from_secs(1),
        ..NetworkConfig::default()
    }
}

async fn start_node(label: &str, max_peers: usize) -> (PeerNetwork, Arc<MatrixStore>) {
    let store = open_store(label).await;
    let net = PeerNetwork::new(
        test_network_config(max_peers),
        store.clone() as Arc<dyn TriadStore>,
        None,
    );
    net.start().await.unwrap();
    (net, store)
}

/// Poll until the condition holds or the deadline passes.
async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A raw scripted peer speaking the wire protocol directly.
struct RawPeer {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write: tokio::net::tcp::OwnedWriteHalf,
}

impl RawPeer {
    async fn connect(addr: &str, advertised: &str) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut raw = Self {
            lines: BufReader::new(read_half).lines(),
            write: write_half,
        };
        raw.send(&Message::Handshake(HandshakePayload {
            address: advertised.to_string(),
            protocols: vec![DEFAULT_PROTOCOL.to_string()],
        }))
        .await;
        // Consume the handshake ack.
        match raw.recv().await {
            Message::Handshake(_) => {}
            other => panic!("expected handshake ack, got {:?}", other),
        }
        raw
    }

    async fn send(&mut self, msg: &Message) {
        let line = msg.encode().unwrap();
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("recv timed out")
            .unwrap()
            .expect("connection closed");
        Message::decode(&line).unwrap()
    }
}

#[tokio::test]
async fn test_handshake_opens_both_ends() {
    let (a, _store_a) = start_node("hs_a", 10).await;
    let (b, _store_b) = start_node("hs_b", 10).await;

    a.connect(&b.advertised_addr().await).await.unwrap();

    wait_until("both ends open", || async {
        a.peer_count().await == 1 && b.peer_count().await == 1
    })
    .await;

    for net in [&a, &b] {
        let infos = net.peer_infos().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].status, PeerStatus::Open);
        assert_eq!(infos[0].protocol, DEFAULT_PROTOCOL);
    }
}

#[tokio::test]
async fn test_duplicate_and_self_dials_are_refused() {
    let (a, _store_a) = start_node("dup_a", 10).await;
    let (b, _store_b) = start_node("dup_b", 10).await;
    let b_addr = b.advertised_addr().await;

    a.connect(&b_addr).await.unwrap();
    wait_until("connected", || async { a.peer_count().await == 1 }).await;

    assert!(matches!(
        a.connect(&b_addr).await,
        Err(MatrixError::Network(_))
    ));
    let self_addr = a.advertised_addr().await;
    assert!(matches!(
        a.connect(&self_addr).await,
        Err(MatrixError::Network(_))
    ));
}

#[tokio::test]
async fn test_discovery_elicits_peers_and_dials() {
    let (a, _store_a) = start_node("disc_a", 10).await;
    let (b, _store_b) = start_node("disc_b", 10).await;
    let (c, _store_c) = start_node("disc_c", 10).await;

    // A knows only B; C is connected to B.
    a.connect(&b.advertised_addr().await).await.unwrap();
    c.connect(&b.advertised_addr().await).await.unwrap();
    wait_until("initial links", || async {
        b.peer_count().await == 2
    })
    .await;

    // A asks B for peers; the PEERS reply names C, which A then dials.
    a.broadcast(&Message::Discovery, None).await;

    wait_until("a learned c", || async { a.peer_count().await == 2 })
        .await;

    let c_addr = c.advertised_addr().await;
    let infos = a.peer_infos().await;
    assert!(infos.iter().any(|p| p.address == c_addr));
}

#[tokio::test]
async fn test_peers_reply_contains_responder_address() {
    let (a, _store_a) = start_node("peers_a", 10).await;
    let a_addr = a.advertised_addr().await;

    let mut raw = RawPeer::connect(&a_addr, "127.0.0.1:65001").await;
    raw.send(&Message::Discovery).await;

    match raw.recv().await {
        Message::Peers(p) => assert!(p.addresses.contains(&a_addr)),
        other => panic!("expected PEERS, got {:?}", other),
    }
}

#[tokio::test]
async fn test_created_triad_replicates_to_peer() {
    let (a, store_a) = start_node("repl_a", 10).await;
    let (b, store_b) = start_node("repl_b", 10).await;

    let events = store_a.subscribe(64);
    a.spawn_event_pump(events);

    a.connect(&b.advertised_addr().await).await.unwrap();
    wait_until("connected", || async { b.peer_count().await == 1 }).await;

    let triad = store_a
        .create_triad(json!({"work": "unit"}), "creator-1")
        .await
        .unwrap();

    wait_until("triad replicated", || {
        let store_b = store_b.clone();
        let id = triad.id;
        async move { store_b.get_triad(id).await.is_ok() }
    })
    .await;

    let replicated = store_b.get_triad(triad.id).await.unwrap();
    assert_eq!(replicated.creator, "creator-1");
    assert_eq!(replicated.data, json!({"work": "unit"}));
}

#[tokio::test]
async fn test_validation_outcome_replicates_to_peer() {
    let (a, store_a) = start_node("val_a", 10).await;
    let (b, store_b) = start_node("val_b", 10).await;

    let events = store_a.subscribe(64);
    a.spawn_event_pump(events);

    a.connect(&b.advertised_addr().await).await.unwrap();
    wait_until("connected", || async { b.peer_count().await == 1 }).await;

    store_a.add_validator("V2").await.unwrap();
    let triad = store_a
        .create_triad(json!({"work": "unit"}), "V1")
        .await
        .unwrap();
    let validated = store_a.validate_triad(triad.id, "V2").await.unwrap();
    assert!(validated.validated);

    wait_until("validation replicated", || {
        let store_b = store_b.clone();
        let id = triad.id;
        async move {
            matches!(store_b.get_triad(id).await, Ok(t) if t.validated)
        }
    })
    .await;

    let replicated = store_b.get_triad(triad.id).await.unwrap();
    assert_eq!(replicated.validation_attempts, 1);
    assert!((replicated.consensus - 0.7).abs() < 1e-12);
}

#[tokio::test]
async fn test_replication_crosses_a_relay_node() {
    let (a, store_a) = start_node("chain_a", 10).await;
    let (b, store_b) = start_node("chain_b", 10).await;
    let (c, store_c) = start_node("chain_c", 10).await;

    let events = store_a.subscribe(64);
    a.spawn_event_pump(events);

    // A talks only to B; C is reachable only through B's re-broadcast.
    a.connect(&b.advertised_addr().await).await.unwrap();
    b.connect(&c.advertised_addr().await).await.unwrap();
    wait_until("chain up", || async {
        b.peer_count().await == 2 && c.peer_count().await == 1
    })
    .await;

    let triad = store_a
        .create_triad(json!({"work": "unit"}), "creator-1")
        .await
        .unwrap();

    wait_until("triad reached the far node", || {
        let store_c = store_c.clone();
        let id = triad.id;
        async move { store_c.get_triad(id).await.is_ok() }
    })
    .await;

    // The flood converges: a copy that changed nothing is not re-broadcast,
    // so counts settle at exactly one triad per node.
    tokio::time::sleep(Duration::from_millis(200)).await;
    for store in [&store_a, &store_b, &store_c] {
        assert_eq!(store.metadata().await.unwrap().triad_count, 1);
    }
}

#[tokio::test]
async fn test_stalled_peer_does_not_starve_broadcast() {
    let (a, store_a) = start_node("stall_a", 10).await;
    let (b, store_b) = start_node("stall_b", 10).await;

    let events = store_a.subscribe(64);
    a.spawn_event_pump(events);

    a.connect(&b.advertised_addr().await).await.unwrap();

    // Completes the handshake, then never reads another byte.
    let _stalled = RawPeer::connect(&a.advertised_addr().await, "127.0.0.1:65041").await;
    wait_until("both peers connected", || async { a.peer_count().await == 2 }).await;

    // Enough volume to fill the stalled connection's write queue and socket
    // many times over. Its lines are dropped; the loop must not wedge behind
    // the dead connection.
    let blob = "x".repeat(32 * 1024);
    for _ in 0..100 {
        let triad = Triad::new(json!({ "blob": blob }), "creator-1".to_string(), 3);
        a.broadcast(&Message::NewTriad(triad), None).await;
    }

    // The healthy peer still gets fresh traffic end to end.
    let marker = store_a
        .create_triad(json!({"work": "marker"}), "creator-1")
        .await
        .unwrap();
    wait_until("marker reached healthy peer", || {
        let store_b = store_b.clone();
        let id = marker.id;
        async move { store_b.get_triad(id).await.is_ok() }
    })
    .await;

    // Shutdown stays bounded by its hard timeout with the peer still stalled.
    let started = tokio::time::Instant::now();
    a.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(a.peer_count().await, 0);
}

#[tokio::test]
async fn test_broadcast_survives_closed_peer() {
    let (a, store_a) = start_node("bcast_a", 10).await;
    let (b, store_b) = start_node("bcast_b", 10).await;
    let (c, _store_c) = start_node("bcast_c", 10).await;

    let events = store_a.subscribe(64);
    a.spawn_event_pump(events);

    a.connect(&b.advertised_addr().await).await.unwrap();
    a.connect(&c.advertised_addr().await).await.unwrap();
    wait_until("links up", || async { a.peer_count().await == 2 }).await;

    // C goes away; A may not have noticed yet when it broadcasts.
    c.shutdown().await;

    let triad = store_a
        .create_triad(json!({"work": "unit"}), "creator-1")
        .await
        .unwrap();

    wait_until("b still receives", || {
        let store_b = store_b.clone();
        let id = triad.id;
        async move { store_b.get_triad(id).await.is_ok() }
    })
    .await;
}

#[tokio::test]
async fn test_inbound_cap_refuses_surplus_connections() {
    let (a, _store_a) = start_node("cap_a", 1).await;
    let a_addr = a.advertised_addr().await;

    let _first = RawPeer::connect(&a_addr, "127.0.0.1:65011").await;
    wait_until("first peer open", || async { a.peer_count().await == 1 }).await;

    // The second connection is terminated without a handshake ack.
    let stream = TcpStream::connect(&a_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let hello = Message::Handshake(HandshakePayload {
        address: "127.0.0.1:65012".to_string(),
        protocols: vec![DEFAULT_PROTOCOL.to_string()],
    })
    .encode()
    .unwrap();
    write_half.write_all(hello.as_bytes()).await.unwrap();
    write_half.write_all(b"\n").await.unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let reply = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("refusal timed out")
        .unwrap();
    assert!(reply.is_none(), "expected refused connection, got {:?}", reply);
    assert_eq!(a.peer_count().await, 1);
}

#[tokio::test]
async fn test_unknown_type_gets_error_and_connection_stays_open() {
    let (a, _store_a) = start_node("unknown_a", 10).await;
    let a_addr = a.advertised_addr().await;

    let mut raw = RawPeer::connect(&a_addr, "127.0.0.1:65021").await;
    raw.send_raw(r#"{"type":"MINT_TOKENS","payload":{}}"#).await;

    match raw.recv().await {
        Message::Error(p) => assert!(p.message.contains("MINT_TOKENS")),
        other => panic!("expected ERROR, got {:?}", other),
    }

    // The connection is still serviceable.
    raw.send(&Message::GetStatus).await;
    match raw.recv().await {
        Message::StatusUpdate(meta) => assert_eq!(meta.triad_count, 0),
        other => panic!("expected STATUS_UPDATE, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sync_ledger_over_the_wire() {
    struct TestLedger {
        open: bool,
    }

    #[async_trait]
    impl LedgerWriter for TestLedger {
        fn is_open_for_new_writers(&self) -> bool {
            self.open
        }

        async fn update_ledger(&self, batch: Vec<Value>) -> Result<(), MatrixError> {
            assert!(!batch.is_empty());
            Ok(())
        }
    }

    let store = open_store("sync_node").await;
    let net = PeerNetwork::new(
        test_network_config(10),
        store as Arc<dyn TriadStore>,
        Some(Arc::new(TestLedger { open: true }) as Arc<dyn LedgerWriter>),
    );
    net.start().await.unwrap();
    let addr = net.advertised_addr().await;

    let mut raw = RawPeer::connect(&addr, "127.0.0.1:65031").await;
    raw.send(&Message::SyncLedger(
        trimatrix_p2p::envelope::SyncLedgerPayload {
            entries: vec![json!({"account": "x", "balance": 10})],
        },
    ))
    .await;

    match raw.recv().await {
        Message::SyncLedgerConfirmation(p) => assert_eq!(p.status, "success"),
        other => panic!("expected confirmation, got {:?}", other),
    }

    // A closed ledger is reported as an ERROR envelope, not a dropped link.
    let store = open_store("sync_node_closed").await;
    let net = PeerNetwork::new(
        test_network_config(10),
        store as Arc<dyn TriadStore>,
        Some(Arc::new(TestLedger { open: false }) as Arc<dyn LedgerWriter>),
    );
    net.start().await.unwrap();
    let addr = net.advertised_addr().await;

    let mut raw = RawPeer::connect(&addr, "127.0.0.1:65032").await;
    raw.send(&Message::SyncLedger(
        trimatrix_p2p::envelope::SyncLedgerPayload { entries: vec![] },
    ))
    .await;
    match raw.recv().await {
        Message::Error(p) => assert!(p.message.contains("unavailable")),
        other => panic!("expected ERROR, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_closes_peers_within_timeout() {
    let (a, _store_a) = start_node("down_a", 10).await;
    let (b, _store_b) = start_node("down_b", 10).await;

    a.connect(&b.advertised_addr().await).await.unwrap();
    wait_until("connected", || async { b.peer_count().await == 1 }).await;

    a.shutdown().await;
    assert_eq!(a.peer_count().await, 0);

    wait_until("b noticed the close", || async { b.peer_count().await == 0 }).await;
}
