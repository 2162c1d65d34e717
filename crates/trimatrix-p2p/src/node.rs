// crates/trimatrix-p2p/src/node.rs
//
// PeerNetwork: maintains a bounded set of bidirectional peer connections
// and propagates domain events.
//
// Per connection: one writer task draining a bounded line queue, one reader
// loop dispatching decoded messages. Transport failures evict the peer and
// are never surfaced past this layer; protocol failures are answered with
// ERROR envelopes on a connection that stays open. Fan-out never waits on a
// slow peer: a full write queue drops the line for that peer only.
//
// Dials requested by discovery go through a queue drained by a dedicated
// dialer task, so message dispatch never re-enters `connect`.
//
// Replication messages are re-broadcast (originator excluded) only when
// they changed local state, so floods terminate on convergence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use trimatrix_core::{LedgerWriter, MatrixError, MatrixEvent, Triad, TriadStore};

use crate::envelope::{
    negotiate_protocol, DecodeError, ErrorPayload, HandshakePayload, Message, PeersPayload,
    DEFAULT_PROTOCOL,
};
use crate::peer::{Peer, PeerDirection, PeerInfo, PeerSet, PeerStatus};
use crate::sync::handle_sync_ledger;

/// Capacity of each connection's outgoing line queue.
const WRITE_QUEUE_CAPACITY: usize = 64;

/// Capacity of the discovery dial queue.
const DIAL_QUEUE_CAPACITY: usize = 32;

/// Network layer configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to listen on. Port 0 picks an ephemeral port.
    pub listen_addr: String,
    /// Address announced to peers in handshakes and PEERS lists.
    /// Empty: derived from the bound listener address.
    pub advertised_addr: String,
    /// Connection cap, inbound and outbound combined.
    pub max_peers: usize,
    /// Protocol label offered during handshake.
    pub protocol: String,
    /// Interval of the periodic discovery check.
    pub discovery_interval: Duration,
    /// Bound on outbound dial + handshake.
    pub handshake_timeout: Duration,
    /// Bound on graceful shutdown before connections are force-closed.
    pub shutdown_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            advertised_addr: String::new(),
            max_peers: trimatrix_core::DEFAULT_MAX_PEERS,
            protocol: DEFAULT_PROTOCOL.to_string(),
            discovery_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// The peer network node.
///
/// Cheap to clone; clones share the peer set and the shutdown token, and
/// spawned tasks capture a clone of the whole node.
#[derive(Clone)]
pub struct PeerNetwork {
    config: Arc<NetworkConfig>,
    store: Arc<dyn TriadStore>,
    ledger: Option<Arc<dyn LedgerWriter>>,
    peers: Arc<RwLock<PeerSet>>,
    advertised: Arc<RwLock<String>>,
    /// Addresses queued for the dialer task.
    dial_tx: mpsc::Sender<String>,
    /// Receiver side, taken by the dialer task on `start`.
    dial_rx: Arc<Mutex<Option<mpsc::Receiver<String>>>>,
    shutdown: CancellationToken,
}

impl PeerNetwork {
    pub fn new(
        config: NetworkConfig,
        store: Arc<dyn TriadStore>,
        ledger: Option<Arc<dyn LedgerWriter>>,
    ) -> Self {
        let advertised = Arc::new(RwLock::new(config.advertised_addr.clone()));
        let (dial_tx, dial_rx) = mpsc::channel(DIAL_QUEUE_CAPACITY);
        Self {
            config: Arc::new(config),
            store,
            ledger,
            peers: Arc::new(RwLock::new(PeerSet::new())),
            advertised,
            dial_tx,
            dial_rx: Arc::new(Mutex::new(Some(dial_rx))),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the listener and spawn the accept and discovery loops.
    ///
    /// Returns the bound local address.
    pub async fn start(&self) -> Result<SocketAddr, MatrixError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| {
                MatrixError::Network(format!("bind {} failed: {}", self.config.listen_addr, e))
            })?;
        let local = listener
            .local_addr()
            .map_err(|e| MatrixError::Network(e.to_string()))?;

        {
            let mut advertised = self.advertised.write().await;
            if advertised.is_empty() {
                *advertised = local.to_string();
            }
        }

        tracing::info!(addr = %local, "Peer network listening");

        let accept_net = self.clone();
        tokio::spawn(async move { accept_net.accept_loop(listener).await });

        let discovery_net = self.clone();
        tokio::spawn(async move { discovery_net.discovery_loop().await });

        if let Some(queue) = self.dial_rx.lock().await.take() {
            let dialer = self.clone();
            tokio::spawn(async move { dialer.dial_loop(queue).await });
        }

        Ok(local)
    }

    /// The address this node announces to peers.
    pub async fn advertised_addr(&self) -> String {
        self.advertised.read().await.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.read().await.infos()
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            // Refuse inbound connections beyond the cap.
                            if self.peers.read().await.len() >= self.config.max_peers {
                                tracing::warn!(%remote, "Peer cap reached, refusing inbound connection");
                                drop(stream);
                                continue;
                            }
                            let net = self.clone();
                            tokio::spawn(async move { net.run_inbound(stream, remote).await });
                        }
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn run_inbound(self, stream: TcpStream, remote: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let (tx, rx) = mpsc::channel::<String>(WRITE_QUEUE_CAPACITY);
        tokio::spawn(writer_task(write_half, rx));

        // The connection opens with the dialer's HANDSHAKE.
        let handshake = match read_handshake(&mut lines, self.config.handshake_timeout).await {
            Ok(hs) => hs,
            Err(e) => {
                tracing::debug!(%remote, "Inbound handshake failed: {}", e);
                return;
            }
        };

        let peer_addr = if handshake.address.is_empty() {
            remote.to_string()
        } else {
            handshake.address.clone()
        };
        let protocol = negotiate_protocol(&handshake.protocols);

        {
            let mut peers = self.peers.write().await;
            if peers.len() >= self.config.max_peers || peers.contains(&peer_addr) {
                tracing::debug!(peer = %peer_addr, "Refusing duplicate or over-cap inbound peer");
                return;
            }
            peers.insert(Peer::new(
                peer_addr.clone(),
                PeerDirection::Inbound,
                protocol.clone(),
                tx.clone(),
            ));
        }

        // Acknowledge with our own handshake carrying the agreed label.
        let ack = Message::Handshake(HandshakePayload {
            address: self.advertised_addr().await,
            protocols: vec![protocol.clone()],
        });
        if let Err(e) = self.send_to(&peer_addr, &ack).await {
            tracing::debug!(peer = %peer_addr, "Handshake ack failed: {}", e);
            self.evict(&peer_addr).await;
            return;
        }

        tracing::info!(peer = %peer_addr, %protocol, "Inbound peer connected");
        self.read_loop(&mut lines, &peer_addr).await;
        self.evict(&peer_addr).await;
    }

    /// Initiate an outbound connection.
    ///
    /// Refused past the cap or to an already-connected address. The dial and
    /// handshake are bounded by the handshake timeout; on expiry the attempt
    /// is abandoned and the slot freed.
    pub async fn connect(&self, addr: &str) -> Result<(), MatrixError> {
        if addr == self.advertised_addr().await {
            return Err(MatrixError::Network("refusing to dial self".to_string()));
        }

        {
            let peers = self.peers.read().await;
            if peers.len() >= self.config.max_peers {
                return Err(MatrixError::Network("peer cap reached".to_string()));
            }
            if peers.contains(addr) {
                return Err(MatrixError::Network(format!("already connected to {}", addr)));
            }
        }

        let stream = tokio::time::timeout(self.config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MatrixError::Network(format!("dial {} timed out", addr)))?
            .map_err(|e| MatrixError::Network(format!("dial {} failed: {}", addr, e)))?;

        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let (tx, rx) = mpsc::channel::<String>(WRITE_QUEUE_CAPACITY);
        tokio::spawn(writer_task(write_half, rx));

        // Reserve the slot while the handshake is in flight.
        {
            let mut peers = self.peers.write().await;
            if peers.contains(addr) {
                return Err(MatrixError::Network(format!("already connected to {}", addr)));
            }
            let mut peer = Peer::new(
                addr.to_string(),
                PeerDirection::Outbound,
                self.config.protocol.clone(),
                tx.clone(),
            );
            peer.info.status = PeerStatus::Connecting;
            peers.insert(peer);
        }

        let hello = Message::Handshake(HandshakePayload {
            address: self.advertised_addr().await,
            protocols: vec![self.config.protocol.clone()],
        });
        let result = async {
            self.send_to(addr, &hello).await?;
            read_handshake(&mut lines, self.config.handshake_timeout).await
        }
        .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                // Abandon the attempt and free the slot.
                self.peers.write().await.remove(addr);
                return Err(e);
            }
        };

        let protocol = negotiate_protocol(&reply.protocols);
        {
            let mut peers = self.peers.write().await;
            let Some(mut peer) = peers.remove(addr) else {
                return Err(MatrixError::Network(format!("peer {} vanished", addr)));
            };
            peer.info.status = PeerStatus::Open;
            peer.info.protocol = protocol.clone();
            peers.insert(peer);
        }

        tracing::info!(peer = %addr, %protocol, "Outbound peer connected");

        let net = self.clone();
        let peer_addr = addr.to_string();
        tokio::spawn(async move {
            net.read_loop(&mut lines, &peer_addr).await;
            net.evict(&peer_addr).await;
        });

        Ok(())
    }

    async fn read_loop(
        &self,
        lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
        peer_addr: &str,
    ) {
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };

            match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = match Message::decode(&line) {
                        Ok(msg) => self.handle_message(peer_addr, msg).await,
                        Err(DecodeError::UnknownType(kind)) => {
                            tracing::warn!(peer = %peer_addr, %kind, "Unknown message type");
                            Some(Message::Error(ErrorPayload {
                                message: format!("unknown message type: {}", kind),
                            }))
                        }
                        Err(DecodeError::Malformed(detail)) => {
                            tracing::warn!(peer = %peer_addr, "Malformed message: {}", detail);
                            Some(Message::Error(ErrorPayload {
                                message: format!("malformed message: {}", detail),
                            }))
                        }
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = self.send_to(peer_addr, &reply).await {
                            tracing::debug!(peer = %peer_addr, "Reply failed: {}", e);
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %peer_addr, "Connection read error: {}", e);
                    break;
                }
            }
        }
    }

    /// Dispatch one decoded message; the return value is sent back to the
    /// originating peer.
    async fn handle_message(&self, peer_addr: &str, msg: Message) -> Option<Message> {
        match msg {
            Message::Handshake(_) => {
                // Connection is already open; a repeat handshake is harmless.
                tracing::debug!(peer = %peer_addr, "Redundant handshake acknowledged");
                None
            }
            Message::Discovery => {
                let mut addresses = vec![self.advertised_addr().await];
                for addr in self.peers.read().await.addresses() {
                    if addr != peer_addr {
                        addresses.push(addr);
                    }
                }
                Some(Message::Peers(PeersPayload { addresses }))
            }
            Message::Peers(payload) => {
                self.dial_discovered(payload.addresses).await;
                None
            }
            Message::NewTriad(triad) => {
                let id = triad.id;
                match self.store.apply_remote_triad(triad.clone()).await {
                    Ok(true) => {
                        tracing::debug!(%id, peer = %peer_addr, "Remote triad applied");
                        self.broadcast(&Message::NewTriad(triad), Some(peer_addr)).await;
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(%id, "Failed to apply remote triad: {}", e),
                }
                None
            }
            Message::ValidateTriad(triad) => {
                self.apply_validation(peer_addr, triad, false).await;
                None
            }
            Message::ValidatedConfirmation(triad) => {
                self.apply_validation(peer_addr, triad, true).await;
                None
            }
            Message::GetStatus => match self.store.metadata().await {
                Ok(meta) => Some(Message::StatusUpdate(meta)),
                Err(e) => Some(Message::Error(ErrorPayload {
                    message: e.to_string(),
                })),
            },
            Message::StatusUpdate(meta) => {
                tracing::info!(
                    peer = %peer_addr,
                    triads = meta.triad_count,
                    validated = meta.validated_count,
                    "Peer status"
                );
                None
            }
            Message::SyncLedger(payload) => {
                Some(handle_sync_ledger(self.ledger.as_ref(), payload.entries).await)
            }
            Message::SyncLedgerConfirmation(payload) => {
                tracing::debug!(peer = %peer_addr, status = %payload.status, "Ledger sync confirmed");
                None
            }
            Message::Error(payload) => {
                tracing::warn!(peer = %peer_addr, "Peer reported error: {}", payload.message);
                None
            }
        }
    }

    async fn apply_validation(&self, peer_addr: &str, triad: Triad, confirmed: bool) {
        let id = triad.id;
        match self.store.apply_remote_validation(triad.clone()).await {
            Ok(true) => {
                let msg = if confirmed {
                    Message::ValidatedConfirmation(triad)
                } else {
                    Message::ValidateTriad(triad)
                };
                self.broadcast(&msg, Some(peer_addr)).await;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(%id, "Failed to apply remote validation: {}", e),
        }
    }

    /// Queue addresses learned from a PEERS message for the dialer task,
    /// respecting the cap.
    async fn dial_discovered(&self, addresses: Vec<String>) {
        let own = self.advertised_addr().await;
        for addr in addresses {
            if addr == own {
                continue;
            }
            {
                let peers = self.peers.read().await;
                if peers.len() >= self.config.max_peers {
                    break;
                }
                if peers.contains(&addr) {
                    continue;
                }
            }
            if self.dial_tx.try_send(addr).is_err() {
                tracing::debug!("Dial queue full, deferring to the next discovery round");
                break;
            }
        }
    }

    /// Drain queued discovery dials, one outbound attempt at a time.
    async fn dial_loop(self, mut queue: mpsc::Receiver<String>) {
        loop {
            let addr = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                addr = queue.recv() => match addr {
                    Some(addr) => addr,
                    None => break,
                },
            };
            if let Err(e) = self.connect(&addr).await {
                tracing::debug!(peer = %addr, "Discovered peer dial failed: {}", e);
            }
        }
    }

    async fn send_to(&self, addr: &str, msg: &Message) -> Result<(), MatrixError> {
        let line = msg.encode()?;
        // Clone the queue handle out of the peer set so the send does not
        // hold the set lock while waiting for queue space.
        let tx = {
            let peers = self.peers.read().await;
            let found = peers.iter().find(|p| p.info.address == addr);
            match found {
                Some(peer) => peer.sender(),
                None => {
                    return Err(MatrixError::Network(format!("peer {} not connected", addr)))
                }
            }
        };
        tx.send(line)
            .await
            .map_err(|_| MatrixError::Network(format!("peer {} write queue closed", addr)))
    }

    /// Best-effort fan-out to all open peers except the optional originator.
    ///
    /// Never waits on a slow peer: a full write queue drops the line for
    /// that peer, with a warning, and delivery to the rest continues.
    pub async fn broadcast(&self, msg: &Message, originator: Option<&str>) {
        let line = match msg.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode {} broadcast: {}", msg.kind(), e);
                return;
            }
        };

        let peers = self.peers.read().await;
        for peer in peers.iter() {
            if peer.info.status != PeerStatus::Open {
                continue;
            }
            if originator == Some(peer.info.address.as_str()) {
                continue;
            }
            if let Err(e) = peer.try_send(line.clone()) {
                tracing::warn!(peer = %peer.info.address, "Broadcast delivery failed: {}", e);
            }
        }
    }

    async fn evict(&self, addr: &str) {
        let removed = {
            let mut peers = self.peers.write().await;
            peers.remove(addr)
        };
        if let Some(mut peer) = removed {
            peer.info.status = PeerStatus::Closed;
            tracing::info!(peer = %addr, "Peer disconnected");
        }
        if !self.shutdown.is_cancelled() {
            self.maybe_request_peers().await;
        }
    }

    /// Broadcast DISCOVERY when the active set has fallen below half the cap.
    async fn maybe_request_peers(&self) {
        let len = self.peers.read().await.len();
        if len < self.config.max_peers / 2 && len > 0 {
            tracing::debug!(peers = len, "Below target peer count, requesting more");
            self.broadcast(&Message::Discovery, None).await;
        }
    }

    async fn discovery_loop(self) {
        let mut interval = tokio::time::interval(self.config.discovery_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.maybe_request_peers().await,
            }
        }
    }

    /// Forward store events to the network as replication messages.
    pub fn spawn_event_pump(&self, mut events: mpsc::Receiver<MatrixEvent>) {
        let net = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = net.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(MatrixEvent::TriadCreated(triad)) => {
                        net.broadcast(&Message::NewTriad(triad), None).await;
                    }
                    Some(MatrixEvent::TriadValidated(triad)) => {
                        let msg = if triad.validated {
                            Message::ValidatedConfirmation(triad)
                        } else {
                            Message::ValidateTriad(triad)
                        };
                        net.broadcast(&msg, None).await;
                    }
                    None => break,
                }
            }
        });
    }

    /// Cooperative shutdown: notify peers, close connections gracefully,
    /// and force-terminate whatever is still open after the hard timeout.
    pub async fn shutdown(&self) {
        tracing::info!("Peer network shutting down");
        // Cancel first so the hard deadline below is the real bound; the
        // farewell is best-effort and may miss peers that close faster.
        self.shutdown.cancel();
        self.broadcast(
            &Message::Error(ErrorPayload {
                message: "node shutting down".to_string(),
            }),
            None,
        )
        .await;

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while tokio::time::Instant::now() < deadline {
            if self.peers.read().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut peers = self.peers.write().await;
        if !peers.is_empty() {
            tracing::warn!(
                remaining = peers.len(),
                "Force-closing connections after shutdown timeout"
            );
            for addr in peers.addresses() {
                peers.remove(&addr);
            }
        }
    }
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Read and decode the first HANDSHAKE line within the timeout.
async fn read_handshake(
    lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
    timeout: Duration,
) -> Result<HandshakePayload, MatrixError> {
    let line = tokio::time::timeout(timeout, lines.next_line())
        .await
        .map_err(|_| MatrixError::Network("handshake timed out".to_string()))?
        .map_err(|e| MatrixError::Network(format!("handshake read failed: {}", e)))?
        .ok_or_else(|| MatrixError::Network("connection closed during handshake".to_string()))?;

    match Message::decode(&line) {
        Ok(Message::Handshake(payload)) => Ok(payload),
        Ok(other) => Err(MatrixError::Protocol(format!(
            "expected HANDSHAKE, got {}",
            other.kind()
        ))),
        Err(DecodeError::UnknownType(kind)) => Err(MatrixError::Protocol(format!(
            "expected HANDSHAKE, got {}",
            kind
        ))),
        Err(DecodeError::Malformed(detail)) => Err(MatrixError::Protocol(detail)),
    }
}
