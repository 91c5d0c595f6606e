//! The transport: peer and index registries, the send and receive
//! pipelines, and the control surface.
//!
//! Outbound, per peer: IP packets stage in a drop-oldest queue, drain
//! through the global encryption queue (counter and pipeline sequence
//! assigned together, so nonce order matches dispatch order), get sealed by
//! parallel workers, and leave the socket in staging order via a per-peer
//! reorder stage.
//!
//! Inbound: the receive loop demultiplexes on the type field. Handshake
//! messages go through the MAC-gated handshake queue; transport messages
//! are resolved against the index table and opened by parallel decryption
//! workers, then delivered in order per peer with replay validation.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::bind::UdpBind;
use crate::config::Config;
use crate::error::{ProtocolError, Result};
use crate::keypair::Keypair;
use crate::peer::{Peer, PeerStats};
use crate::protocol::cookie::CookieChecker;
use crate::protocol::handshake::{self, HandshakeState, StaticIdentity};
use crate::protocol::index::{IndexEntry, IndexTable};
use crate::protocol::messages::{
    self, MessageCookieReply, MessageInitiation, MessageResponse, MessageType, TransportHeader,
};
use crate::protocol::{
    MAX_TIMER_HANDSHAKES, QUEUE_HANDSHAKE_SIZE, QUEUE_PIPELINE_SIZE, REKEY_TIMEOUT,
};
use crate::timers;

const MAX_UDP_SIZE: usize = (1 << 16) - 1;

/// How long a queue-depth spike keeps the cookie machinery engaged.
const UNDER_LOAD_AFTER: Duration = Duration::from_secs(1);

/// A decrypted packet handed to the host stack, tagged with the peer it
/// arrived from.
#[derive(Debug)]
pub struct InboundPacket {
    pub peer: [u8; 32],
    pub packet: Vec<u8>,
}

/// Options for a new peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerOptions {
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<Duration>,
}

pub(crate) struct EncryptJob {
    peer: Arc<Peer>,
    keypair: Arc<Keypair>,
    counter: u64,
    seq: u64,
    packet: Vec<u8>,
}

pub(crate) struct DecryptJob {
    peer: Arc<Peer>,
    keypair: Arc<Keypair>,
    counter: u64,
    seq: u64,
    ciphertext: Vec<u8>,
    src: SocketAddr,
}

struct HandshakeJob {
    datagram: Vec<u8>,
    src: SocketAddr,
}

/// A sealed datagram (or a hole, if sealing failed) flowing to the
/// per-peer outbound reorder stage.
pub(crate) struct SequencedOutbound {
    seq: u64,
    datagram: Option<Vec<u8>>,
    is_keepalive: bool,
}

pub(crate) struct DecryptedPacket {
    keypair: Arc<Keypair>,
    counter: u64,
    plaintext: Vec<u8>,
    src: SocketAddr,
}

/// An opened packet (or a hole, if authentication failed) flowing to the
/// per-peer inbound reorder stage.
pub(crate) struct SequencedInbound {
    seq: u64,
    packet: Option<DecryptedPacket>,
}

pub(crate) struct TransportInner {
    identity: RwLock<StaticIdentity>,
    peers: RwLock<HashMap<[u8; 32], Arc<Peer>>>,
    pub(crate) index_table: IndexTable,
    cookie_checker: CookieChecker,
    bind: Arc<dyn UdpBind>,
    encrypt_tx: mpsc::Sender<EncryptJob>,
    decrypt_tx: mpsc::Sender<DecryptJob>,
    handshake_tx: mpsc::Sender<HandshakeJob>,
    inbound_tx: mpsc::Sender<InboundPacket>,
    under_load_until: Mutex<Option<Instant>>,
    stop_tx: watch::Sender<bool>,
    started: AtomicBool,
}

struct Receivers {
    encrypt_rx: mpsc::Receiver<EncryptJob>,
    decrypt_rx: mpsc::Receiver<DecryptJob>,
    handshake_rx: mpsc::Receiver<HandshakeJob>,
}

/// The secure tunnel transport. See the crate docs for the pipeline layout.
pub struct Transport {
    inner: Arc<TransportInner>,
    receivers: Mutex<Option<Receivers>>,
}

impl Transport {
    /// Build a transport around a private key and a bound UDP endpoint.
    /// Returns the transport and the channel on which decrypted inbound
    /// packets are delivered (in per-peer order) for host-stack injection.
    pub fn new(
        private_key: [u8; 32],
        bind: Arc<dyn UdpBind>,
    ) -> (Self, mpsc::Receiver<InboundPacket>) {
        let identity = StaticIdentity::new(private_key);
        let cookie_checker = CookieChecker::new(&identity.public);

        let (encrypt_tx, encrypt_rx) = mpsc::channel(QUEUE_PIPELINE_SIZE);
        let (decrypt_tx, decrypt_rx) = mpsc::channel(QUEUE_PIPELINE_SIZE);
        let (handshake_tx, handshake_rx) = mpsc::channel(QUEUE_HANDSHAKE_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_PIPELINE_SIZE);
        let (stop_tx, _) = watch::channel(false);

        let inner = Arc::new(TransportInner {
            identity: RwLock::new(identity),
            peers: RwLock::new(HashMap::new()),
            index_table: IndexTable::new(),
            cookie_checker,
            bind,
            encrypt_tx,
            decrypt_tx,
            handshake_tx,
            inbound_tx,
            under_load_until: Mutex::new(None),
            stop_tx,
            started: AtomicBool::new(false),
        });

        (
            Self {
                inner,
                receivers: Mutex::new(Some(Receivers {
                    encrypt_rx,
                    decrypt_rx,
                    handshake_rx,
                })),
            },
            inbound_rx,
        )
    }

    /// Build a transport from a parsed [`Config`] document, adding every
    /// configured peer.
    pub fn from_config(
        config: &Config,
        bind: Arc<dyn UdpBind>,
    ) -> Result<(Self, mpsc::Receiver<InboundPacket>)> {
        let private_key = config.private_key_bytes()?;
        let (transport, inbound_rx) = Self::new(private_key, bind);
        for peer in &config.peers {
            transport.add_peer(
                peer.public_key_bytes()?,
                PeerOptions {
                    endpoint: peer.endpoint_addr()?,
                    ..Default::default()
                },
            )?;
        }
        Ok((transport, inbound_rx))
    }

    /// Spawn the worker pipelines and per-peer tasks. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(receivers) = self.receivers.lock().take() else {
            return;
        };

        let stop_rx = self.inner.stop_tx.subscribe();
        tokio::spawn(receive_loop(self.inner.clone(), stop_rx));

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let encrypt_rx = Arc::new(AsyncMutex::new(receivers.encrypt_rx));
        let decrypt_rx = Arc::new(AsyncMutex::new(receivers.decrypt_rx));
        for _ in 0..workers {
            tokio::spawn(encryption_worker(
                encrypt_rx.clone(),
                self.inner.stop_tx.subscribe(),
            ));
            tokio::spawn(decryption_worker(
                decrypt_rx.clone(),
                self.inner.stop_tx.subscribe(),
            ));
        }

        tokio::spawn(handshake_worker(
            self.inner.clone(),
            receivers.handshake_rx,
            self.inner.stop_tx.subscribe(),
        ));

        let peers: Vec<_> = self.inner.peers.read().values().cloned().collect();
        for peer in peers {
            self.inner.spawn_peer_tasks(&peer);
        }
        tracing::info!(workers, "transport started");
    }

    /// Register a peer by its static public key.
    pub fn add_peer(&self, public_key: [u8; 32], options: PeerOptions) -> Result<()> {
        // Re-adding replaces the old peer wholesale.
        if self.inner.peers.read().contains_key(&public_key) {
            self.remove_peer(&public_key);
        }

        let precomputed = {
            let identity = self.inner.identity.read();
            identity.precompute_shared(&public_key)
        };
        let peer = Arc::new(Peer::new(
            public_key,
            options.preshared_key.unwrap_or([0u8; 32]),
            precomputed,
        ));
        if let Some(endpoint) = options.endpoint {
            peer.set_endpoint(endpoint);
        }
        *peer.timers.persistent_keepalive_interval.lock() = options.persistent_keepalive;

        self.inner.peers.write().insert(public_key, peer.clone());
        if self.inner.started.load(Ordering::SeqCst) {
            self.inner.spawn_peer_tasks(&peer);
        }
        tracing::info!("added peer");
        Ok(())
    }

    /// Remove a peer: stop its tasks, drain its queues, zero its keys, and
    /// revoke its indices.
    pub fn remove_peer(&self, public_key: &[u8; 32]) {
        let peer = self.inner.peers.write().remove(public_key);
        if let Some(peer) = peer {
            self.inner.stop_peer(&peer);
            tracing::info!("removed peer");
        }
    }

    /// Point a peer at a new endpoint.
    pub fn update_endpoint(&self, public_key: &[u8; 32], endpoint: SocketAddr) -> Result<()> {
        let peer = self
            .inner
            .peer_by_key(public_key)
            .ok_or(ProtocolError::UnknownPeer)?;
        peer.set_endpoint(endpoint);
        Ok(())
    }

    /// Enable or disable persistent keepalives for a peer.
    pub fn set_persistent_keepalive(
        &self,
        public_key: &[u8; 32],
        interval: Option<Duration>,
    ) -> Result<()> {
        let peer = self
            .inner
            .peer_by_key(public_key)
            .ok_or(ProtocolError::UnknownPeer)?;
        *peer.timers.persistent_keepalive_interval.lock() = interval;
        peer.timers.any_authenticated_packet_traversal();
        Ok(())
    }

    /// Queue an outbound IP packet for a peer, initiating a handshake if no
    /// usable session exists yet.
    pub async fn send_packet(&self, public_key: &[u8; 32], packet: Vec<u8>) -> Result<()> {
        let peer = self
            .inner
            .peer_by_key(public_key)
            .ok_or(ProtocolError::UnknownPeer)?;
        if !peer.is_running() {
            return Err(ProtocolError::PeerNotRunning.into());
        }
        peer.stage(packet);
        self.inner.send_staged_packets(&peer).await;
        Ok(())
    }

    /// Traffic counters and last-handshake time for a peer.
    pub fn stats(&self, public_key: &[u8; 32]) -> Result<PeerStats> {
        let peer = self
            .inner
            .peer_by_key(public_key)
            .ok_or(ProtocolError::UnknownPeer)?;
        Ok(peer.stats())
    }

    /// Replace the static identity. Every peer's precomputed secret is
    /// rederived and every session expired; peers must handshake afresh.
    pub fn set_private_key(&self, private_key: [u8; 32]) {
        let identity = StaticIdentity::new(private_key);
        self.inner.cookie_checker.reinit(&identity.public);

        let peers: Vec<_> = self.inner.peers.read().values().cloned().collect();
        for peer in &peers {
            let precomputed = identity.precompute_shared(&peer.remote_static);
            let mut hs = peer.handshake.write();
            hs.precomputed_static_static = precomputed;
            self.inner.index_table.delete(hs.local_index);
            hs.clear();
            drop(hs);
            peer.keypairs.clear(&self.inner.index_table);
        }
        *self.inner.identity.write() = identity;
        tracing::info!("static identity replaced, all sessions expired");
    }

    /// The local static public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.inner.identity.read().public
    }

    /// Shut everything down: workers exit, peers stop, queues drain, the
    /// bind is closed. Keys are zeroed as peers drop their sessions.
    pub fn close(&self) {
        let _ = self.inner.stop_tx.send(true);
        let peers: Vec<_> = {
            let mut map = self.inner.peers.write();
            map.drain().map(|(_, peer)| peer).collect()
        };
        for peer in &peers {
            self.inner.stop_peer(peer);
        }
        self.inner.bind.close();
        tracing::info!("transport closed");
    }
}

impl TransportInner {
    fn peer_by_key(&self, public_key: &[u8; 32]) -> Option<Arc<Peer>> {
        self.peers.read().get(public_key).cloned()
    }

    fn spawn_peer_tasks(self: &Arc<Self>, peer: &Arc<Peer>) {
        let (out_tx, out_rx) = mpsc::channel(QUEUE_PIPELINE_SIZE);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_PIPELINE_SIZE);
        *peer.outbound.lock() = Some(out_tx);
        *peer.inbound.lock() = Some(in_tx);
        peer.set_running(true);

        tokio::spawn(outbound_dispatcher(self.clone(), peer.clone(), out_rx));
        tokio::spawn(inbound_dispatcher(self.clone(), peer.clone(), in_rx));
        tokio::spawn(timers::run(
            self.clone(),
            peer.clone(),
            self.stop_tx.subscribe(),
        ));
    }

    fn stop_peer(&self, peer: &Arc<Peer>) {
        peer.set_running(false);
        peer.timers.stop_all();
        // Dropping the senders lets the dispatchers drain and exit.
        *peer.outbound.lock() = None;
        *peer.inbound.lock() = None;
        peer.drain_staging();
        peer.keypairs.clear(&self.index_table);
        let mut hs = peer.handshake.write();
        self.index_table.delete(hs.local_index);
        hs.clear();
    }

    /// Queue-depth load signal, sticky for a second.
    fn is_under_load(&self) -> bool {
        let occupied = self.handshake_tx.max_capacity() - self.handshake_tx.capacity();
        let now = Instant::now();
        let mut until = self.under_load_until.lock();
        if occupied >= QUEUE_HANDSHAKE_SIZE / 8 {
            *until = Some(now + UNDER_LOAD_AFTER);
            return true;
        }
        matches!(*until, Some(t) if t > now)
    }

    /// Drain the staging queue into the encryption pipeline under the
    /// current keypair, allocating counters and pipeline sequence numbers
    /// in one ordered pass. Packets stay staged while no usable keypair
    /// exists; counter exhaustion drops the remainder and requests a rekey.
    pub(crate) async fn send_staged_packets(self: &Arc<Self>, peer: &Arc<Peer>) {
        let keypair = match peer.keypairs.current() {
            Some(kp) if !kp.expired() => kp,
            _ => {
                self.initiate_handshake(peer, false).await;
                return;
            }
        };
        if keypair.wants_rekey() {
            self.initiate_handshake(peer, false).await;
        }

        let mut jobs = Vec::new();
        let mut exhausted = false;
        for packet in peer.drain_staging() {
            if exhausted {
                break;
            }
            match keypair.next_counter() {
                Ok(counter) => {
                    let seq = peer.tx_seq.fetch_add(1, Ordering::Relaxed);
                    jobs.push(EncryptJob {
                        peer: peer.clone(),
                        keypair: keypair.clone(),
                        counter,
                        seq,
                        packet,
                    });
                }
                Err(_) => exhausted = true,
            }
        }
        if exhausted {
            tracing::debug!("outbound counter exhausted, requesting rekey");
            self.initiate_handshake(peer, false).await;
        }
        for job in jobs {
            if self.encrypt_tx.send(job).await.is_err() {
                break;
            }
        }
    }

    /// Send a keepalive (an empty transport message), unless real traffic
    /// is already staged to do the job.
    pub(crate) async fn send_keepalive(self: &Arc<Self>, peer: &Arc<Peer>) {
        if peer.staging_is_empty() {
            peer.stage(Vec::new());
        }
        self.send_staged_packets(peer).await;
    }

    /// Build, stamp, and send a handshake initiation. Rate-limited per
    /// peer; retransmissions ride the retransmit timer's jitter.
    pub(crate) async fn initiate_handshake(self: &Arc<Self>, peer: &Arc<Peer>, is_retry: bool) {
        if !is_retry {
            peer.timers.handshake_attempts.store(0, Ordering::Relaxed);
        }
        {
            let hs = peer.handshake.read();
            if let Some(at) = hs.last_sent_handshake {
                if at.elapsed() < REKEY_TIMEOUT {
                    return;
                }
            }
        }
        let Some(endpoint) = peer.endpoint() else {
            tracing::debug!("handshake requested but peer has no endpoint");
            return;
        };

        let msg = {
            let identity = self.identity.read();
            match handshake::create_initiation(&identity, &self.index_table, peer) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::debug!("failed to create initiation: {err}");
                    return;
                }
            }
        };
        let mut bytes = msg.to_bytes();
        peer.cookies.add_macs(
            &mut bytes,
            MessageInitiation::MAC1_OFFSET,
            MessageInitiation::MAC2_OFFSET,
        );

        peer.handshake.write().last_sent_handshake = Some(Instant::now());
        peer.timers.handshake_initiated();
        peer.timers.any_authenticated_packet_traversal();

        tracing::debug!("sending handshake initiation");
        if let Err(err) = self.bind.send(&bytes, endpoint).await {
            tracing::debug!("failed to send initiation: {err}");
        }
    }

    // --- timer fire handlers --------------------------------------------

    pub(crate) async fn fire_retransmit_handshake(self: &Arc<Self>, peer: &Arc<Peer>) {
        if peer.handshake.read().state != HandshakeState::InitiationCreated {
            return;
        }
        let attempts = peer.timers.handshake_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        if attempts > MAX_TIMER_HANDSHAKES {
            tracing::info!(attempts, "handshake retries exhausted, giving up on peer");
            peer.drain_staging();
            peer.timers.stop_all();
            return;
        }
        tracing::debug!(attempts, "handshake unanswered, retrying");
        self.initiate_handshake(peer, true).await;
    }

    pub(crate) async fn fire_send_keepalive(self: &Arc<Self>, peer: &Arc<Peer>) {
        self.send_keepalive(peer).await;
        if peer.timers.take_need_another_keepalive() {
            peer.timers.data_received();
        }
    }

    pub(crate) async fn fire_new_handshake(self: &Arc<Self>, peer: &Arc<Peer>) {
        tracing::debug!("session stale, initiating new handshake");
        self.initiate_handshake(peer, false).await;
    }

    pub(crate) fn fire_zero_key_material(self: &Arc<Self>, peer: &Arc<Peer>) {
        tracing::debug!("expiring all key material");
        peer.keypairs.clear(&self.index_table);
        let mut hs = peer.handshake.write();
        self.index_table.delete(hs.local_index);
        hs.clear();
    }

    pub(crate) async fn fire_persistent_keepalive(self: &Arc<Self>, peer: &Arc<Peer>) {
        self.send_keepalive(peer).await;
    }

    // --- receive path ----------------------------------------------------

    async fn handle_datagram(self: &Arc<Self>, data: &[u8], src: SocketAddr) {
        let Ok(msg_type) = messages::message_type(data) else {
            return;
        };
        match msg_type {
            MessageType::Initiation | MessageType::Response => {
                if self
                    .handshake_tx
                    .try_send(HandshakeJob {
                        datagram: data.to_vec(),
                        src,
                    })
                    .is_err()
                {
                    tracing::debug!("handshake queue full, dropping message");
                }
            }
            MessageType::CookieReply => {
                let Ok(reply) = MessageCookieReply::from_bytes(data) else {
                    return;
                };
                let Some(entry) = self.index_table.lookup(reply.receiver) else {
                    tracing::debug!("cookie reply for unknown index");
                    return;
                };
                match entry.peer().cookies.consume_reply(&reply) {
                    Ok(()) => tracing::debug!("stored cookie from reply"),
                    Err(_) => tracing::debug!("discarded invalid cookie reply"),
                }
            }
            MessageType::Transport => {
                let Ok(header) = TransportHeader::from_bytes(data) else {
                    return;
                };
                let Some(IndexEntry::Keypair(peer, keypair)) =
                    self.index_table.lookup(header.receiver)
                else {
                    tracing::trace!("transport message for unknown index");
                    return;
                };
                if !peer.is_running() || keypair.expired() {
                    return;
                }
                if peer.inbound.lock().is_none() {
                    return;
                }
                let seq = peer.rx_seq.fetch_add(1, Ordering::Relaxed);
                let job = DecryptJob {
                    peer,
                    keypair,
                    counter: header.counter,
                    seq,
                    ciphertext: TransportHeader::ciphertext(data).to_vec(),
                    src,
                };
                // Blocks when the pipeline is full: backpressure onto the
                // socket reader.
                let _ = self.decrypt_tx.send(job).await;
            }
        }
    }

    async fn handle_handshake_job(self: &Arc<Self>, job: HandshakeJob) {
        let data = &job.datagram;
        let src = job.src;
        let Ok(msg_type) = messages::message_type(data) else {
            return;
        };
        match msg_type {
            MessageType::Initiation => {
                if data.len() != MessageInitiation::SIZE {
                    return;
                }
                if !self
                    .cookie_checker
                    .check_mac1(data, MessageInitiation::MAC1_OFFSET)
                {
                    tracing::debug!("initiation with bad mac1");
                    return;
                }
                let Ok(msg) = MessageInitiation::from_bytes(data) else {
                    return;
                };
                if self.is_under_load()
                    && !self.reply_with_cookie_if_needed(
                        data,
                        MessageInitiation::MAC1_OFFSET,
                        MessageInitiation::MAC2_OFFSET,
                        msg.sender,
                        src,
                    )
                    .await
                {
                    return;
                }

                let peer = {
                    let identity = self.identity.read();
                    match handshake::consume_initiation(
                        &identity,
                        |pk| self.peers.read().get(pk).cloned(),
                        &msg,
                    ) {
                        Ok(peer) => peer,
                        Err(err) => {
                            tracing::debug!("dropped handshake initiation: {err}");
                            return;
                        }
                    }
                };
                peer.set_endpoint(src);

                let response = match handshake::create_response(&self.index_table, &peer) {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::debug!("failed to create response: {err}");
                        return;
                    }
                };
                let mut bytes = response.to_bytes();
                peer.cookies.add_macs(
                    &mut bytes,
                    MessageResponse::MAC1_OFFSET,
                    MessageResponse::MAC2_OFFSET,
                );

                if let Err(err) = handshake::begin_symmetric_session(&self.index_table, &peer) {
                    tracing::debug!("failed to derive responder session: {err}");
                    return;
                }
                peer.timers.session_derived();
                peer.timers.any_authenticated_packet_traversal();
                peer.handshake.write().last_sent_handshake = Some(Instant::now());

                tracing::debug!("sending handshake response");
                if let Err(err) = self.bind.send(&bytes, src).await {
                    tracing::debug!("failed to send response: {err}");
                }
            }
            MessageType::Response => {
                if data.len() != MessageResponse::SIZE {
                    return;
                }
                if !self
                    .cookie_checker
                    .check_mac1(data, MessageResponse::MAC1_OFFSET)
                {
                    tracing::debug!("response with bad mac1");
                    return;
                }
                let Ok(msg) = MessageResponse::from_bytes(data) else {
                    return;
                };
                if self.is_under_load()
                    && !self.reply_with_cookie_if_needed(
                        data,
                        MessageResponse::MAC1_OFFSET,
                        MessageResponse::MAC2_OFFSET,
                        msg.sender,
                        src,
                    )
                    .await
                {
                    return;
                }

                let peer = {
                    let identity = self.identity.read();
                    match handshake::consume_response(&identity, &self.index_table, &msg) {
                        Ok(peer) => peer,
                        Err(err) => {
                            tracing::debug!("dropped handshake response: {err}");
                            return;
                        }
                    }
                };
                peer.set_endpoint(src);

                if let Err(err) = handshake::begin_symmetric_session(&self.index_table, &peer) {
                    tracing::debug!("failed to derive initiator session: {err}");
                    return;
                }
                *peer.last_handshake.lock() = Some(Instant::now());
                peer.timers.session_derived();
                peer.timers.handshake_complete();
                tracing::debug!("handshake complete as initiator");

                // Confirm the session so the responder can promote it;
                // staged data serves, a keepalive otherwise.
                self.send_keepalive(&peer).await;
            }
            _ => {}
        }
    }

    /// Under load: verify MAC2, answering a miss with a cookie reply.
    /// Returns true when processing may continue.
    async fn reply_with_cookie_if_needed(
        self: &Arc<Self>,
        data: &[u8],
        mac1_offset: usize,
        mac2_offset: usize,
        sender: u32,
        src: SocketAddr,
    ) -> bool {
        if self.cookie_checker.check_mac2(data, mac2_offset, &src) {
            return true;
        }
        tracing::debug!("under load, answering with cookie");
        let mac1: [u8; 16] = data[mac1_offset..mac1_offset + 16].try_into().unwrap();
        match self.cookie_checker.create_reply(sender, &src, &mac1) {
            Ok(reply) => {
                let _ = self.bind.send(&reply.to_bytes(), src).await;
            }
            Err(err) => tracing::debug!("failed to build cookie reply: {err}"),
        }
        false
    }
}

// --- worker tasks --------------------------------------------------------

async fn receive_loop(inner: Arc<TransportInner>, mut stop: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_UDP_SIZE];
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            result = inner.bind.recv(&mut buf) => match result {
                Ok((len, src)) => inner.handle_datagram(&buf[..len], src).await,
                Err(err) => {
                    if !*stop.borrow() {
                        tracing::debug!("udp receive failed: {err}");
                    }
                    break;
                }
            }
        }
    }
}

async fn handshake_worker(
    inner: Arc<TransportInner>,
    mut rx: mpsc::Receiver<HandshakeJob>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            job = rx.recv() => match job {
                Some(job) => inner.handle_handshake_job(job).await,
                None => break,
            }
        }
    }
}

async fn encryption_worker(
    rx: Arc<AsyncMutex<mpsc::Receiver<EncryptJob>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = stop.changed() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        let is_keepalive = job.packet.is_empty();
        let datagram = match job.keypair.seal_transport(job.counter, &job.packet) {
            Ok(datagram) => Some(datagram),
            Err(err) => {
                tracing::trace!("seal failed: {err}");
                None
            }
        };
        let sender = job.peer.outbound.lock().clone();
        if let Some(tx) = sender {
            let _ = tx
                .send(SequencedOutbound {
                    seq: job.seq,
                    datagram,
                    is_keepalive,
                })
                .await;
        }
    }
}

async fn decryption_worker(
    rx: Arc<AsyncMutex<mpsc::Receiver<DecryptJob>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = stop.changed() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        let packet = match job.keypair.open_transport(job.counter, &job.ciphertext) {
            Ok(plaintext) => Some(DecryptedPacket {
                keypair: job.keypair,
                counter: job.counter,
                plaintext,
                src: job.src,
            }),
            Err(_) => {
                tracing::trace!("transport message failed authentication");
                None
            }
        };
        let sender = job.peer.inbound.lock().clone();
        if let Some(tx) = sender {
            let _ = tx
                .send(SequencedInbound {
                    seq: job.seq,
                    packet,
                })
                .await;
        }
    }
}

/// Per-peer outbound reorder stage: releases sealed datagrams to the bind
/// in staging order, batching whatever is ready.
async fn outbound_dispatcher(
    inner: Arc<TransportInner>,
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<SequencedOutbound>,
) {
    let mut next_seq: u64 = 0;
    let mut pending: BTreeMap<u64, SequencedOutbound> = BTreeMap::new();

    while let Some(item) = rx.recv().await {
        pending.insert(item.seq, item);

        let mut batch: Vec<Vec<u8>> = Vec::new();
        let mut any_data = false;
        while let Some(item) = pending.remove(&next_seq) {
            next_seq += 1;
            if let Some(datagram) = item.datagram {
                if !item.is_keepalive {
                    any_data = true;
                }
                peer.tx_bytes.fetch_add(datagram.len() as u64, Ordering::Relaxed);
                batch.push(datagram);
            }
        }
        if batch.is_empty() {
            continue;
        }
        let Some(endpoint) = peer.endpoint() else {
            continue;
        };
        if let Err(err) = inner.bind.send_batch(&batch, endpoint).await {
            tracing::trace!("outbound send failed: {err}");
            continue;
        }
        peer.timers.any_authenticated_packet_sent();
        peer.timers.any_authenticated_packet_traversal();
        if any_data {
            peer.timers.data_sent();
        }
    }
}

/// Per-peer inbound reorder stage: replay validation, keypair promotion,
/// endpoint roaming, timer updates, and in-order host-stack delivery.
async fn inbound_dispatcher(
    inner: Arc<TransportInner>,
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<SequencedInbound>,
) {
    let mut next_seq: u64 = 0;
    let mut pending: BTreeMap<u64, SequencedInbound> = BTreeMap::new();

    while let Some(item) = rx.recv().await {
        pending.insert(item.seq, item);

        while let Some(item) = pending.remove(&next_seq) {
            next_seq += 1;
            let Some(packet) = item.packet else { continue };

            if !packet.keypair.validate_counter(packet.counter) {
                tracing::trace!(counter = packet.counter, "replayed or stale counter");
                continue;
            }

            if peer.keypairs.is_next(&packet.keypair)
                && peer.keypairs.promote_next(&inner.index_table, &packet.keypair)
            {
                *peer.last_handshake.lock() = Some(Instant::now());
                peer.timers.handshake_complete();
                tracing::debug!("promoted next keypair after first inbound");
            }

            if peer.endpoint() != Some(packet.src) {
                tracing::debug!("peer endpoint roamed");
                peer.set_endpoint(packet.src);
            }

            peer.timers.any_authenticated_packet_received();
            peer.timers.any_authenticated_packet_traversal();
            peer.rx_bytes
                .fetch_add(packet.plaintext.len() as u64, Ordering::Relaxed);

            if packet.plaintext.is_empty() {
                tracing::trace!("keepalive received");
                continue;
            }
            peer.timers.data_received();
            if inner
                .inbound_tx
                .send(InboundPacket {
                    peer: peer.remote_static,
                    packet: packet.plaintext,
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.inner.stop_tx.send(true);
    }
}
