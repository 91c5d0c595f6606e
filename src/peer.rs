//! Per-peer state: Noise handshake, session keypairs, outbound staging,
//! endpoint, timers, and traffic statistics.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::keypair::Keypairs;
use crate::protocol::cookie::CookieGenerator;
use crate::protocol::handshake::Handshake;
use crate::protocol::MAX_QUEUED_PACKETS;
use crate::timers::Timers;
use crate::transport::{SequencedInbound, SequencedOutbound};

/// Point-in-time traffic counters for one peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub last_handshake: Option<Instant>,
}

/// One configured counterparty, identified by its static public key.
pub(crate) struct Peer {
    /// The peer's long-term Curve25519 public key.
    pub remote_static: [u8; 32],
    pub handshake: RwLock<Handshake>,
    pub keypairs: Keypairs,
    pub cookies: CookieGenerator,
    pub timers: Timers,

    endpoint: Mutex<Option<SocketAddr>>,
    running: AtomicBool,

    /// IP packets awaiting a valid current keypair; oldest dropped on
    /// overflow.
    staging: Mutex<VecDeque<Vec<u8>>>,

    // Pipeline plumbing, populated while the peer is running.
    pub outbound: Mutex<Option<mpsc::Sender<SequencedOutbound>>>,
    pub inbound: Mutex<Option<mpsc::Sender<SequencedInbound>>>,
    pub tx_seq: AtomicU64,
    pub rx_seq: AtomicU64,

    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub last_handshake: Mutex<Option<Instant>>,
}

impl Peer {
    pub fn new(
        remote_static: [u8; 32],
        preshared_key: [u8; 32],
        precomputed_static_static: [u8; 32],
    ) -> Self {
        Self {
            remote_static,
            handshake: RwLock::new(Handshake::new(
                remote_static,
                preshared_key,
                precomputed_static_static,
            )),
            keypairs: Keypairs::new(),
            cookies: CookieGenerator::new(&remote_static),
            timers: Timers::new(),
            endpoint: Mutex::new(None),
            running: AtomicBool::new(false),
            staging: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
            tx_seq: AtomicU64::new(0),
            rx_seq: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
        }
    }

    /// Acquire-load: a torn peer must never be used after stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.lock()
    }

    /// Record where the peer was last heard (or configured).
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.lock() = Some(endpoint);
    }

    /// Queue an outbound IP packet. On overflow the oldest staged packet is
    /// dropped in its favor.
    pub fn stage(&self, packet: Vec<u8>) {
        let mut staging = self.staging.lock();
        if staging.len() >= MAX_QUEUED_PACKETS {
            staging.pop_front();
            tracing::trace!("staging overflow, dropped oldest packet");
        }
        staging.push_back(packet);
    }

    /// Take everything staged, leaving the queue empty.
    pub fn drain_staging(&self) -> Vec<Vec<u8>> {
        self.staging.lock().drain(..).collect()
    }

    pub fn staging_is_empty(&self) -> bool {
        self.staging.lock().is_empty()
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            last_handshake: *self.last_handshake.lock(),
        }
    }

    #[cfg(test)]
    pub fn stub_for_tests() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new([0u8; 32], [0u8; 32], [1u8; 32]))
    }
}
