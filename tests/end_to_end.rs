//! End-to-end scenarios over an in-memory datagram network: two transports
//! exchanging real handshakes and transport messages, with an adversary
//! able to capture and replay anything on the wire.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;

use quietwire::crypto::x25519;
use quietwire::{PeerOptions, Transport, UdpBind};

/// A captured datagram: (from, to, bytes).
type Captured = (SocketAddr, SocketAddr, Vec<u8>);

/// A lossless in-memory datagram fabric with a capture log.
struct MemNetwork {
    routes: Mutex<HashMap<SocketAddr, mpsc::Sender<(Vec<u8>, SocketAddr)>>>,
    capture: Mutex<Vec<Captured>>,
}

impl MemNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            capture: Mutex::new(Vec::new()),
        })
    }

    fn bind(self: &Arc<Self>, addr: SocketAddr) -> MemBind {
        let (tx, rx) = mpsc::channel(4096);
        self.routes.lock().insert(addr, tx);
        MemBind {
            net: self.clone(),
            addr,
            inbox: AsyncMutex::new(rx),
        }
    }

    /// Adversary: push an arbitrary datagram at a bind, spoofing `from`.
    async fn inject(&self, to: SocketAddr, from: SocketAddr, datagram: Vec<u8>) {
        let route = self.routes.lock().get(&to).cloned();
        if let Some(tx) = route {
            let _ = tx.send((datagram, from)).await;
        }
    }

    /// Snapshot of everything sent so far.
    fn captured(&self) -> Vec<Captured> {
        self.capture.lock().clone()
    }
}

struct MemBind {
    net: Arc<MemNetwork>,
    addr: SocketAddr,
    inbox: AsyncMutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
}

#[async_trait]
impl UdpBind for MemBind {
    async fn send(&self, datagram: &[u8], endpoint: SocketAddr) -> io::Result<()> {
        self.net
            .capture
            .lock()
            .push((self.addr, endpoint, datagram.to_vec()));
        let route = self.net.routes.lock().get(&endpoint).cloned();
        if let Some(tx) = route {
            let _ = tx.send((datagram.to_vec(), self.addr)).await;
        }
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((datagram, from)) => {
                buf[..datagram.len()].copy_from_slice(&datagram);
                Ok((datagram.len(), from))
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "network gone")),
        }
    }
}

struct Endpoint {
    transport: Transport,
    inbound: mpsc::Receiver<quietwire::InboundPacket>,
    public: [u8; 32],
    addr: SocketAddr,
}

/// Two transports on the fabric, each configured with the other's key.
/// Only `a` knows `b`'s endpoint; `b` learns `a`'s from traffic.
fn build_pair(net: &Arc<MemNetwork>) -> (Endpoint, Endpoint) {
    let addr_a: SocketAddr = "10.10.0.1:51820".parse().unwrap();
    let addr_b: SocketAddr = "10.10.0.2:51820".parse().unwrap();
    let (a_private, a_public) = x25519::generate_keypair();
    let (b_private, b_public) = x25519::generate_keypair();

    let (ta, rx_a) = Transport::new(a_private, Arc::new(net.bind(addr_a)));
    let (tb, rx_b) = Transport::new(b_private, Arc::new(net.bind(addr_b)));

    ta.add_peer(
        b_public,
        PeerOptions {
            endpoint: Some(addr_b),
            ..Default::default()
        },
    )
    .unwrap();
    tb.add_peer(a_public, PeerOptions::default()).unwrap();

    ta.start();
    tb.start();

    (
        Endpoint {
            transport: ta,
            inbound: rx_a,
            public: a_public,
            addr: addr_a,
        },
        Endpoint {
            transport: tb,
            inbound: rx_b,
            public: b_public,
            addr: addr_b,
        },
    )
}

async fn expect_packet(endpoint: &mut Endpoint, expected: &[u8], from: [u8; 32]) {
    let packet = timeout(Duration::from_secs(10), endpoint.inbound.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("inbound channel closed");
    assert_eq!(packet.peer, from);
    assert_eq!(packet.packet, expected);
}

#[tokio::test]
async fn fresh_handshake_delivers_payloads_in_order() {
    let net = MemNetwork::new();
    let (a, mut b) = build_pair(&net);

    // The first send has no session: it stages, triggers the handshake,
    // and flushes once the response is consumed.
    a.transport
        .send_packet(&b.public, vec![0x11; 100])
        .await
        .unwrap();
    a.transport
        .send_packet(&b.public, vec![0x22; 200])
        .await
        .unwrap();
    a.transport
        .send_packet(&b.public, vec![0x33; 300])
        .await
        .unwrap();

    expect_packet(&mut b, &[0x11; 100], a.public).await;
    expect_packet(&mut b, &[0x22; 200], a.public).await;
    expect_packet(&mut b, &[0x33; 300], a.public).await;

    // The wire only ever carried the four message types.
    for (_, _, datagram) in net.captured() {
        assert!(matches!(datagram[0], 1..=4));
    }

    // Traffic flows the other way too (b learned a's endpoint).
    b.transport
        .send_packet(&a.public, vec![0x44; 64])
        .await
        .unwrap();
    let mut a = a;
    expect_packet(&mut a, &[0x44; 64], b.public).await;

    let stats = a.transport.stats(&b.public).unwrap();
    assert!(stats.tx_bytes > 0);
    assert!(stats.last_handshake.is_some());

    a.transport.close();
    b.transport.close();
}

#[tokio::test]
async fn replayed_transport_datagram_is_dropped() {
    let net = MemNetwork::new();
    let (a, mut b) = build_pair(&net);

    a.transport
        .send_packet(&b.public, b"only once".to_vec())
        .await
        .unwrap();
    expect_packet(&mut b, b"only once", a.public).await;

    // Adversary: replay the largest transport datagram a sent (the data
    // packet, not a keepalive) byte for byte.
    let replay = net
        .captured()
        .into_iter()
        .filter(|(from, _, datagram)| *from == a.addr && datagram[0] == 4)
        .max_by_key(|(_, _, datagram)| datagram.len())
        .expect("no transport datagram captured");
    net.inject(b.addr, a.addr, replay.2).await;

    // The replay hits the filter; nothing reaches the host stack.
    let verdict = timeout(Duration::from_millis(300), b.inbound.recv()).await;
    assert!(verdict.is_err(), "replayed packet was delivered");

    a.transport.close();
    b.transport.close();
}

#[tokio::test(start_paused = true)]
async fn session_rekeys_after_rekey_after_time() {
    let net = MemNetwork::new();
    let (a, mut b) = build_pair(&net);

    a.transport
        .send_packet(&b.public, b"before rekey".to_vec())
        .await
        .unwrap();
    expect_packet(&mut b, b"before rekey", a.public).await;

    let first_handshake = a
        .transport
        .stats(&b.public)
        .unwrap()
        .last_handshake
        .expect("no handshake recorded");

    // Two minutes later the current keypair is past RekeyAfterTime; the
    // next outbound kicks off a fresh handshake while still flowing.
    tokio::time::advance(Duration::from_secs(121)).await;

    a.transport
        .send_packet(&b.public, b"after rekey".to_vec())
        .await
        .unwrap();
    expect_packet(&mut b, b"after rekey", a.public).await;

    // The new handshake completes shortly after.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let stats = a.transport.stats(&b.public).unwrap();
        if stats.last_handshake.map(|at| at > first_handshake) == Some(true) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "rekey never completed"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // And traffic keeps working on the rotated keys.
    a.transport
        .send_packet(&b.public, b"steady on".to_vec())
        .await
        .unwrap();
    expect_packet(&mut b, b"steady on", a.public).await;

    a.transport.close();
    b.transport.close();
}

#[tokio::test]
async fn keepalives_never_reach_the_host_stack() {
    let net = MemNetwork::new();
    let (a, mut b) = build_pair(&net);

    // Drive the handshake with a single payload. The initiator's session
    // confirmation rides ahead of it as data or keepalive; either way only
    // the payload may surface.
    a.transport
        .send_packet(&b.public, b"visible".to_vec())
        .await
        .unwrap();
    expect_packet(&mut b, b"visible", a.public).await;

    // Nothing else pending.
    let verdict = timeout(Duration::from_millis(300), b.inbound.recv()).await;
    assert!(verdict.is_err());

    a.transport.close();
    b.transport.close();
}

#[tokio::test]
async fn removed_peer_stops_flowing() {
    let net = MemNetwork::new();
    let (a, mut b) = build_pair(&net);

    a.transport
        .send_packet(&b.public, b"hello".to_vec())
        .await
        .unwrap();
    expect_packet(&mut b, b"hello", a.public).await;

    b.transport.remove_peer(&a.public);
    a.transport
        .send_packet(&b.public, b"into the void".to_vec())
        .await
        .unwrap();

    let verdict = timeout(Duration::from_millis(300), b.inbound.recv()).await;
    assert!(verdict.is_err(), "packet delivered after peer removal");

    a.transport.close();
    b.transport.close();
}
