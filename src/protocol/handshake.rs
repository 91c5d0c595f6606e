//! The Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s handshake engine.
//!
//! Each operation threads the transcript hash H and chain key C through the
//! pattern: MixHash(x) appends to H, MixKey(x) advances C through the
//! BLAKE2s-HMAC KDF. Handshake AEADs always run with the zero nonce and the
//! running H as associated data, so any divergence in the transcript fails
//! authentication.
//!
//! Consume-side failures are silent on the wire and logged at debug level;
//! replying would let an attacker probe for configured peers.

use std::sync::Arc;

use tai64::Tai64N;
use tokio::time::Instant;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{aead, blake2s, x25519};
use crate::error::{CryptoError, Error, ProtocolError};
use crate::keypair::Keypair;
use crate::peer::Peer;
use crate::protocol::index::IndexTable;
use crate::protocol::messages::{MessageInitiation, MessageResponse};
use crate::protocol::{CONSTRUCTION, HANDSHAKE_INITIATION_RATE, IDENTIFIER};

/// The process-wide static identity: long-term Curve25519 keypair.
///
/// Read-locked for the duration of any handshake operation; replaced only
/// by an explicit identity rekey, which expires every session.
pub(crate) struct StaticIdentity {
    pub private: [u8; 32],
    pub public: [u8; 32],
}

impl StaticIdentity {
    pub fn new(private: [u8; 32]) -> Self {
        let public = x25519::public_key(&private);
        Self { private, public }
    }

    /// The static-static shared secret with a peer, derived once at peer
    /// creation. All-zero output marks an invalid peer key.
    pub fn precompute_shared(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        x25519::dh(&self.private, peer_public)
    }
}

impl Drop for StaticIdentity {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

fn initial_chain_key() -> &'static [u8; 32] {
    static CK: std::sync::OnceLock<[u8; 32]> = std::sync::OnceLock::new();
    CK.get_or_init(|| blake2s::hash(CONSTRUCTION))
}

fn initial_hash() -> &'static [u8; 32] {
    static H: std::sync::OnceLock<[u8; 32]> = std::sync::OnceLock::new();
    H.get_or_init(|| blake2s::hash_two(initial_chain_key(), IDENTIFIER))
}

/// Progress of the per-peer Noise state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

impl HandshakeState {
    fn name(self) -> &'static str {
        match self {
            HandshakeState::Zeroed => "zeroed",
            HandshakeState::InitiationCreated => "initiation-created",
            HandshakeState::InitiationConsumed => "initiation-consumed",
            HandshakeState::ResponseCreated => "response-created",
            HandshakeState::ResponseConsumed => "response-consumed",
        }
    }
}

/// Transient Noise state for one peer, guarded by the peer's handshake lock.
pub(crate) struct Handshake {
    pub state: HandshakeState,
    hash: [u8; 32],
    chain_key: [u8; 32],
    pub preshared_key: [u8; 32],
    local_ephemeral: [u8; 32],
    pub local_index: u32,
    pub remote_index: u32,
    pub remote_static: [u8; 32],
    remote_ephemeral: [u8; 32],
    pub precomputed_static_static: [u8; 32],
    last_timestamp: Option<[u8; 12]>,
    last_initiation_consumption: Option<Instant>,
    pub last_sent_handshake: Option<Instant>,
}

impl Handshake {
    pub fn new(remote_static: [u8; 32], preshared_key: [u8; 32], precomputed: [u8; 32]) -> Self {
        Self {
            state: HandshakeState::Zeroed,
            hash: [0; 32],
            chain_key: [0; 32],
            preshared_key,
            local_ephemeral: [0; 32],
            local_index: 0,
            remote_index: 0,
            remote_static,
            remote_ephemeral: [0; 32],
            precomputed_static_static: precomputed,
            last_timestamp: None,
            last_initiation_consumption: None,
            last_sent_handshake: None,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    fn mix_key(&mut self, data: &[u8]) {
        self.chain_key = blake2s::kdf1(&self.chain_key, data);
    }

    /// Wipe all transcript and ephemeral secrets. Replay bookkeeping
    /// (timestamps) survives, as it must.
    pub fn clear(&mut self) {
        self.hash.zeroize();
        self.chain_key.zeroize();
        self.local_ephemeral.zeroize();
        self.remote_ephemeral.zeroize();
        self.local_index = 0;
        self.state = HandshakeState::Zeroed;
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        self.local_ephemeral.zeroize();
        self.preshared_key.zeroize();
        self.precomputed_static_static.zeroize();
    }
}

/// Build a handshake initiation for `peer`, resetting its Noise state and
/// registering a fresh sender index.
pub(crate) fn create_initiation(
    identity: &StaticIdentity,
    table: &IndexTable,
    peer: &Arc<Peer>,
) -> Result<MessageInitiation, Error> {
    let mut hs = peer.handshake.write();

    if x25519::is_zero(&hs.precomputed_static_static) {
        return Err(CryptoError::InvalidPublicKey.into());
    }

    hs.hash = *initial_hash();
    hs.chain_key = *initial_chain_key();
    let remote_static = hs.remote_static;
    hs.mix_hash(&remote_static);

    let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
    hs.local_ephemeral = ephemeral_private;
    hs.mix_key(&ephemeral_public);
    hs.mix_hash(&ephemeral_public);

    // es
    let es = Zeroizing::new(x25519::dh(&hs.local_ephemeral, &hs.remote_static));
    if x25519::is_zero(&es) {
        return Err(CryptoError::InvalidPublicKey.into());
    }
    let (chain, key) = blake2s::kdf2(&hs.chain_key, es.as_ref());
    hs.chain_key = chain;
    let key = Zeroizing::new(key);
    let static_ct = aead::seal(&key, 0, &identity.public, &hs.hash)?;
    let static_ct: [u8; 48] = static_ct.try_into().map_err(|_| CryptoError::Seal)?;
    hs.mix_hash(&static_ct);

    // ss (precomputed)
    let (chain, key) = blake2s::kdf2(&hs.chain_key, &hs.precomputed_static_static);
    hs.chain_key = chain;
    let key = Zeroizing::new(key);
    let timestamp = Tai64N::now().to_bytes();
    let timestamp_ct = aead::seal(&key, 0, &timestamp, &hs.hash)?;
    let timestamp_ct: [u8; 28] = timestamp_ct.try_into().map_err(|_| CryptoError::Seal)?;

    // Retire the previous index before binding a new one.
    table.delete(hs.local_index);
    hs.local_index = table.new_index_for_handshake(peer);

    hs.mix_hash(&timestamp_ct);
    hs.state = HandshakeState::InitiationCreated;

    Ok(MessageInitiation {
        sender: hs.local_index,
        ephemeral: ephemeral_public,
        static_ct,
        timestamp_ct,
        mac1: [0; 16],
        mac2: [0; 16],
    })
}

/// Consume a handshake initiation, resolving the initiating peer through
/// `lookup` (static public key to peer). Rejects unknown and stopped peers,
/// failed transcripts, replayed timestamps, and over-rate initiations.
pub(crate) fn consume_initiation<F>(
    identity: &StaticIdentity,
    lookup: F,
    msg: &MessageInitiation,
) -> Result<Arc<Peer>, Error>
where
    F: FnOnce(&[u8; 32]) -> Option<Arc<Peer>>,
{
    let mut hash = Zeroizing::new(blake2s::hash_two(initial_hash(), &identity.public));
    let mut chain = Zeroizing::new(blake2s::kdf1(initial_chain_key(), &msg.ephemeral));
    *hash = blake2s::hash_two(hash.as_ref(), &msg.ephemeral);

    // Decrypt the static key: es from our side.
    let es = Zeroizing::new(x25519::dh(&identity.private, &msg.ephemeral));
    if x25519::is_zero(&es) {
        return Err(CryptoError::InvalidPublicKey.into());
    }
    let (next_chain, key) = blake2s::kdf2(&chain, es.as_ref());
    *chain = next_chain;
    let key = Zeroizing::new(key);
    let peer_public = aead::open(&key, 0, &msg.static_ct, hash.as_ref())?;
    let peer_public: [u8; 32] = peer_public.try_into().map_err(|_| CryptoError::AuthFailure)?;
    *hash = blake2s::hash_two(hash.as_ref(), &msg.static_ct);

    let peer = lookup(&peer_public).ok_or(ProtocolError::UnknownPeer)?;
    if !peer.is_running() {
        return Err(ProtocolError::PeerNotRunning.into());
    }

    // Verify identity through the precomputed static-static secret.
    let timestamp: [u8; 12];
    {
        let hs = peer.handshake.read();
        if x25519::is_zero(&hs.precomputed_static_static) {
            return Err(CryptoError::InvalidPublicKey.into());
        }
        let (next_chain, key) = blake2s::kdf2(&chain, &hs.precomputed_static_static);
        *chain = next_chain;
        let key = Zeroizing::new(key);
        let ts = aead::open(&key, 0, &msg.timestamp_ct, hash.as_ref())?;
        timestamp = ts.try_into().map_err(|_| CryptoError::AuthFailure)?;
        *hash = blake2s::hash_two(hash.as_ref(), &msg.timestamp_ct);

        // Replay: the decrypted timestamp must advance monotonically.
        if let Some(last) = hs.last_timestamp {
            if timestamp <= last {
                tracing::debug!("handshake initiation replay");
                return Err(ProtocolError::ReplayOrFlood.into());
            }
        }
        // Flood: cap consumed initiations at one per 50 ms per peer.
        if let Some(at) = hs.last_initiation_consumption {
            if at.elapsed() < HANDSHAKE_INITIATION_RATE {
                tracing::debug!("handshake initiation flood");
                return Err(ProtocolError::ReplayOrFlood.into());
            }
        }
    }

    // Full success: commit under the write lock.
    {
        let mut hs = peer.handshake.write();
        hs.hash = *hash;
        hs.chain_key = *chain;
        hs.remote_index = msg.sender;
        hs.remote_ephemeral = msg.ephemeral;
        hs.last_timestamp = Some(timestamp);
        hs.last_initiation_consumption = Some(Instant::now());
        hs.state = HandshakeState::InitiationConsumed;
    }

    Ok(peer)
}

/// Build the handshake response after consuming an initiation.
pub(crate) fn create_response(
    table: &IndexTable,
    peer: &Arc<Peer>,
) -> Result<MessageResponse, Error> {
    let mut hs = peer.handshake.write();

    if hs.state != HandshakeState::InitiationConsumed {
        return Err(ProtocolError::WrongState {
            state: hs.state.name(),
        }
        .into());
    }

    table.delete(hs.local_index);
    hs.local_index = table.new_index_for_handshake(peer);

    let (ephemeral_private, ephemeral_public) = x25519::generate_keypair();
    hs.local_ephemeral = ephemeral_private;
    hs.mix_hash(&ephemeral_public);
    hs.mix_key(&ephemeral_public);

    // ee, then se
    let ee = Zeroizing::new(x25519::dh(&hs.local_ephemeral, &hs.remote_ephemeral));
    hs.mix_key(ee.as_ref());
    let se = Zeroizing::new(x25519::dh(&hs.local_ephemeral, &hs.remote_static));
    if x25519::is_zero(&se) {
        return Err(CryptoError::InvalidPublicKey.into());
    }
    hs.mix_key(se.as_ref());

    // psk
    let (chain, tau, key) = blake2s::kdf3(&hs.chain_key, &hs.preshared_key);
    hs.chain_key = chain;
    let tau = Zeroizing::new(tau);
    let key = Zeroizing::new(key);
    hs.mix_hash(tau.as_ref());

    let empty_ct = aead::seal(&key, 0, &[], &hs.hash)?;
    let empty_ct: [u8; 16] = empty_ct.try_into().map_err(|_| CryptoError::Seal)?;
    hs.mix_hash(&empty_ct);

    hs.state = HandshakeState::ResponseCreated;

    Ok(MessageResponse {
        sender: hs.local_index,
        receiver: hs.remote_index,
        ephemeral: ephemeral_public,
        empty_ct,
        mac1: [0; 16],
        mac2: [0; 16],
    })
}

/// Consume a handshake response addressed to one of our pending
/// initiations. On any failure the pending handshake is left undisturbed.
pub(crate) fn consume_response(
    identity: &StaticIdentity,
    table: &IndexTable,
    msg: &MessageResponse,
) -> Result<Arc<Peer>, Error> {
    let entry = table
        .lookup(msg.receiver)
        .ok_or(ProtocolError::UnknownIndex {
            index: msg.receiver,
        })?;
    let peer = entry.peer().clone();

    let mut hash = Zeroizing::new([0u8; 32]);
    let mut chain = Zeroizing::new([0u8; 32]);
    {
        let hs = peer.handshake.read();
        if hs.state != HandshakeState::InitiationCreated {
            return Err(ProtocolError::WrongState {
                state: hs.state.name(),
            }
            .into());
        }

        *hash = blake2s::hash_two(&hs.hash, &msg.ephemeral);
        *chain = blake2s::kdf1(&hs.chain_key, &msg.ephemeral);

        let ee = Zeroizing::new(x25519::dh(&hs.local_ephemeral, &msg.ephemeral));
        *chain = blake2s::kdf1(&chain, ee.as_ref());
        let se = Zeroizing::new(x25519::dh(&identity.private, &msg.ephemeral));
        if x25519::is_zero(&se) {
            return Err(CryptoError::InvalidPublicKey.into());
        }
        *chain = blake2s::kdf1(&chain, se.as_ref());

        let (next_chain, tau, key) = blake2s::kdf3(&chain, &hs.preshared_key);
        *chain = next_chain;
        let tau = Zeroizing::new(tau);
        let key = Zeroizing::new(key);
        *hash = blake2s::hash_two(hash.as_ref(), tau.as_ref());

        aead::open(&key, 0, &msg.empty_ct, hash.as_ref())?;
        *hash = blake2s::hash_two(hash.as_ref(), &msg.empty_ct);
    }

    {
        let mut hs = peer.handshake.write();
        hs.hash = *hash;
        hs.chain_key = *chain;
        hs.remote_index = msg.sender;
        hs.state = HandshakeState::ResponseConsumed;
    }

    Ok(peer)
}

/// Derive the transport keypair from a completed handshake, zero the
/// transcript, rebind the sender index, and rotate the peer's slots.
pub(crate) fn begin_symmetric_session(table: &IndexTable, peer: &Arc<Peer>) -> Result<(), Error> {
    let mut hs = peer.handshake.write();

    let (send_key, recv_key, is_initiator) = match hs.state {
        HandshakeState::ResponseConsumed => {
            let (send, recv) = blake2s::kdf2(&hs.chain_key, &[]);
            (Zeroizing::new(send), Zeroizing::new(recv), true)
        }
        HandshakeState::ResponseCreated => {
            let (recv, send) = blake2s::kdf2(&hs.chain_key, &[]);
            (Zeroizing::new(send), Zeroizing::new(recv), false)
        }
        state => {
            return Err(ProtocolError::WrongState {
                state: state.name(),
            }
            .into())
        }
    };

    let keypair = Arc::new(Keypair::new(
        &send_key,
        &recv_key,
        is_initiator,
        hs.local_index,
        hs.remote_index,
    ));

    table.swap_index_for_keypair(hs.local_index, keypair.clone());
    // The transcript is wiped here; the index binding lives on in the keypair.
    hs.clear();
    drop(hs);

    peer.keypairs.install(table, keypair);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::TransportHeader;
    use std::time::Duration;

    struct Endpoint {
        identity: StaticIdentity,
        table: IndexTable,
    }

    fn endpoints(psk: [u8; 32]) -> (Endpoint, Endpoint, Arc<Peer>, Arc<Peer>) {
        let (a_priv, _) = x25519::generate_keypair();
        let (b_priv, _) = x25519::generate_keypair();
        let a = Endpoint {
            identity: StaticIdentity::new(a_priv),
            table: IndexTable::new(),
        };
        let b = Endpoint {
            identity: StaticIdentity::new(b_priv),
            table: IndexTable::new(),
        };

        // A's record of B, and B's record of A.
        let b_on_a = Arc::new(Peer::new(
            b.identity.public,
            psk,
            a.identity.precompute_shared(&b.identity.public),
        ));
        let a_on_b = Arc::new(Peer::new(
            a.identity.public,
            psk,
            b.identity.precompute_shared(&a.identity.public),
        ));
        b_on_a.set_running(true);
        a_on_b.set_running(true);
        (a, b, b_on_a, a_on_b)
    }

    fn run_handshake(
        a: &Endpoint,
        b: &Endpoint,
        b_on_a: &Arc<Peer>,
        a_on_b: &Arc<Peer>,
    ) -> MessageInitiation {
        let init = create_initiation(&a.identity, &a.table, b_on_a).unwrap();
        let peer = consume_initiation(
            &b.identity,
            |pk| (*pk == a.identity.public).then(|| a_on_b.clone()),
            &init,
        )
        .unwrap();
        assert!(Arc::ptr_eq(&peer, a_on_b));

        let resp = create_response(&b.table, a_on_b).unwrap();
        begin_symmetric_session(&b.table, a_on_b).unwrap();

        let peer = consume_response(&a.identity, &a.table, &resp).unwrap();
        assert!(Arc::ptr_eq(&peer, b_on_a));
        begin_symmetric_session(&a.table, b_on_a).unwrap();
        init
    }

    #[tokio::test]
    async fn full_handshake_derives_matching_sessions() {
        let (a, b, b_on_a, a_on_b) = endpoints([0u8; 32]);
        run_handshake(&a, &b, &b_on_a, &a_on_b);

        // Initiator promotes straight to current; responder parks in next.
        let a_current = b_on_a.keypairs.current().expect("initiator current");
        let (_, b_current, b_next) = a_on_b.keypairs.snapshot_for_tests();
        assert!(b_current.is_none());
        let b_next = b_next.expect("responder next");

        // Transcript state is zeroed after key derivation.
        assert_eq!(b_on_a.handshake.read().state, HandshakeState::Zeroed);
        assert_eq!(a_on_b.handshake.read().state, HandshakeState::Zeroed);

        // A -> B traffic flows under the derived keys.
        let counter = a_current.next_counter().unwrap();
        let datagram = a_current.seal_transport(counter, b"first packet").unwrap();
        let header = TransportHeader::from_bytes(&datagram).unwrap();
        assert_eq!(header.receiver, b_next.local_index);
        let plain = b_next
            .open_transport(header.counter, TransportHeader::ciphertext(&datagram))
            .unwrap();
        assert_eq!(plain, b"first packet");

        // The index tables resolve the session indices.
        assert!(a.table.lookup(a_current.local_index).is_some());
        assert!(b.table.lookup(b_next.local_index).is_some());
    }

    #[tokio::test]
    async fn psk_mismatch_fails_response_authentication() {
        let (a, b, b_on_a, a_on_b) = endpoints([1u8; 32]);
        b_on_a.handshake.write().preshared_key = [2u8; 32];

        let init = create_initiation(&a.identity, &a.table, &b_on_a).unwrap();
        let _ = consume_initiation(
            &b.identity,
            |_| Some(a_on_b.clone()),
            &init,
        )
        .unwrap();
        let resp = create_response(&b.table, &a_on_b).unwrap();
        assert!(consume_response(&a.identity, &a.table, &resp).is_err());
        // The pending initiation is undisturbed.
        assert_eq!(
            b_on_a.handshake.read().state,
            HandshakeState::InitiationCreated
        );
    }

    #[tokio::test]
    async fn tampered_initiation_is_rejected() {
        let (a, b, _b_on_a, a_on_b) = endpoints([0u8; 32]);
        let init = create_initiation(&a.identity, &a.table, &_b_on_a).unwrap();

        let mut tampered = init.clone();
        tampered.static_ct[5] ^= 1;
        assert!(consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &tampered).is_err());
    }

    #[tokio::test]
    async fn unknown_or_stopped_peers_are_rejected() {
        let (a, b, b_on_a, a_on_b) = endpoints([0u8; 32]);

        let init = create_initiation(&a.identity, &a.table, &b_on_a).unwrap();
        assert!(matches!(
            consume_initiation(&b.identity, |_| None, &init),
            Err(Error::Protocol(ProtocolError::UnknownPeer))
        ));

        a_on_b.set_running(false);
        assert!(matches!(
            consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &init),
            Err(Error::Protocol(ProtocolError::PeerNotRunning))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn initiation_flood_is_rate_limited() {
        let (a, b, b_on_a, a_on_b) = endpoints([0u8; 32]);

        let first = create_initiation(&a.identity, &a.table, &b_on_a).unwrap();
        consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &first).unwrap();

        // A second, fresh initiation inside the 50 ms window is flood.
        let second = create_initiation(&a.identity, &a.table, &b_on_a).unwrap();
        assert!(matches!(
            consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &second),
            Err(Error::Protocol(ProtocolError::ReplayOrFlood))
        ));

        // Once the window passes, the same message consumes fine.
        tokio::time::advance(Duration::from_millis(51)).await;
        consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &second).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_timestamp_is_rejected() {
        let (a, b, b_on_a, a_on_b) = endpoints([0u8; 32]);

        let captured = create_initiation(&a.identity, &a.table, &b_on_a).unwrap();
        consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &captured).unwrap();

        tokio::time::advance(Duration::from_millis(51)).await;
        let newer = create_initiation(&a.identity, &a.table, &b_on_a).unwrap();
        consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &newer).unwrap();

        // Replaying the captured message now fails the monotonicity check,
        // regardless of the flood window.
        tokio::time::advance(Duration::from_millis(51)).await;
        assert!(matches!(
            consume_initiation(&b.identity, |_| Some(a_on_b.clone()), &captured),
            Err(Error::Protocol(ProtocolError::ReplayOrFlood))
        ));
    }

    #[tokio::test]
    async fn zero_precomputed_secret_is_invalid() {
        let (a, _b, b_on_a, _a_on_b) = endpoints([0u8; 32]);
        b_on_a.handshake.write().precomputed_static_static = [0u8; 32];
        assert!(matches!(
            create_initiation(&a.identity, &a.table, &b_on_a),
            Err(Error::Crypto(CryptoError::InvalidPublicKey))
        ));
    }

    #[tokio::test]
    async fn response_requires_consumed_initiation() {
        let (_a, b, _b_on_a, a_on_b) = endpoints([0u8; 32]);
        assert!(matches!(
            create_response(&b.table, &a_on_b),
            Err(Error::Protocol(ProtocolError::WrongState { .. }))
        ));
    }

    #[tokio::test]
    async fn second_handshake_rotates_initiator_current() {
        let (a, b, b_on_a, a_on_b) = endpoints([0u8; 32]);
        run_handshake(&a, &b, &b_on_a, &a_on_b);
        let old_current = b_on_a.keypairs.current().unwrap();

        run_handshake(&a, &b, &b_on_a, &a_on_b);
        let (previous, current, _) = b_on_a.keypairs.snapshot_for_tests();
        assert!(Arc::ptr_eq(&previous.unwrap(), &old_current));
        assert!(!Arc::ptr_eq(&current.unwrap(), &old_current));
    }
}
