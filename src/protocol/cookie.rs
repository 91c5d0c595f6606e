//! MAC1/MAC2 computation and the cookie-reply machinery for DoS mitigation.
//!
//! Every handshake message carries MAC1 (keyed by a hash of the recipient's
//! static public key, always verified before any asymmetric work) and MAC2
//! (keyed by a cookie, only enforced while the receiver is under load). The
//! cookie proves the sender's source address: it is a keyed MAC of the
//! source endpoint under a secret that rotates every two minutes.

use std::net::SocketAddr;

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tokio::time::Instant;

use crate::crypto::{aead, blake2s};
use crate::error::{CryptoError, ProtocolError};
use crate::protocol::messages::MessageCookieReply;
use crate::protocol::{COOKIE_REFRESH_TIME, LABEL_COOKIE, LABEL_MAC1};

/// Serialize an endpoint the way cookies see it: address octets, then the
/// port in little-endian.
fn endpoint_bytes(endpoint: &SocketAddr) -> Vec<u8> {
    let mut bytes = match endpoint.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend_from_slice(&endpoint.port().to_le_bytes());
    bytes
}

struct CheckerSecret {
    value: [u8; 32],
    set_at: Option<Instant>,
}

/// Receive-side MAC validation and cookie-reply construction.
///
/// One per transport; reinitialized on identity rekey.
pub(crate) struct CookieChecker {
    mac1_key: RwLock<[u8; 32]>,
    cookie_key: RwLock<[u8; 32]>,
    secret: Mutex<CheckerSecret>,
}

impl CookieChecker {
    pub fn new(local_public: &[u8; 32]) -> Self {
        Self {
            mac1_key: RwLock::new(blake2s::hash_two(LABEL_MAC1, local_public)),
            cookie_key: RwLock::new(blake2s::hash_two(LABEL_COOKIE, local_public)),
            secret: Mutex::new(CheckerSecret {
                value: [0u8; 32],
                set_at: None,
            }),
        }
    }

    /// Rekey-identity path: recompute the label hashes.
    pub fn reinit(&self, local_public: &[u8; 32]) {
        *self.mac1_key.write() = blake2s::hash_two(LABEL_MAC1, local_public);
        *self.cookie_key.write() = blake2s::hash_two(LABEL_COOKIE, local_public);
    }

    /// Verify MAC1 over `msg[..mac1_offset]`. This runs before any
    /// asymmetric crypto on the receive path.
    pub fn check_mac1(&self, msg: &[u8], mac1_offset: usize) -> bool {
        if msg.len() < mac1_offset + 16 {
            return false;
        }
        let expected = blake2s::mac(&self.mac1_key.read(), &msg[..mac1_offset]);
        expected[..] == msg[mac1_offset..mac1_offset + 16]
    }

    /// The cookie for a source endpoint under the current secret, rotating
    /// the secret lazily when it is older than the refresh period.
    fn cookie_for(&self, src: &SocketAddr) -> [u8; 16] {
        let mut secret = self.secret.lock();
        let stale = match secret.set_at {
            Some(at) => at.elapsed() >= COOKIE_REFRESH_TIME,
            None => true,
        };
        if stale {
            rand::thread_rng().fill_bytes(&mut secret.value);
            secret.set_at = Some(Instant::now());
        }
        blake2s::mac(&secret.value, &endpoint_bytes(src))
    }

    /// Verify MAC2 over `msg[..mac2_offset]` against the sender's cookie.
    /// Only meaningful while under load; a rotation inside the refresh
    /// window invalidates older cookies by design of the rotation period.
    pub fn check_mac2(&self, msg: &[u8], mac2_offset: usize, src: &SocketAddr) -> bool {
        if msg.len() < mac2_offset + 16 {
            return false;
        }
        let cookie = self.cookie_for(src);
        let expected = blake2s::mac_keyed16(&cookie, &msg[..mac2_offset]);
        expected[..] == msg[mac2_offset..mac2_offset + 16]
    }

    /// Build the cookie reply for a message whose MAC2 failed under load.
    /// The cookie is sealed to the sender under the recipient's cookie key
    /// with the received MAC1 as associated data, so only the party that
    /// produced that initiation can use it.
    pub fn create_reply(
        &self,
        sender_index: u32,
        src: &SocketAddr,
        mac1: &[u8; 16],
    ) -> Result<MessageCookieReply, CryptoError> {
        let cookie = self.cookie_for(src);
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = aead::xseal(&self.cookie_key.read(), &nonce, &cookie, mac1)?;
        Ok(MessageCookieReply {
            receiver: sender_index,
            nonce,
            cookie_ct: sealed.try_into().map_err(|_| CryptoError::Seal)?,
        })
    }
}

struct GeneratorState {
    last_mac1: Option<[u8; 16]>,
    cookie: Option<([u8; 16], Instant)>,
}

/// Send-side MAC computation and cookie storage. One per peer.
pub(crate) struct CookieGenerator {
    mac1_key: [u8; 32],
    cookie_key: [u8; 32],
    state: Mutex<GeneratorState>,
}

impl CookieGenerator {
    pub fn new(peer_public: &[u8; 32]) -> Self {
        Self {
            mac1_key: blake2s::hash_two(LABEL_MAC1, peer_public),
            cookie_key: blake2s::hash_two(LABEL_COOKIE, peer_public),
            state: Mutex::new(GeneratorState {
                last_mac1: None,
                cookie: None,
            }),
        }
    }

    /// Stamp MAC1 (always) and MAC2 (when a fresh cookie is held) onto a
    /// serialized handshake message.
    pub fn add_macs(&self, msg: &mut [u8], mac1_offset: usize, mac2_offset: usize) {
        let mac1 = blake2s::mac(&self.mac1_key, &msg[..mac1_offset]);
        msg[mac1_offset..mac1_offset + 16].copy_from_slice(&mac1);

        let mut state = self.state.lock();
        state.last_mac1 = Some(mac1);

        if let Some((cookie, received_at)) = state.cookie {
            if received_at.elapsed() < COOKIE_REFRESH_TIME {
                let mac2 = blake2s::mac_keyed16(&cookie, &msg[..mac2_offset]);
                msg[mac2_offset..mac2_offset + 16].copy_from_slice(&mac2);
            }
        }
    }

    /// Decrypt and store a cookie reply. Fails if we never sent a MAC1 the
    /// reply could be bound to, or if the seal does not verify.
    pub fn consume_reply(&self, reply: &MessageCookieReply) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let last_mac1 = state.last_mac1.ok_or(ProtocolError::MacVerificationFailed)?;

        let cookie = aead::xopen(&self.cookie_key, &reply.nonce, &reply.cookie_ct, &last_mac1)
            .map_err(|_| ProtocolError::MacVerificationFailed)?;
        let cookie: [u8; 16] = cookie
            .try_into()
            .map_err(|_| ProtocolError::MacVerificationFailed)?;

        state.cookie = Some((cookie, Instant::now()));
        Ok(())
    }
}
