//! Symmetric session keypairs and the per-peer rotation slots.
//!
//! A peer holds up to three keypairs: `previous` (receive only), `current`
//! (send and receive), and `next` (receive only, installed by the responder
//! and promoted on the first valid inbound packet). All three remain
//! reachable through the index table for inbound lookup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use parking_lot::Mutex;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::error::{CryptoError, ProtocolError};
use crate::protocol::index::IndexTable;
use crate::protocol::messages::TransportHeader;
use crate::protocol::replay::ReplayFilter;
use crate::protocol::{
    REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME,
};

fn transport_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce.into()
}

/// One symmetric session: an AEAD pair, the outbound counter, and the
/// inbound replay window.
pub(crate) struct Keypair {
    send: ChaCha20Poly1305,
    receive: ChaCha20Poly1305,
    created: Instant,
    counter: AtomicU64,
    replay: Mutex<ReplayFilter>,
    pub is_initiator: bool,
    pub local_index: u32,
    pub remote_index: u32,
}

impl Keypair {
    /// Build a keypair from freshly derived keys. The key bytes are wiped
    /// by the caller's `Zeroizing` wrappers; the cipher instances keep the
    /// expanded schedule until the keypair is dropped.
    pub fn new(
        send_key: &Zeroizing<[u8; 32]>,
        recv_key: &Zeroizing<[u8; 32]>,
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        Self {
            send: ChaCha20Poly1305::new(Key::from_slice(send_key.as_ref())),
            receive: ChaCha20Poly1305::new(Key::from_slice(recv_key.as_ref())),
            created: Instant::now(),
            counter: AtomicU64::new(0),
            replay: Mutex::new(ReplayFilter::new()),
            is_initiator,
            local_index,
            remote_index,
        }
    }

    /// Allocate the next outbound counter. The counter is strictly
    /// monotonic for the life of the keypair; once the reject threshold is
    /// crossed the keypair refuses to encrypt.
    pub fn next_counter(&self) -> Result<u64, ProtocolError> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        if counter >= REJECT_AFTER_MESSAGES {
            return Err(ProtocolError::KeyExhausted);
        }
        Ok(counter)
    }

    /// Age-based refusal for both directions.
    pub fn expired(&self) -> bool {
        self.created.elapsed() >= REJECT_AFTER_TIME
    }

    /// True once the next send should be preceded by a fresh handshake.
    pub fn wants_rekey(&self) -> bool {
        self.counter.load(Ordering::Relaxed) >= REKEY_AFTER_MESSAGES
            || self.created.elapsed() >= REKEY_AFTER_TIME
    }

    /// Seal a plaintext into a complete transport datagram addressed to the
    /// remote index. Transport AEAD carries no associated data.
    pub fn seal_transport(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = self
            .send
            .encrypt(
                &transport_nonce(counter),
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::Seal)?;
        Ok(TransportHeader::assemble(self.remote_index, counter, &ciphertext))
    }

    /// Open the ciphertext of a transport datagram. Replay validation is a
    /// separate, ordered step ([`Self::validate_counter`]).
    pub fn open_transport(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.receive
            .decrypt(
                &transport_nonce(counter),
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| CryptoError::AuthFailure)
    }

    /// Window-check an authenticated counter and mark it seen.
    pub fn validate_counter(&self, counter: u64) -> bool {
        self.replay.lock().validate(counter, REJECT_AFTER_MESSAGES)
    }

    #[cfg(test)]
    pub fn set_counter_for_tests(&self, value: u64) {
        self.counter.store(value, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn stub_for_tests(local_index: u32, remote_index: u32) -> Self {
        let key = Zeroizing::new([0u8; 32]);
        Self::new(&key, &key, true, local_index, remote_index)
    }
}

#[derive(Default)]
struct Slots {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

/// The three per-peer ownership slots, rotated under one mutex.
#[derive(Default)]
pub(crate) struct Keypairs {
    slots: Mutex<Slots>,
}

fn discard(table: &IndexTable, keypair: Option<Arc<Keypair>>) {
    if let Some(keypair) = keypair {
        table.delete(keypair.local_index);
    }
}

impl Keypairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// The keypair used for outbound traffic, if any.
    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.slots.lock().current.clone()
    }

    /// Install a keypair fresh out of the handshake.
    ///
    /// Initiator: the new keypair becomes `current` immediately (`next`, if
    /// we were receiving early data on it, is demoted to `previous`).
    /// Responder: the new keypair parks in `next` until the first valid
    /// inbound packet proves the initiator holds the session keys.
    pub fn install(&self, table: &IndexTable, keypair: Arc<Keypair>) {
        let mut slots = self.slots.lock();
        let old_previous = slots.previous.take();

        if keypair.is_initiator {
            if let Some(next) = slots.next.take() {
                discard(table, slots.current.take());
                slots.previous = Some(next);
            } else {
                slots.previous = slots.current.take();
            }
            discard(table, old_previous);
            slots.current = Some(keypair);
        } else {
            discard(table, slots.next.take());
            slots.next = Some(keypair);
            discard(table, old_previous);
        }
    }

    /// Double-checked promotion of `next` after its first valid inbound
    /// packet. Returns true if `received` was promoted to `current`.
    pub fn promote_next(&self, table: &IndexTable, received: &Arc<Keypair>) -> bool {
        let mut slots = self.slots.lock();
        match &slots.next {
            Some(next) if Arc::ptr_eq(next, received) => {}
            _ => return false,
        }
        discard(table, slots.previous.take());
        slots.previous = slots.current.take();
        slots.current = slots.next.take();
        true
    }

    /// True if `keypair` occupies the `next` slot right now.
    pub fn is_next(&self, keypair: &Arc<Keypair>) -> bool {
        matches!(&self.slots.lock().next, Some(next) if Arc::ptr_eq(next, keypair))
    }

    /// Drop all three slots and revoke their indices.
    pub fn clear(&self, table: &IndexTable) {
        let mut slots = self.slots.lock();
        discard(table, slots.previous.take());
        discard(table, slots.current.take());
        discard(table, slots.next.take());
    }

    #[cfg(test)]
    pub fn snapshot_for_tests(
        &self,
    ) -> (
        Option<Arc<Keypair>>,
        Option<Arc<Keypair>>,
        Option<Arc<Keypair>>,
    ) {
        let slots = self.slots.lock();
        (
            slots.previous.clone(),
            slots.current.clone(),
            slots.next.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Peer;

    fn initiator_keypair(table: &IndexTable, peer: &Arc<Peer>) -> Arc<Keypair> {
        let index = table.new_index_for_handshake(peer);
        let keypair = Arc::new(Keypair::stub_for_tests(index, 1));
        table.swap_index_for_keypair(index, keypair.clone());
        keypair
    }

    fn responder_keypair(table: &IndexTable, peer: &Arc<Peer>) -> Arc<Keypair> {
        let index = table.new_index_for_handshake(peer);
        let key = Zeroizing::new([0u8; 32]);
        let keypair = Arc::new(Keypair::new(&key, &key, false, index, 1));
        table.swap_index_for_keypair(index, keypair.clone());
        keypair
    }

    #[tokio::test]
    async fn counter_is_monotonic_and_bounded() {
        let kp = Keypair::stub_for_tests(1, 2);
        assert_eq!(kp.next_counter().unwrap(), 0);
        assert_eq!(kp.next_counter().unwrap(), 1);

        kp.set_counter_for_tests(REJECT_AFTER_MESSAGES - 1);
        assert_eq!(kp.next_counter().unwrap(), REJECT_AFTER_MESSAGES - 1);
        assert!(matches!(
            kp.next_counter(),
            Err(ProtocolError::KeyExhausted)
        ));
    }

    #[tokio::test]
    async fn seal_open_roundtrip_and_replay() {
        let key = Zeroizing::new([9u8; 32]);
        let a = Keypair::new(&key, &key, true, 10, 20);

        let counter = a.next_counter().unwrap();
        let datagram = a.seal_transport(counter, b"ip packet bytes").unwrap();
        let header = TransportHeader::from_bytes(&datagram).unwrap();
        assert_eq!(header.receiver, 20);

        let plain = a
            .open_transport(header.counter, TransportHeader::ciphertext(&datagram))
            .unwrap();
        assert_eq!(plain, b"ip packet bytes");

        assert!(a.validate_counter(header.counter));
        assert!(!a.validate_counter(header.counter));
    }

    #[tokio::test]
    async fn initiator_rotation_moves_current_to_previous() {
        let table = IndexTable::new();
        let peer = Peer::stub_for_tests();
        let slots = Keypairs::new();

        let first = initiator_keypair(&table, &peer);
        slots.install(&table, first.clone());
        let second = initiator_keypair(&table, &peer);
        slots.install(&table, second.clone());

        let (previous, current, next) = slots.snapshot_for_tests();
        assert!(Arc::ptr_eq(&previous.unwrap(), &first));
        assert!(Arc::ptr_eq(&current.unwrap(), &second));
        assert!(next.is_none());

        // Both stay resolvable for inbound until rotated out.
        assert!(table.lookup(first.local_index).is_some());
        assert!(table.lookup(second.local_index).is_some());
    }

    #[tokio::test]
    async fn responder_parks_in_next_until_promoted() {
        let table = IndexTable::new();
        let peer = Peer::stub_for_tests();
        let slots = Keypairs::new();

        let kp = responder_keypair(&table, &peer);
        slots.install(&table, kp.clone());

        let (_, current, next) = slots.snapshot_for_tests();
        assert!(current.is_none());
        assert!(Arc::ptr_eq(&next.unwrap(), &kp));

        assert!(slots.promote_next(&table, &kp));
        let (_, current, next) = slots.snapshot_for_tests();
        assert!(Arc::ptr_eq(&current.unwrap(), &kp));
        assert!(next.is_none());

        // Second promotion attempt is a no-op.
        assert!(!slots.promote_next(&table, &kp));
    }

    #[tokio::test]
    async fn old_previous_is_revoked_on_install() {
        let table = IndexTable::new();
        let peer = Peer::stub_for_tests();
        let slots = Keypairs::new();

        let first = initiator_keypair(&table, &peer);
        let second = initiator_keypair(&table, &peer);
        let third = initiator_keypair(&table, &peer);
        slots.install(&table, first.clone());
        slots.install(&table, second.clone());
        slots.install(&table, third.clone());

        // first fell off the end: index revoked.
        assert!(table.lookup(first.local_index).is_none());
        assert!(table.lookup(second.local_index).is_some());
        assert!(table.lookup(third.local_index).is_some());
    }

    #[tokio::test]
    async fn clear_revokes_everything() {
        let table = IndexTable::new();
        let peer = Peer::stub_for_tests();
        let slots = Keypairs::new();

        let first = initiator_keypair(&table, &peer);
        slots.install(&table, first.clone());
        slots.clear(&table);

        assert!(table.lookup(first.local_index).is_none());
        let (previous, current, next) = slots.snapshot_for_tests();
        assert!(previous.is_none() && current.is_none() && next.is_none());
    }
}
