//! Process-wide index table: 32-bit receiver indices to handshakes and
//! keypairs.
//!
//! Indices are drawn uniformly at random and never reused while the target
//! exists; collisions are resolved by retrying the draw. Reads vastly
//! outnumber writes (writes happen only at handshake completion and
//! teardown), so entries live under a read-write lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::keypair::Keypair;
use crate::peer::Peer;

/// What a receiver index currently resolves to.
#[derive(Clone)]
pub(crate) enum IndexEntry {
    /// An in-flight handshake; the state lives inside the peer.
    Handshake(Arc<Peer>),
    /// An established session.
    Keypair(Arc<Peer>, Arc<Keypair>),
}

impl IndexEntry {
    pub fn peer(&self) -> &Arc<Peer> {
        match self {
            IndexEntry::Handshake(peer) => peer,
            IndexEntry::Keypair(peer, _) => peer,
        }
    }
}

#[derive(Default)]
pub(crate) struct IndexTable {
    entries: RwLock<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh index bound to the peer's handshake. Zero is never
    /// issued; it marks "no index" in handshake state.
    pub fn new_index_for_handshake(&self, peer: &Arc<Peer>) -> u32 {
        loop {
            let index: u32 = rand::thread_rng().gen();
            if index == 0 {
                continue;
            }
            let mut entries = self.entries.write();
            if entries.contains_key(&index) {
                continue;
            }
            entries.insert(index, IndexEntry::Handshake(peer.clone()));
            return index;
        }
    }

    /// Atomically rebind `index` from its handshake to a derived keypair.
    /// No-op if the index has already been deleted.
    pub fn swap_index_for_keypair(&self, index: u32, keypair: Arc<Keypair>) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&index) {
            let peer = entry.peer().clone();
            *entry = IndexEntry::Keypair(peer, keypair);
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry> {
        self.entries.read().get(&index).cloned()
    }

    /// Idempotent removal; deleting index zero or an absent index is a no-op.
    pub fn delete(&self, index: u32) {
        if index == 0 {
            return;
        }
        self.entries.write().remove(&index);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}
