//! Protocol core: wire formats, the Noise handshake engine, the cookie/MAC
//! layer, the index table, and the anti-replay filter.

use std::time::Duration;

pub(crate) mod cookie;
pub(crate) mod handshake;
pub(crate) mod index;
pub mod messages;
pub mod replay;

/// Noise construction identifier hashed into the initial chain key.
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// Protocol identifier mixed into the initial transcript hash.
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for the MAC1 key, HASH("mac1----" || public).
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for the cookie-reply key, HASH("cookie--" || public).
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Rekey once the outbound counter passes this.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Refuse to encrypt once the counter reaches this (2^64 - 2^13 - 1).
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13) - 1;

/// Rekey once the current keypair is this old.
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);

/// Refuse a keypair (send or receive) past this age.
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// Handshake retransmission interval; also the minimum spacing between
/// handshake initiations for the same peer.
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);

/// Passive keepalive deadline after receiving data without replying.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Cookie secret rotation period; also how long a received cookie is fresh.
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);

/// Minimum spacing between consumed initiations from one peer (20/s).
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);

/// Upper bound on handshake retransmission jitter.
pub const MAX_JITTER: Duration = Duration::from_millis(334);

/// Give up on a peer after this many unanswered handshake attempts
/// (RejectAfterTime / RekeyTimeout * 3/2, the source's 90).
pub const MAX_TIMER_HANDSHAKES: u32 = 90;

/// Per-peer outbound staging queue depth.
pub const MAX_QUEUED_PACKETS: usize = 1024;

/// Global handshake queue depth.
pub const QUEUE_HANDSHAKE_SIZE: usize = 1024;

/// Global encryption/decryption pipeline depths.
pub const QUEUE_PIPELINE_SIZE: usize = 1024;
