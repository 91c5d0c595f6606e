//! BLAKE2s hashing, MACs, and the HMAC-based key derivation chain.
//!
//! The protocol derives every symmetric key through KDF1/KDF2/KDF3, an
//! HKDF-style expansion built on RFC 2104 HMAC with BLAKE2s-256 as the
//! underlying hash. MAC1/MAC2 use keyed BLAKE2s with 128-bit output.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;
use zeroize::Zeroizing;

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// BLAKE2s-256 output length; also the chain key and hash length.
pub const HASH_LEN: usize = 32;

/// Truncated keyed-MAC length used by MAC1/MAC2 and cookies.
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 of a single input.
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// BLAKE2s-256 of two concatenated inputs, HASH(a || b).
///
/// This is the transcript-mixing shape: every MixHash step is
/// `hash_two(running_hash, appended_bytes)`.
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s-128 with a 32-byte key (MAC1, cookie derivation).
pub fn mac(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("32-byte MAC key");
    MacTrait::update(&mut m, data);
    m.finalize_fixed().into()
}

/// Keyed BLAKE2s-128 with a 16-byte key (MAC2, keyed by the cookie).
pub fn mac_keyed16(key: &[u8; MAC_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("16-byte MAC key");
    MacTrait::update(&mut m, data);
    m.finalize_fixed().into()
}

/// RFC 2104 HMAC-BLAKE2s, the PRF underneath KDF1/2/3.
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut m = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut m, data);
    m.finalize_fixed().into()
}

/// KDF1: one 32-byte output.
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let temp = Zeroizing::new(hmac(key, input));
    hmac(temp.as_ref(), &[0x01])
}

/// KDF2: two 32-byte outputs.
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = Zeroizing::new(hmac(key, input));

    let t1 = hmac(temp.as_ref(), &[0x01]);

    let mut t2_input = Zeroizing::new([0u8; HASH_LEN + 1]);
    t2_input[..HASH_LEN].copy_from_slice(&t1);
    t2_input[HASH_LEN] = 0x02;
    let t2 = hmac(temp.as_ref(), t2_input.as_ref());

    (t1, t2)
}

/// KDF3: three 32-byte outputs (chain key, τ, AEAD key during PSK mixing).
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = Zeroizing::new(hmac(key, input));

    let t1 = hmac(temp.as_ref(), &[0x01]);

    let mut chained = Zeroizing::new([0u8; HASH_LEN + 1]);
    chained[..HASH_LEN].copy_from_slice(&t1);
    chained[HASH_LEN] = 0x02;
    let t2 = hmac(temp.as_ref(), chained.as_ref());

    chained[..HASH_LEN].copy_from_slice(&t2);
    chained[HASH_LEN] = 0x03;
    let t3 = hmac(temp.as_ref(), chained.as_ref());

    (t1, t2, t3)
}
