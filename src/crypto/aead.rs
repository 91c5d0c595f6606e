//! AEAD encryption: ChaCha20-Poly1305 for handshake and transport payloads,
//! XChaCha20-Poly1305 for cookie replies.
//!
//! Transport nonces are the 64-bit message counter, little-endian, in the
//! last 8 bytes of the 96-bit nonce. Handshake AEADs always use counter 0.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use crate::error::CryptoError;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Symmetric key length.
pub const KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length (cookie replies).
pub const XNONCE_LEN: usize = 24;

fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce.into()
}

/// Seal `plaintext` under `key` with the counter nonce and `aad`.
pub fn seal(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(&counter_nonce(counter), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Seal)
}

/// Open `ciphertext` under `key` with the counter nonce and `aad`.
///
/// Any bit flipped in ciphertext, tag, or AAD fails authentication.
pub fn open(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthFailure);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(&counter_nonce(counter), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AuthFailure)
}

/// Seal with XChaCha20-Poly1305 and an explicit 24-byte nonce.
pub fn xseal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Seal)
}

/// Open with XChaCha20-Poly1305 and an explicit 24-byte nonce.
pub fn xopen(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthFailure);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AuthFailure)
}
