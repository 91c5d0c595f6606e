//! Cryptographic primitives for the tunnel transport.
//!
//! Everything here is fixed by the protocol: BLAKE2s for hashing, MACs and
//! key derivation (blake2s), ChaCha20-Poly1305 and XChaCha20-Poly1305 for
//! AEAD (aead), and Curve25519 Diffie-Hellman (x25519).

pub mod aead;
pub mod blake2s;
pub mod x25519;
