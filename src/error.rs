//! Error types for the tunnel transport.

use thiserror::Error;

/// Top-level error for transport operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket I/O errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration document errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported config kind {kind:?} (apiVersion {api_version:?})")]
    UnsupportedKind { api_version: String, kind: String },

    #[error("invalid base64 key in field {field}")]
    InvalidKey { field: String },

    #[error("invalid address {value:?}")]
    InvalidAddress { value: String },

    #[error("invalid document: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,

    #[error("authentication failed")]
    AuthFailure,

    /// The remote static key (or a derived shared secret) is all-zero.
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Protocol state machine errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message too short: expected {expected}, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("invalid message type {msg_type}")]
    InvalidMessageType { msg_type: u32 },

    #[error("mac verification failed")]
    MacVerificationFailed,

    /// Initiation replayed (stale timestamp) or arriving faster than the
    /// per-peer handshake rate.
    #[error("handshake replay or flood")]
    ReplayOrFlood,

    #[error("invalid handshake state: {state}")]
    WrongState { state: &'static str },

    /// No current keypair to encrypt under.
    #[error("no valid keypair")]
    NoKeypair,

    /// The keypair hit RejectAfterMessages or RejectAfterTime.
    #[error("key exhausted")]
    KeyExhausted,

    #[error("unknown receiver index {index}")]
    UnknownIndex { index: u32 },

    #[error("unknown peer")]
    UnknownPeer,

    #[error("peer not running")]
    PeerNotRunning,

    /// A pipeline queue was closed during shutdown.
    #[error("queue closed")]
    QueueClosed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
