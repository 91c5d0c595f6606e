//! quietwire - a userspace WireGuard-compatible secure tunnel transport.
//!
//! Peers authenticate each other by long-term Curve25519 public key,
//! negotiate fresh symmetric keys through the Noise IKpsk2 handshake
//! (pre-shared key supported, 2-RTT rekey), and exchange authenticated,
//! replay-protected datagrams over UDP.
//!
//! The crate is the transport core only. Sockets are abstracted behind
//! [`bind::UdpBind`]; decrypted IP packets are handed to the caller for
//! host-stack injection and outbound packets are submitted per peer - the
//! mapping from destination address to peer is the caller's concern.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use quietwire::{PeerOptions, Transport, UdpSocketBind};
//!
//! # async fn run(private_key: [u8; 32], peer_public: [u8; 32]) -> quietwire::Result<()> {
//! let (bind, _port) = UdpSocketBind::open(51820).await?;
//! let (transport, mut inbound) = Transport::new(private_key, Arc::new(bind));
//! transport.add_peer(
//!     peer_public,
//!     PeerOptions {
//!         endpoint: Some("203.0.113.9:51820".parse().unwrap()),
//!         ..Default::default()
//!     },
//! )?;
//! transport.start();
//!
//! transport.send_packet(&peer_public, b"...ip packet...".to_vec()).await?;
//! while let Some(packet) = inbound.recv().await {
//!     // inject packet.packet into the host stack
//! }
//! # Ok(())
//! # }
//! ```

pub mod bind;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;

mod keypair;
mod peer;
mod timers;
mod transport;

pub use bind::{UdpBind, UdpSocketBind};
pub use config::{Config, PeerConfig};
pub use error::{ConfigError, CryptoError, Error, ProtocolError, Result};
pub use peer::PeerStats;
pub use transport::{InboundPacket, PeerOptions, Transport};
