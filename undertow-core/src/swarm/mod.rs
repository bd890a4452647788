//! Peer swarm: discovery, connection establishment and per-peer messaging.
//!
//! A `SwarmManager` owns the live connections of one torrent. Connections are
//! established through an optional SOCKS5 proxy, optionally wrapped in MSE/PE
//! stream encryption, and rate limited through the engine-wide `RateLimiter`.

pub mod blocklist;
pub mod discovery;
pub mod manager;
pub mod mse;
pub mod peer;
pub mod protocol;
pub mod proxy;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_peer;
pub mod throughput;
pub mod transport;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub use blocklist::{Blocklist, BlocklistError};
pub use discovery::{AnnounceRequest, AnnounceResponse, DiscoveryEvent, HttpTracker, PeerDiscovery};
pub use manager::{SwarmConfig, SwarmManager};
pub use peer::{PeerEvent, PeerLifecycle, PeerSnapshot};
pub use protocol::{PeerId, PeerMessage};
pub use proxy::ProxyConfig;

/// Whether peer connections negotiate MSE/PE stream encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    /// Plaintext only.
    Disabled,
    /// Try encryption first and fall back to plaintext on a fresh connection.
    #[default]
    Enabled,
    /// Never fall back to plaintext.
    Required,
}

/// Errors raised by swarm operations.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Peer connection to {address} failed: {reason}")]
    PeerConnectionFailure { address: SocketAddr, reason: String },

    #[error("Discovery source {url} failed: {reason}")]
    DiscoverySourceFailure { url: String, reason: String },

    #[error("Proxy {proxy} unavailable: {reason}")]
    ProxyUnavailable { proxy: String, reason: String },

    #[error("Peer {address} blocked by blocklist")]
    Blocked { address: SocketAddr },

    #[error("Peer {address} not connected")]
    PeerNotConnected { address: SocketAddr },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn connection(address: SocketAddr, reason: impl Into<String>) -> Self {
        Self::PeerConnectionFailure {
            address,
            reason: reason.into(),
        }
    }
}
