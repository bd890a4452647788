//! Undertow Core - streaming-aware BitTorrent swarm engine
//!
//! Turns pieces scattered across a swarm into a growing, seekable local file
//! that a media player can read while the transfer runs. The engine balances
//! rarest-first swarm health against an urgent window around the playback
//! position, under user bandwidth, proxy, encryption and retention policy.

pub mod bandwidth;
pub mod config;
pub mod engine;
pub mod events;
pub mod janitor;
pub mod playback;
pub mod scheduler;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use bandwidth::{Direction, RateLimiter};
pub use config::UndertowConfig;
pub use engine::{EngineHandle, FileStatus, TorrentStatus, spawn_engine};
pub use events::{EngineEvent, EventReceiver};
pub use janitor::{CacheJanitor, SweepReport};
pub use playback::{PlaybackCursor, PlaybackState};
pub use scheduler::PieceScheduler;
pub use storage::{PieceStore, StorageError};
pub use swarm::{SwarmError, SwarmManager};
pub use torrent::{InfoHash, PieceIndex, TorrentDescriptor, TorrentError};

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Swarm error: {0}")]
    Swarm(#[from] SwarmError),

    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Configuration rejected: {reason}")]
    ConfigurationRejected { reason: String },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} errored: {reason}")]
    TorrentErrored { info_hash: InfoHash, reason: String },

    #[error("Engine has shut down")]
    EngineShutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Storage(e) => match e {
                StorageError::DiskWriteFailure { path, .. } => {
                    format!("Could not write to {}; check free space and permissions", path.display())
                }
                StorageError::DataNotReady { .. } => "Still buffering".to_string(),
                _ => "Storage error occurred".to_string(),
            },
            UndertowError::Swarm(e) => match e {
                SwarmError::ProxyUnavailable { proxy, .. } => {
                    format!("Proxy {proxy} is not reachable")
                }
                SwarmError::DiscoverySourceFailure { url, .. } => {
                    format!("Could not reach tracker: {url}")
                }
                _ => "Peer connection error occurred".to_string(),
            },
            UndertowError::Torrent(TorrentError::InvalidTorrentFile { reason }) => {
                format!("Invalid torrent file: {reason}")
            }
            UndertowError::Torrent(_) => "Invalid torrent".to_string(),
            UndertowError::ConfigurationRejected { reason } => {
                format!("Invalid settings: {reason}")
            }
            UndertowError::TorrentNotFound { .. } => "Torrent is no longer loaded".to_string(),
            UndertowError::TorrentErrored { reason, .. } => {
                format!("Download stopped: {reason}")
            }
            UndertowError::EngineShutdown => "Engine is shutting down".to_string(),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::ConfigurationRejected { .. }
                | UndertowError::Torrent(TorrentError::InvalidTorrentFile { .. })
                | UndertowError::Torrent(TorrentError::InvalidDescriptor { .. })
        )
    }

    /// True only for failures that stop the affected torrent.
    pub fn is_fatal_for_torrent(&self) -> bool {
        matches!(
            self,
            UndertowError::Storage(StorageError::DiskWriteFailure { .. })
                | UndertowError::TorrentErrored { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_is_fatal_for_torrent_only_disk_write() {
        let disk = UndertowError::from(StorageError::DiskWriteFailure {
            path: PathBuf::from("/media/full"),
            reason: "No space left on device".to_string(),
        });
        assert!(disk.is_fatal_for_torrent());
        assert!(disk.user_message().contains("/media/full"));

        let mismatch = UndertowError::from(StorageError::HashMismatch {
            index: PieceIndex::new(3),
        });
        assert!(!mismatch.is_fatal_for_torrent());

        let peer = UndertowError::from(SwarmError::PeerConnectionFailure {
            address: "10.0.0.1:6881".parse().unwrap(),
            reason: "refused".to_string(),
        });
        assert!(!peer.is_fatal_for_torrent());
        assert!(!peer.is_user_error());
    }

    #[test]
    fn test_is_user_error_configuration() {
        let error = UndertowError::ConfigurationRejected {
            reason: "bad proxy".to_string(),
        };
        assert!(error.is_user_error());
        assert_eq!(error.user_message(), "Invalid settings: bad proxy");
    }
}
