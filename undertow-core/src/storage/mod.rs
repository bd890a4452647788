//! Storage layer for torrent data.
//!
//! The piece store buffers incoming blocks per piece, verifies completed
//! pieces against their SHA-1 and only then writes them through the file
//! layout. Coverage bitmaps and the cache table are persisted so partially
//! downloaded torrents resume after a restart.

pub mod cache_index;
mod layout;
mod persist;
pub mod piece_store;
#[cfg(test)]
mod piece_store_tests;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use std::path::{Path, PathBuf};

pub use cache_index::{CacheEntry, CacheIndex};
pub use piece_store::{BlockOutcome, PieceStore, StoreHandle};

use crate::torrent::{InfoHash, PieceIndex};

/// Verification state of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PieceStatus {
    /// No block requested yet, or discarded after a hash mismatch
    Missing,
    /// At least one block requested or received
    Requested,
    /// All blocks present and the hash matched
    Verified,
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Writing piece data or bookkeeping failed; fatal for the torrent
    #[error("Disk write failed at {path}: {reason}")]
    DiskWriteFailure { path: PathBuf, reason: String },

    /// Requested range contains pieces that are not verified yet
    #[error("Data not ready for range {start}..{end}")]
    DataNotReady { start: u64, end: u64 },

    /// Completed piece did not match its expected hash; blocks were discarded
    #[error("Piece {index} hash mismatch")]
    HashMismatch { index: PieceIndex },

    /// Block offset or length does not fit the piece
    #[error("Invalid block for piece {index}: offset {offset}, length {length}")]
    InvalidBlock {
        index: PieceIndex,
        offset: u32,
        length: usize,
    },

    /// Range lies outside the torrent
    #[error("Range {start}..{end} outside torrent of {total} bytes")]
    InvalidRange { start: u64, end: u64, total: u64 },

    #[error("Torrent {info_hash} has not been reserved")]
    TorrentNotReserved { info_hash: InfoHash },

    /// Torrent previously hit a fatal write failure
    #[error("Torrent {info_hash} is errored: {reason}")]
    TorrentErrored { info_hash: InfoHash, reason: String },

    #[error("Invalid descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn disk_write(path: &Path, error: std::io::Error) -> Self {
        Self::DiskWriteFailure {
            path: path.to_path_buf(),
            reason: error.to_string(),
        }
    }

    /// True for failures the download can continue past.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. } | Self::DataNotReady { .. } | Self::InvalidBlock { .. }
        )
    }
}
