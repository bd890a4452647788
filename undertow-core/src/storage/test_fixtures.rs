//! Test fixtures for storage testing.
//!
//! Provides standardized piece store setup for consistent testing across
//! storage, scheduling and engine modules.

use crate::events::{EventReceiver, event_channel};
use crate::storage::PieceStore;
use crate::torrent::{BLOCK_SIZE, PieceIndex, TorrentDescriptor};

/// Deterministic, non-repeating content of the given length.
pub fn sample_content(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i * 31 % 251) as u8).collect()
}

/// Opens a piece store in a fresh temporary directory.
///
/// # Panics
///
/// Panics if the temporary directory or store cannot be created. This is
/// acceptable in test fixtures where failures indicate environment issues.
pub async fn create_temp_store() -> (tempfile::TempDir, PieceStore, EventReceiver) {
    let temp_dir = tempfile::tempdir().unwrap();
    let (events, receiver) = event_channel();
    let store = PieceStore::open(&temp_dir.path().join("downloads"), events)
        .await
        .unwrap();
    (temp_dir, store, receiver)
}

/// Splits one piece of `content` into its wire blocks.
pub fn piece_blocks(
    descriptor: &TorrentDescriptor,
    content: &[u8],
    piece: PieceIndex,
) -> Vec<(u32, bytes::Bytes)> {
    let start = descriptor.piece_offset(piece) as usize;
    let size = descriptor.piece_size(piece) as usize;
    content[start..start + size]
        .chunks(BLOCK_SIZE as usize)
        .enumerate()
        .map(|(i, chunk)| (i as u32 * BLOCK_SIZE, bytes::Bytes::copy_from_slice(chunk)))
        .collect()
}
