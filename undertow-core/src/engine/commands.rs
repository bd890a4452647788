//! Command definitions for the engine actor.

use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::playback::PlaybackState;
use crate::torrent::{InfoHash, PieceBitmap, PieceIndex, TorrentDescriptor};
use crate::{Result, UndertowError};

/// Commands that can be sent to the engine actor.
///
/// Each command carries a response channel; the actor handles commands one
/// at a time, so the torrent registry needs no lock.
pub(crate) enum EngineCommand {
    /// Reserve storage for a torrent and register it.
    AddTorrent {
        descriptor: Box<TorrentDescriptor>,
        responder: oneshot::Sender<Result<InfoHash>>,
    },
    /// Start discovery and downloading.
    Start {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Queue peer addresses obtained outside the discovery sources.
    AddPeers {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Steady playback progressed.
    UpdatePosition {
        info_hash: InfoHash,
        offset: u64,
        responder: oneshot::Sender<Result<PlaybackState>>,
    },
    /// Player jumped to a new offset.
    Seek {
        info_hash: InfoHash,
        offset: u64,
        responder: oneshot::Sender<Result<PlaybackState>>,
    },
    /// Read bytes of the selected file; `wait` blocks until they are verified.
    /// Resize the readiness lookahead.
    SetLookahead {
        info_hash: InfoHash,
        lookahead_bytes: u64,
        responder: oneshot::Sender<Result<PlaybackState>>,
    },
    ReadRange {
        info_hash: InfoHash,
        start: u64,
        end: u64,
        wait: bool,
        responder: oneshot::Sender<Result<Bytes>>,
    },
    Status {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<TorrentStatus>>,
    },
    List {
        responder: oneshot::Sender<Vec<TorrentStatus>>,
    },
    /// Pin or unpin a torrent against cache eviction.
    SetKeep {
        info_hash: InfoHash,
        keep: bool,
        responder: oneshot::Sender<Result<()>>,
    },
    /// Stop the torrent and drop it from the engine.
    Remove {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<()>>,
    },
    SetRateLimits {
        download_kbps: u64,
        upload_kbps: u64,
        responder: oneshot::Sender<()>,
    },
    /// Shutdown the engine actor gracefully.
    Shutdown { responder: oneshot::Sender<()> },
}

impl EngineCommand {
    /// Answers the command with `EngineShutdown` instead of handling it.
    pub(crate) fn reject(self) {
        match self {
            Self::AddTorrent { responder, .. } => {
                let _ = responder.send(Err(UndertowError::EngineShutdown));
            }
            Self::Start { responder, .. }
            | Self::AddPeers { responder, .. }
            | Self::SetKeep { responder, .. }
            | Self::Remove { responder, .. } => {
                let _ = responder.send(Err(UndertowError::EngineShutdown));
            }
            Self::UpdatePosition { responder, .. }
            | Self::Seek { responder, .. }
            | Self::SetLookahead { responder, .. } => {
                let _ = responder.send(Err(UndertowError::EngineShutdown));
            }
            Self::ReadRange { responder, .. } => {
                let _ = responder.send(Err(UndertowError::EngineShutdown));
            }
            Self::Status { responder, .. } => {
                let _ = responder.send(Err(UndertowError::EngineShutdown));
            }
            Self::List { responder } => {
                let _ = responder.send(Vec::new());
            }
            Self::SetRateLimits { responder, .. } | Self::Shutdown { responder } => {
                let _ = responder.send(());
            }
        }
    }
}

/// Coarse lifecycle of a torrent inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    /// Added but not started
    Idle,
    Downloading,
    /// Every discovery source is failing and no peer is connected
    Stalled,
    /// Every piece is verified
    Complete,
    /// A disk write failed; the torrent stopped
    Errored,
}

/// Snapshot of one torrent for the UI collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatus {
    pub info_hash: InfoHash,
    pub name: String,
    pub state: TorrentState,
    pub playback: PlaybackState,
    /// Read position within the selected file
    pub playback_offset: u64,
    pub lookahead_bytes: u64,
    pub progress_percent: f64,
    pub download_kbps: f64,
    pub upload_kbps: f64,
    pub peers: usize,
    pub seeds: usize,
    /// Path of the streamed file below the download directory
    pub selected_file: PathBuf,
    pub file_length: u64,
    pub verified_bytes: u64,
    pub hash_failures: u64,
    /// Payload bytes received since the torrent was last started
    pub total_downloaded: u64,
    /// Payload bytes served since the torrent was last started
    pub total_uploaded: u64,
    pub files: Vec<FileStatus>,
    pub error: Option<String>,
}

/// Coverage of one file of the torrent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStatus {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
    pub verified_bytes: u64,
    pub progress_percent: f64,
}

/// Per-file coverage derived from the verified pieces.
pub(crate) fn file_statuses(descriptor: &TorrentDescriptor, bitmap: &PieceBitmap) -> Vec<FileStatus> {
    descriptor
        .files
        .iter()
        .map(|file| {
            let verified_bytes = descriptor
                .pieces_for_range(file.offset, file.end())
                .into_iter()
                .flatten()
                .map(PieceIndex::new)
                .filter(|piece| bitmap.has(*piece))
                .map(|piece| {
                    let start = descriptor.piece_offset(piece).max(file.offset);
                    let end = (descriptor.piece_offset(piece) + u64::from(descriptor.piece_size(piece)))
                        .min(file.end());
                    end - start
                })
                .sum();
            FileStatus {
                path: file.path.clone(),
                offset: file.offset,
                length: file.length,
                verified_bytes,
                progress_percent: progress_percent(verified_bytes, file.length),
            }
        })
        .collect()
}

/// Verified share of the torrent, 0.0 to 100.0.
pub(crate) fn progress_percent(verified_bytes: u64, total_bytes: u64) -> f64 {
    if total_bytes == 0 {
        return 100.0;
    }
    verified_bytes as f64 * 100.0 / total_bytes as f64
}

/// Bytes per second to KB/s.
pub(crate) fn to_kbps(bytes_per_sec: u64) -> f64 {
    bytes_per_sec as f64 / 1024.0
}
