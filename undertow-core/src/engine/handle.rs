//! Handle for communicating with the engine actor.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::commands::{EngineCommand, TorrentStatus};
use crate::playback::PlaybackState;
use crate::torrent::{InfoHash, TorrentDescriptor};
use crate::{Result, UndertowError};

/// Handle for communicating with the engine actor.
///
/// Cheap to clone; every clone talks to the same actor. Once the engine has
/// shut down every call returns `UndertowError::EngineShutdown`.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub(crate) fn new(sender: mpsc::Sender<EngineCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(build(responder))
            .await
            .map_err(|_| UndertowError::EngineShutdown)?;
        rx.await.map_err(|_| UndertowError::EngineShutdown)
    }

    /// Registers a torrent and reserves its storage.
    ///
    /// Adding a torrent that is already registered returns its info hash.
    ///
    /// # Errors
    /// - `UndertowError::Torrent` - Descriptor fails validation
    /// - `UndertowError::Storage` - Files could not be allocated
    pub async fn add_torrent(&self, descriptor: TorrentDescriptor) -> Result<InfoHash> {
        self.request(|responder| EngineCommand::AddTorrent {
            descriptor: Box::new(descriptor),
            responder,
        })
        .await?
    }

    /// Starts peer discovery and downloading. Idempotent while running.
    ///
    /// # Errors
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    /// - `UndertowError::ConfigurationRejected` - Configured proxy is unreachable
    /// - `UndertowError::TorrentErrored` - Torrent stopped after a disk failure
    pub async fn start(&self, info_hash: InfoHash) -> Result<()> {
        self.request(|responder| EngineCommand::Start {
            info_hash,
            responder,
        })
        .await?
    }

    /// Queues peer addresses learned outside the discovery sources.
    ///
    /// # Errors
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    /// - `UndertowError::ConfigurationRejected` - Torrent has not been started
    pub async fn add_peers(&self, info_hash: InfoHash, peers: Vec<SocketAddr>) -> Result<()> {
        self.request(|responder| EngineCommand::AddPeers {
            info_hash,
            peers,
            responder,
        })
        .await?
    }

    /// Reports steady playback progress at `offset` within the selected file.
    ///
    /// # Errors
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    pub async fn update_position(&self, info_hash: InfoHash, offset: u64) -> Result<PlaybackState> {
        self.request(|responder| EngineCommand::UpdatePosition {
            info_hash,
            offset,
            responder,
        })
        .await?
    }

    /// Moves playback to `offset`; the urgent window jumps with it.
    ///
    /// # Errors
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    pub async fn seek(&self, info_hash: InfoHash, offset: u64) -> Result<PlaybackState> {
        self.request(|responder| EngineCommand::Seek {
            info_hash,
            offset,
            responder,
        })
        .await?
    }

    /// Changes how many bytes past the read position must be verified before
    /// playback is `Ready`.
    ///
    /// # Errors
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    pub async fn set_lookahead(&self, info_hash: InfoHash, lookahead_bytes: u64) -> Result<PlaybackState> {
        self.request(|responder| EngineCommand::SetLookahead {
            info_hash,
            lookahead_bytes,
            responder,
        })
        .await?
    }

    /// Reads `[start, end)` of the selected file if it is fully verified.
    ///
    /// # Errors
    /// - `UndertowError::Storage` - `DataNotReady` or `InvalidRange`
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    pub async fn read_range(&self, info_hash: InfoHash, start: u64, end: u64) -> Result<Bytes> {
        self.request(|responder| EngineCommand::ReadRange {
            info_hash,
            start,
            end,
            wait: false,
            responder,
        })
        .await?
    }

    /// Like `read_range`, but waits until every piece under the range is
    /// verified.
    ///
    /// # Errors
    /// - `UndertowError::Storage` - `InvalidRange`, or the torrent errored
    ///   while waiting
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    pub async fn wait_for_range(&self, info_hash: InfoHash, start: u64, end: u64) -> Result<Bytes> {
        self.request(|responder| EngineCommand::ReadRange {
            info_hash,
            start,
            end,
            wait: true,
            responder,
        })
        .await?
    }

    /// # Errors
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    pub async fn status(&self, info_hash: InfoHash) -> Result<TorrentStatus> {
        self.request(|responder| EngineCommand::Status {
            info_hash,
            responder,
        })
        .await?
    }

    /// Status of every registered torrent, ordered by name.
    ///
    /// # Errors
    /// - `UndertowError::EngineShutdown` - Engine has stopped
    pub async fn list(&self) -> Result<Vec<TorrentStatus>> {
        self.request(|responder| EngineCommand::List { responder })
            .await
    }

    /// Pins (`true`) or unpins a torrent against cache eviction.
    ///
    /// # Errors
    /// - `UndertowError::TorrentNotFound` - No cache entry for the torrent
    pub async fn set_keep(&self, info_hash: InfoHash, keep: bool) -> Result<()> {
        self.request(|responder| EngineCommand::SetKeep {
            info_hash,
            keep,
            responder,
        })
        .await?
    }

    /// Stops the torrent and unregisters it. Data is deleted unless the
    /// torrent is pinned or `keep_files` is set.
    ///
    /// # Errors
    /// - `UndertowError::TorrentNotFound` - Torrent was never added
    /// - `UndertowError::Storage` - Data could not be removed
    pub async fn remove(&self, info_hash: InfoHash) -> Result<()> {
        self.request(|responder| EngineCommand::Remove {
            info_hash,
            responder,
        })
        .await?
    }

    /// Applies new global limits in KB/s; zero means unlimited.
    ///
    /// # Errors
    /// - `UndertowError::EngineShutdown` - Engine has stopped
    pub async fn set_rate_limits(&self, download_kbps: u64, upload_kbps: u64) -> Result<()> {
        self.request(|responder| EngineCommand::SetRateLimits {
            download_kbps,
            upload_kbps,
            responder,
        })
        .await
    }

    /// Stops every session and the janitor, then flushes the cache table.
    ///
    /// # Errors
    /// - `UndertowError::EngineShutdown` - Engine had already stopped
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|responder| EngineCommand::Shutdown { responder })
            .await
    }
}
