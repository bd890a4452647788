//! Actor implementation for the streaming engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::commands::{
    EngineCommand, TorrentState, TorrentStatus, file_statuses, progress_percent, to_kbps,
};
use super::handle::EngineHandle;
use super::session::{SessionContext, SessionHandle};
use crate::bandwidth::{Direction, RateLimiter};
use crate::config::UndertowConfig;
use crate::events::{EventReceiver, EventSender, event_channel};
use crate::janitor::{ActivePlayback, CacheJanitor};
use crate::playback::{PlaybackCursor, PlaybackState};
use crate::storage::{PieceStore, StorageError};
use crate::swarm::Blocklist;
use crate::torrent::{InfoHash, TorrentDescriptor};
use crate::{Result, UndertowError};

/// Spawns the engine actor and returns its handle and event stream.
///
/// Validates the configuration, loads the blocklist, opens the piece store
/// and starts the cache janitor before the actor accepts commands.
///
/// # Errors
///
/// - `UndertowError::ConfigurationRejected` - Invalid settings or unreadable blocklist
/// - `UndertowError::Storage` - Download directory or cache table unusable
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() -> undertow_core::Result<()> {
/// use undertow_core::{UndertowConfig, spawn_engine};
///
/// let (handle, mut events) = spawn_engine(UndertowConfig::from_env()).await?;
/// tokio::spawn(async move {
///     while let Some(event) = events.recv().await {
///         println!("{event:?}");
///     }
/// });
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub async fn spawn_engine(config: UndertowConfig) -> Result<(EngineHandle, EventReceiver)> {
    config.validate()?;

    let blocklist = match &config.privacy.blocklist_path {
        Some(path) => Blocklist::load(path)
            .await
            .map_err(|e| UndertowError::ConfigurationRejected {
                reason: e.to_string(),
            })?,
        None => Blocklist::default(),
    };

    let (events, receiver) = event_channel();
    let store = Arc::new(PieceStore::open(&config.storage.download_dir, events.clone()).await?);
    let limiter = Arc::new(RateLimiter::from_kbps(
        config.bandwidth.download_limit_kbps,
        config.bandwidth.upload_limit_kbps,
    ));
    let active = ActivePlayback::default();
    let janitor = CacheJanitor::new(
        Arc::clone(&store),
        config.cache.retention_days,
        active.clone(),
    )
    .spawn(config.cache.sweep_interval);

    let listen_port = config.effective_listen_port();
    tracing::info!(
        "spawn_engine: download_dir={} listen_port={listen_port} encryption={:?} proxy={}",
        config.storage.download_dir.display(),
        config.privacy.encryption,
        config
            .privacy
            .proxy
            .as_ref()
            .map_or_else(|| "none".to_string(), ToString::to_string),
    );

    let engine = Engine {
        config: Arc::new(config),
        store,
        limiter,
        blocklist: Arc::new(blocklist),
        active,
        events,
        listen_port,
        torrents: HashMap::new(),
        janitor,
    };

    let (sender, commands) = mpsc::channel(100);
    tokio::spawn(run_actor_loop(engine, commands));
    Ok((EngineHandle::new(sender), receiver))
}

struct TorrentEntry {
    descriptor: Arc<TorrentDescriptor>,
    cursor: Arc<Mutex<PlaybackCursor>>,
    session: Option<SessionHandle>,
}

/// State owned by the actor task.
struct Engine {
    config: Arc<UndertowConfig>,
    store: Arc<PieceStore>,
    limiter: Arc<RateLimiter>,
    blocklist: Arc<Blocklist>,
    active: ActivePlayback,
    events: EventSender,
    listen_port: u16,
    torrents: HashMap<InfoHash, TorrentEntry>,
    janitor: JoinHandle<()>,
}

/// Processes commands in order until shutdown or until every handle is
/// dropped.
async fn run_actor_loop(mut engine: Engine, mut commands: mpsc::Receiver<EngineCommand>) {
    tracing::debug!("Engine actor started");

    while let Some(command) = commands.recv().await {
        if let EngineCommand::Shutdown { responder } = command {
            engine.shutdown().await;
            commands.close();
            while let Some(pending) = commands.recv().await {
                pending.reject();
            }
            let _ = responder.send(());
            tracing::debug!("Engine actor stopped");
            return;
        }
        engine.handle_command(command).await;
    }

    engine.shutdown().await;
    tracing::debug!("Engine actor stopped");
}

impl Engine {
    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::AddTorrent {
                descriptor,
                responder,
            } => {
                let _ = responder.send(self.add_torrent(*descriptor).await);
            }
            EngineCommand::Start {
                info_hash,
                responder,
            } => {
                let _ = responder.send(self.start(info_hash).await);
            }
            EngineCommand::AddPeers {
                info_hash,
                peers,
                responder,
            } => {
                let _ = responder.send(self.add_peers(info_hash, peers));
            }
            EngineCommand::UpdatePosition {
                info_hash,
                offset,
                responder,
            } => {
                let _ = responder.send(self.move_cursor(info_hash, offset, false));
            }
            EngineCommand::Seek {
                info_hash,
                offset,
                responder,
            } => {
                let _ = responder.send(self.move_cursor(info_hash, offset, true));
            }
            EngineCommand::SetLookahead {
                info_hash,
                lookahead_bytes,
                responder,
            } => {
                let _ = responder.send(self.set_lookahead(info_hash, lookahead_bytes));
            }
            EngineCommand::ReadRange {
                info_hash,
                start,
                end,
                wait,
                responder,
            } => self.read_range(info_hash, start, end, wait, responder).await,
            EngineCommand::Status {
                info_hash,
                responder,
            } => {
                let _ = responder.send(self.status(info_hash));
            }
            EngineCommand::List { responder } => {
                let mut statuses: Vec<TorrentStatus> = self
                    .torrents
                    .keys()
                    .filter_map(|&info_hash| self.status(info_hash).ok())
                    .collect();
                statuses.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = responder.send(statuses);
            }
            EngineCommand::SetKeep {
                info_hash,
                keep,
                responder,
            } => {
                let result = if self.store.set_keep(info_hash, keep) {
                    self.store.flush_cache().await.map_err(UndertowError::from)
                } else {
                    Err(UndertowError::TorrentNotFound { info_hash })
                };
                let _ = responder.send(result);
            }
            EngineCommand::Remove {
                info_hash,
                responder,
            } => {
                let _ = responder.send(self.remove(info_hash).await);
            }
            EngineCommand::SetRateLimits {
                download_kbps,
                upload_kbps,
                responder,
            } => {
                self.limiter
                    .set_rate(Direction::Download, download_kbps.saturating_mul(1024));
                self.limiter
                    .set_rate(Direction::Upload, upload_kbps.saturating_mul(1024));
                tracing::info!(
                    "Engine::set_rate_limits: download_kbps={download_kbps} upload_kbps={upload_kbps}"
                );
                let _ = responder.send(());
            }
            EngineCommand::Shutdown { responder } => {
                self.shutdown().await;
                let _ = responder.send(());
            }
        }
    }

    fn entry(&self, info_hash: InfoHash) -> Result<&TorrentEntry> {
        self.torrents
            .get(&info_hash)
            .ok_or(UndertowError::TorrentNotFound { info_hash })
    }

    async fn add_torrent(&mut self, descriptor: TorrentDescriptor) -> Result<InfoHash> {
        let info_hash = descriptor.info_hash;
        if self.torrents.contains_key(&info_hash) {
            self.store.touch(info_hash);
            return Ok(info_hash);
        }
        descriptor.validate()?;

        let handle = self.store.reserve(descriptor).await?;
        let coverage = self
            .store
            .bitmap(info_hash)
            .ok_or(StorageError::TorrentNotReserved { info_hash })?;
        let mut cursor = PlaybackCursor::new(
            Arc::clone(&handle.descriptor),
            self.config.streaming.lookahead_bytes,
            self.events.clone(),
        );
        cursor.on_coverage_changed(&coverage);

        tracing::info!(
            "Engine::add_torrent: info_hash={info_hash} name={} pieces={} resumed={} file={}",
            handle.descriptor.name,
            handle.descriptor.piece_count(),
            handle.resumed_pieces,
            cursor.file().path.display()
        );
        self.torrents.insert(
            info_hash,
            TorrentEntry {
                descriptor: handle.descriptor,
                cursor: Arc::new(Mutex::new(cursor)),
                session: None,
            },
        );
        Ok(info_hash)
    }

    async fn start(&mut self, info_hash: InfoHash) -> Result<()> {
        let entry = self.entry(info_hash)?;
        if entry.session.as_ref().is_some_and(SessionHandle::is_running) {
            return Ok(());
        }
        if let Some(reason) = self.store.failure(info_hash) {
            return Err(UndertowError::TorrentErrored { info_hash, reason });
        }

        if let Some(proxy) = &self.config.privacy.proxy {
            proxy
                .probe(self.config.network.peer_connect_timeout)
                .await
                .map_err(|e| UndertowError::ConfigurationRejected {
                    reason: e.to_string(),
                })?;
        }

        let context = SessionContext {
            descriptor: Arc::clone(&entry.descriptor),
            store: Arc::clone(&self.store),
            limiter: Arc::clone(&self.limiter),
            blocklist: Arc::clone(&self.blocklist),
            cursor: Arc::clone(&entry.cursor),
            events: self.events.clone(),
            config: Arc::clone(&self.config),
            listen_port: self.listen_port,
        };
        let session = SessionHandle::spawn(context);
        self.active.insert(info_hash);
        self.store.touch(info_hash);
        if let Some(entry) = self.torrents.get_mut(&info_hash) {
            entry.session = Some(session);
        }
        Ok(())
    }

    fn add_peers(&self, info_hash: InfoHash, peers: Vec<SocketAddr>) -> Result<()> {
        let entry = self.entry(info_hash)?;
        match &entry.session {
            Some(session) => {
                session.add_peers(peers);
                Ok(())
            }
            None => Err(UndertowError::ConfigurationRejected {
                reason: format!("torrent {info_hash} has not been started"),
            }),
        }
    }

    fn move_cursor(&self, info_hash: InfoHash, offset: u64, seek: bool) -> Result<PlaybackState> {
        let entry = self.entry(info_hash)?;
        let coverage = self
            .store
            .bitmap(info_hash)
            .ok_or(StorageError::TorrentNotReserved { info_hash })?;
        let state = {
            let mut cursor = entry.cursor.lock();
            if seek {
                cursor.seek(offset, &coverage)
            } else {
                cursor.update_position(offset, &coverage)
            }
        };
        self.store.touch(info_hash);
        if let Some(session) = &entry.session {
            session.reschedule();
        }
        Ok(state)
    }

    fn set_lookahead(&self, info_hash: InfoHash, lookahead_bytes: u64) -> Result<PlaybackState> {
        let entry = self.entry(info_hash)?;
        let coverage = self
            .store
            .bitmap(info_hash)
            .ok_or(StorageError::TorrentNotReserved { info_hash })?;
        let state = {
            let mut cursor = entry.cursor.lock();
            cursor.set_lookahead(lookahead_bytes);
            let offset = cursor.window().offset;
            cursor.update_position(offset, &coverage)
        };
        tracing::debug!("Engine::set_lookahead: info_hash={info_hash} lookahead={lookahead_bytes}");
        if let Some(session) = &entry.session {
            session.reschedule();
        }
        Ok(state)
    }

    /// Reads `[start, end)` of the selected file. With `wait` the read runs
    /// on its own task so the actor keeps serving commands.
    async fn read_range(
        &self,
        info_hash: InfoHash,
        start: u64,
        end: u64,
        wait: bool,
        responder: oneshot::Sender<Result<Bytes>>,
    ) {
        let file = match self.entry(info_hash) {
            Ok(entry) => entry.cursor.lock().file().clone(),
            Err(error) => {
                let _ = responder.send(Err(error));
                return;
            }
        };
        if start > end || end > file.length {
            let _ = responder.send(Err(StorageError::InvalidRange {
                start,
                end,
                total: file.length,
            }
            .into()));
            return;
        }

        let (start, end) = (file.offset + start, file.offset + end);
        if !wait {
            let result = self.store.read_range(info_hash, start, end).await;
            let _ = responder.send(result.map_err(UndertowError::from));
            return;
        }
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let result = store.wait_for_range(info_hash, start, end).await;
            let _ = responder.send(result.map_err(UndertowError::from));
        });
    }

    fn status(&self, info_hash: InfoHash) -> Result<TorrentStatus> {
        let entry = self.entry(info_hash)?;
        let descriptor = &entry.descriptor;
        let (playback, window, file) = {
            let cursor = entry.cursor.lock();
            (cursor.state(), cursor.window(), cursor.file().clone())
        };
        let verified_bytes = self.store.verified_bytes(info_hash);
        let error = self.store.failure(info_hash);
        let bitmap = self.store.bitmap(info_hash);
        let complete = bitmap.as_ref().is_some_and(|bitmap| bitmap.is_complete());
        let files = bitmap
            .map(|bitmap| file_statuses(descriptor, &bitmap))
            .unwrap_or_default();

        let (peers, (download_bps, upload_bps), (downloaded, uploaded), exhausted) =
            match &entry.session {
                Some(session) => (
                    session.peers(),
                    session.throughput(),
                    session.transferred(),
                    session.sources_exhausted(),
                ),
                None => (Vec::new(), (0, 0), (0, 0), false),
            };
        let state = if error.is_some() {
            TorrentState::Errored
        } else if complete {
            TorrentState::Complete
        } else if entry.session.as_ref().is_none_or(|s| !s.is_running()) {
            TorrentState::Idle
        } else if exhausted && peers.is_empty() {
            TorrentState::Stalled
        } else {
            TorrentState::Downloading
        };

        Ok(TorrentStatus {
            info_hash,
            name: descriptor.name.clone(),
            state,
            playback,
            playback_offset: window.offset,
            lookahead_bytes: window.lookahead,
            progress_percent: progress_percent(verified_bytes, descriptor.total_length),
            download_kbps: to_kbps(download_bps),
            upload_kbps: to_kbps(upload_bps),
            seeds: peers.iter().filter(|peer| peer.is_seed()).count(),
            peers: peers.len(),
            selected_file: file.path,
            file_length: file.length,
            verified_bytes,
            hash_failures: self.store.hash_failures(info_hash),
            total_downloaded: downloaded,
            total_uploaded: uploaded,
            files,
            error,
        })
    }

    async fn remove(&mut self, info_hash: InfoHash) -> Result<()> {
        let entry = self
            .torrents
            .remove(&info_hash)
            .ok_or(UndertowError::TorrentNotFound { info_hash })?;
        if let Some(session) = &entry.session {
            session.stop();
        }
        drop(entry);
        self.active.remove(info_hash);

        let pinned = self
            .store
            .cache_entries()
            .iter()
            .any(|cached| cached.info_hash == info_hash && cached.keep);
        if self.config.storage.keep_files || pinned {
            self.store.release(info_hash).await;
            self.store.flush_cache().await?;
            tracing::info!("Engine::remove: info_hash={info_hash} data kept");
        } else {
            self.store.delete(info_hash).await?;
            tracing::info!("Engine::remove: info_hash={info_hash} data deleted");
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        tracing::info!("Engine::shutdown: torrents={}", self.torrents.len());
        let torrents: Vec<_> = self.torrents.drain().collect();
        for (info_hash, entry) in torrents {
            if let Some(session) = &entry.session {
                session.stop();
            }
            self.active.remove(info_hash);
            self.store.release(info_hash).await;
        }
        self.janitor.abort();
        if let Err(error) = self.store.flush_cache().await {
            tracing::warn!("Engine::shutdown: cache table flush failed: {error}");
        }
    }
}
