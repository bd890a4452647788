//! Per-torrent session task.
//!
//! The session glues the swarm, the scheduler, the store and the playback
//! cursor together. It reacts to peer and discovery events, keeps every
//! unchoked peer's request pipeline full, expires stale requests and
//! publishes progress. Received blocks are written on their own tasks so
//! different pieces verify and hit the disk in parallel. A disk write failure
//! stops the session; every other failure only affects the peer or source
//! that caused it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use super::commands::{progress_percent, to_kbps};
use crate::bandwidth::RateLimiter;
use crate::config::UndertowConfig;
use crate::events::{EngineEvent, EventSender};
use crate::playback::PlaybackCursor;
use crate::scheduler::{BlockRequest, PieceScheduler};
use crate::storage::{BlockOutcome, PieceStore, StorageError};
use crate::swarm::discovery::{AnnounceEvent, Backoff, DiscoveryHandle};
use crate::swarm::{
    AnnounceRequest, Blocklist, DiscoveryEvent, HttpTracker, PeerDiscovery, PeerEvent,
    PeerSnapshot, SwarmError, SwarmManager,
};
use crate::torrent::{BLOCK_SIZE, InfoHash, PieceIndex, TorrentDescriptor};

/// Period of timeout checks and progress events.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Connection attempts in flight at once.
const MAX_PENDING_CONNECTS: usize = 8;
/// Largest block a peer may ask us for.
const MAX_UPLOAD_REQUEST: u32 = 2 * BLOCK_SIZE;

type BlockWrite = (SocketAddr, PieceIndex, Result<BlockOutcome, StorageError>);

/// Failed connection attempts per address.
#[derive(Debug)]
struct ConnectRetries {
    backoff: Backoff,
    max_attempts: u32,
    failures: HashMap<SocketAddr, u32>,
}

impl ConnectRetries {
    fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts,
            failures: HashMap::new(),
        }
    }

    /// Records a failed attempt. Returns the wait before the next attempt,
    /// or `None` once the address has used up its attempts.
    fn failed(&mut self, address: SocketAddr) -> Option<Duration> {
        let failures = {
            let count = self.failures.entry(address).or_insert(0);
            *count += 1;
            *count
        };
        (failures < self.max_attempts).then(|| self.backoff.delay(failures))
    }

    fn succeeded(&mut self, address: SocketAddr) {
        self.failures.remove(&address);
    }

    fn gave_up(&self, address: SocketAddr) -> bool {
        self.failures
            .get(&address)
            .is_some_and(|&failures| failures >= self.max_attempts)
    }
}

/// Everything a session borrows from the engine.
pub(crate) struct SessionContext {
    pub descriptor: Arc<TorrentDescriptor>,
    pub store: Arc<PieceStore>,
    pub limiter: Arc<RateLimiter>,
    pub blocklist: Arc<Blocklist>,
    pub cursor: Arc<Mutex<PlaybackCursor>>,
    pub events: EventSender,
    pub config: Arc<UndertowConfig>,
    pub listen_port: u16,
}

enum SessionCommand {
    /// Playback window moved; reselect immediately.
    Reschedule,
    AddPeers(Vec<SocketAddr>),
}

#[derive(Debug, Default)]
struct SessionShared {
    sources_exhausted: AtomicBool,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    finished: AtomicBool,
}

/// Engine-side handle to a running session; stops it on drop.
pub(crate) struct SessionHandle {
    swarm: Arc<SwarmManager>,
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Builds the swarm and scheduler and starts the session task.
    pub fn spawn(context: SessionContext) -> Self {
        let descriptor = Arc::clone(&context.descriptor);
        let info_hash = descriptor.info_hash;
        let config = &context.config;
        let verified = context
            .store
            .bitmap(info_hash)
            .unwrap_or_else(|| crate::torrent::PieceBitmap::new(descriptor.piece_count()));

        let (swarm, peer_events) = SwarmManager::new(
            info_hash,
            descriptor.piece_count(),
            config.swarm_config(),
            Arc::clone(&context.blocklist),
            Arc::clone(&context.limiter),
        );
        let swarm = Arc::new(swarm);
        let scheduler = PieceScheduler::new(
            Arc::clone(&descriptor),
            verified,
            config.network.pipeline_depth,
            config.network.request_timeout,
        );
        let tail = scheduler.prioritize_tail(config.streaming.tail_pieces);
        if !tail.is_empty() {
            tracing::debug!("SessionHandle::spawn: info_hash={info_hash} tail_pieces={tail:?}");
        }

        let (announce_tx, announce_rx) = watch::channel(AnnounceRequest {
            info_hash,
            peer_id: swarm.peer_id(),
            port: context.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: descriptor
                .total_length
                .saturating_sub(context.store.verified_bytes(info_hash)),
            event: AnnounceEvent::Started,
        });
        let (discovery_tx, discovery_events) = mpsc::unbounded_channel();
        let discovery = DiscoveryHandle::spawn(
            discovery_sources(&descriptor, config),
            announce_rx,
            config.discovery.backoff(),
            discovery_tx,
        );
        for router in descriptor.dht_routers.iter().chain(&config.discovery.dht_routers) {
            tracing::debug!("SessionHandle::spawn: dht router hint={router} (lookups not performed)");
        }

        let shared = Arc::new(SessionShared::default());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let retries = ConnectRetries::new(
            config.network.reconnect_backoff(),
            config.network.max_fail_count,
        );
        let session = TorrentSession {
            info_hash,
            context,
            swarm: Arc::clone(&swarm),
            scheduler,
            peer_events,
            discovery_events,
            commands: command_rx,
            announce: announce_tx,
            _discovery: discovery,
            connects: JoinSet::new(),
            reconnects: JoinSet::new(),
            retries,
            writes: JoinSet::new(),
            candidates: VecDeque::new(),
            queued: HashSet::new(),
            shared: Arc::clone(&shared),
            baseline_verified: 0,
        };
        let task = tokio::spawn(session.run());
        tracing::info!("SessionHandle::spawn: started info_hash={info_hash}");

        Self {
            swarm,
            shared,
            commands,
            task,
        }
    }

    pub fn reschedule(&self) {
        let _ = self.commands.send(SessionCommand::Reschedule);
    }

    pub fn add_peers(&self, peers: Vec<SocketAddr>) {
        let _ = self.commands.send(SessionCommand::AddPeers(peers));
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.swarm.peers()
    }

    /// Aggregate download and upload rate in bytes per second.
    pub fn throughput(&self) -> (u64, u64) {
        self.swarm.throughput()
    }

    /// Payload bytes received and served by this session.
    pub fn transferred(&self) -> (u64, u64) {
        (
            self.shared.downloaded.load(Ordering::Relaxed),
            self.shared.uploaded.load(Ordering::Relaxed),
        )
    }

    pub fn sources_exhausted(&self) -> bool {
        self.shared.sources_exhausted.load(Ordering::Relaxed)
    }

    /// False once the task exited, for example after a disk failure.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
        self.swarm.shutdown();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Tracker hints from the descriptor followed by configured extras, without
/// duplicates. Unsupported URLs are skipped.
fn discovery_sources(
    descriptor: &TorrentDescriptor,
    config: &UndertowConfig,
) -> Vec<Arc<dyn PeerDiscovery>> {
    let mut seen = HashSet::new();
    descriptor
        .trackers
        .iter()
        .chain(&config.discovery.trackers)
        .filter(|url| seen.insert(url.to_string()))
        .filter_map(
            |url| match HttpTracker::new(url.clone(), config.discovery.announce_timeout) {
                Ok(tracker) => Some(Arc::new(tracker) as Arc<dyn PeerDiscovery>),
                Err(error) => {
                    tracing::warn!("discovery_sources: skipping tracker: {error}");
                    None
                }
            },
        )
        .collect()
}

struct TorrentSession {
    info_hash: InfoHash,
    context: SessionContext,
    swarm: Arc<SwarmManager>,
    scheduler: PieceScheduler,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    discovery_events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    announce: watch::Sender<AnnounceRequest>,
    _discovery: DiscoveryHandle,
    connects: JoinSet<(SocketAddr, Result<PeerSnapshot, SwarmError>)>,
    /// Addresses waiting out their reconnect delay
    reconnects: JoinSet<SocketAddr>,
    retries: ConnectRetries,
    writes: JoinSet<BlockWrite>,
    candidates: VecDeque<SocketAddr>,
    queued: HashSet<SocketAddr>,
    shared: Arc<SessionShared>,
    baseline_verified: u64,
}

impl TorrentSession {
    async fn run(mut self) {
        self.baseline_verified = self.context.store.verified_bytes(self.info_hash);
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                Some(event) = self.peer_events.recv() => self.on_peer_event(event).await,
                Some(event) = self.discovery_events.recv() => {
                    self.on_discovery_event(event);
                    Ok(())
                }
                Some(command) = self.commands.recv() => {
                    self.on_command(command);
                    Ok(())
                }
                Some(joined) = self.connects.join_next(), if !self.connects.is_empty() => {
                    if let Ok((address, result)) = joined {
                        self.on_connected(address, result);
                    }
                    Ok(())
                }
                Some(joined) = self.reconnects.join_next(), if !self.reconnects.is_empty() => {
                    if let Ok(address) = joined {
                        self.queue_candidates(vec![address]);
                    }
                    Ok(())
                }
                Some(joined) = self.writes.join_next(), if !self.writes.is_empty() => match joined {
                    Ok((address, piece, outcome)) => self.on_block_written(address, piece, outcome),
                    Err(error) => {
                        tracing::warn!("TorrentSession::run: block write task failed: {error}");
                        Ok(())
                    }
                },
                _ = tick.tick() => {
                    self.on_tick();
                    Ok(())
                }
            };

            if let Err(error) = result {
                tracing::error!(
                    "TorrentSession::run: stopping info_hash={} error={error}",
                    self.info_hash
                );
                self.context.store.mark_errored(self.info_hash, error.to_string());
                break;
            }

            self.connect_candidates();
            self.fill_requests();
        }

        self.connects.abort_all();
        self.reconnects.abort_all();
        self.writes.abort_all();
        self.swarm.shutdown();
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), StorageError> {
        match event {
            PeerEvent::Bitfield { address, bitmap } => {
                tracing::debug!(
                    "on_peer_event: bitfield address={address} pieces={}",
                    bitmap.count_set()
                );
                self.scheduler.add_peer(&bitmap);
            }
            PeerEvent::Have { piece, .. } => self.scheduler.peer_have(piece),
            PeerEvent::Choked { address } => {
                self.scheduler.release_peer(address);
            }
            PeerEvent::Unchoked { address } => {
                tracing::debug!("on_peer_event: unchoked address={address}");
            }
            PeerEvent::Block {
                address,
                piece,
                offset,
                data,
            } => {
                let length = data.len() as u32;
                self.shared
                    .downloaded
                    .fetch_add(u64::from(length), Ordering::Relaxed);
                for other in self.scheduler.block_received(address, piece, offset) {
                    let request = BlockRequest {
                        piece,
                        offset,
                        length,
                    };
                    let _ = self.swarm.cancel_block(other, request);
                }
                self.spawn_write(address, piece, offset, data);
            }
            PeerEvent::Requested { address, request } => self.serve_upload(address, request).await,
            PeerEvent::Closed { address, reason } => self.drop_peer(address, &reason),
        }
        Ok(())
    }

    /// Hands a block to the store on its own task. Blocks of one piece are
    /// serialized by the store's piece lock.
    fn spawn_write(&mut self, address: SocketAddr, piece: PieceIndex, offset: u32, data: bytes::Bytes) {
        let store = Arc::clone(&self.context.store);
        let info_hash = self.info_hash;
        self.writes.spawn(async move {
            let outcome = store.write_block(info_hash, piece, offset, data).await;
            (address, piece, outcome)
        });
    }

    fn on_block_written(
        &mut self,
        address: SocketAddr,
        piece: PieceIndex,
        outcome: Result<BlockOutcome, StorageError>,
    ) -> Result<(), StorageError> {
        match outcome {
            Ok(BlockOutcome::Verified) => self.on_piece_verified(piece),
            Ok(BlockOutcome::Stored | BlockOutcome::Duplicate) => {}
            Err(StorageError::HashMismatch { index }) => {
                tracing::warn!(
                    "on_block_written: hash mismatch piece={index} last_block_from={address}"
                );
                self.scheduler.piece_failed(index);
            }
            Err(error @ StorageError::InvalidBlock { .. }) => {
                tracing::debug!("on_block_written: rejected block from {address}: {error}");
                self.scheduler.piece_failed(piece);
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }

    fn on_piece_verified(&mut self, piece: PieceIndex) {
        self.scheduler.piece_verified(piece);
        self.swarm.announce_have(piece);

        let Some(coverage) = self.context.store.bitmap(self.info_hash) else {
            return;
        };
        self.context.cursor.lock().on_coverage_changed(&coverage);
        if coverage.is_complete() && !self.shared.finished.swap(true, Ordering::Relaxed) {
            tracing::info!("on_piece_verified: torrent complete info_hash={}", self.info_hash);
            self.announce.send_modify(|request| request.left = 0);
        }
    }

    async fn serve_upload(&self, address: SocketAddr, request: BlockRequest) {
        if request.length == 0
            || request.length > MAX_UPLOAD_REQUEST
            || !self.context.store.is_verified(self.info_hash, request.piece)
        {
            return;
        }
        let start = self.context.descriptor.piece_offset(request.piece) + u64::from(request.offset);
        let end = start + u64::from(request.length);
        match self.context.store.read_range(self.info_hash, start, end).await {
            Ok(data) => {
                if self
                    .swarm
                    .send_block(address, request.piece, request.offset, data)
                    .is_ok()
                {
                    self.shared
                        .uploaded
                        .fetch_add(u64::from(request.length), Ordering::Relaxed);
                }
            }
            Err(error) => {
                tracing::debug!("serve_upload: cannot serve address={address} error={error}");
            }
        }
    }

    fn drop_peer(&mut self, address: SocketAddr, reason: &str) {
        let released = match self.swarm.disconnect(address, reason) {
            Some(bitmap) => self.scheduler.remove_peer(address, &bitmap),
            None => self.scheduler.release_peer(address),
        };
        tracing::debug!("drop_peer: address={address} released={released} reason={reason}");
    }

    fn on_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Peers {
                source,
                peers,
                seeders,
                leechers,
            } => {
                tracing::debug!(
                    "on_discovery_event: source={source} peers={} seeders={seeders} leechers={leechers}",
                    peers.len()
                );
                self.queue_candidates(peers);
            }
            DiscoveryEvent::Exhausted => {
                self.shared.sources_exhausted.store(true, Ordering::Relaxed);
                tracing::warn!(
                    "on_discovery_event: all discovery sources failing info_hash={}",
                    self.info_hash
                );
                self.context.events.emit(EngineEvent::SourcesExhausted {
                    info_hash: self.info_hash,
                });
            }
            DiscoveryEvent::Recovered => {
                self.shared.sources_exhausted.store(false, Ordering::Relaxed);
            }
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Reschedule => {}
            SessionCommand::AddPeers(peers) => self.queue_candidates(peers),
        }
    }

    fn queue_candidates(&mut self, peers: Vec<SocketAddr>) {
        for address in peers {
            if self.context.blocklist.is_blocked(address.ip()) {
                tracing::debug!("queue_candidates: blocked address={address}");
                continue;
            }
            if self.retries.gave_up(address) {
                continue;
            }
            if !self.swarm.is_known(address) && self.queued.insert(address) {
                self.candidates.push_back(address);
            }
        }
    }

    fn on_connected(&mut self, address: SocketAddr, result: Result<PeerSnapshot, SwarmError>) {
        let error = match result {
            Ok(snapshot) => {
                self.retries.succeeded(address);
                tracing::info!(
                    "on_connected: address={address} encrypted={}",
                    snapshot.encrypted
                );
                return;
            }
            Err(SwarmError::Blocked { .. }) => return,
            Err(error @ SwarmError::ProxyUnavailable { .. }) => {
                tracing::warn!("on_connected: {error}");
                error
            }
            Err(error) => {
                tracing::debug!("on_connected: address={address} error={error}");
                error
            }
        };

        match self.retries.failed(address) {
            Some(delay) => {
                tracing::debug!("on_connected: retrying address={address} in {delay:?}");
                self.reconnects.spawn(async move {
                    tokio::time::sleep(delay).await;
                    address
                });
            }
            None => tracing::info!("on_connected: giving up on address={address}: {error}"),
        }
    }

    fn connect_candidates(&mut self) {
        while self.connects.len() < MAX_PENDING_CONNECTS && self.swarm.free_slots() > self.connects.len() {
            let Some(address) = self.candidates.pop_front() else {
                break;
            };
            self.queued.remove(&address);
            if self.swarm.is_known(address) {
                continue;
            }
            let Some(bitmap) = self.context.store.bitmap(self.info_hash) else {
                break;
            };
            let swarm = Arc::clone(&self.swarm);
            self.connects.spawn(async move {
                let result = swarm.connect(address, &bitmap).await;
                (address, result)
            });
        }
    }

    fn fill_requests(&self) {
        let window = self.context.cursor.lock().urgent_window();
        let now = Instant::now();
        for (address, bitmap) in self.swarm.unchoked_peers() {
            while let Some(request) =
                self.scheduler
                    .next_request(address, &bitmap, window.as_ref(), now)
            {
                self.context.store.mark_requested(self.info_hash, request.piece);
                if self.swarm.request_block(address, request).is_err() {
                    self.scheduler.release_peer(address);
                    break;
                }
            }
        }
    }

    fn on_tick(&mut self) {
        for expired in self.scheduler.expire_requests(Instant::now()) {
            let _ = self.swarm.cancel_block(expired.peer, expired.request);
            if let Some(bitmap) = self.swarm.record_timeout(expired.peer) {
                self.scheduler.remove_peer(expired.peer, &bitmap);
            }
        }

        let store = &self.context.store;
        let verified = store.verified_bytes(self.info_hash);
        let total = self.context.descriptor.total_length;
        let uploaded = self.shared.uploaded.load(Ordering::Relaxed);
        self.announce.send_modify(|request| {
            request.downloaded = verified.saturating_sub(self.baseline_verified);
            request.uploaded = uploaded;
            request.left = total.saturating_sub(verified);
        });

        let peers = self.swarm.peers();
        let (download, upload) = self.swarm.throughput();
        self.context.events.emit(EngineEvent::Progress {
            info_hash: self.info_hash,
            progress_percent: progress_percent(verified, total),
            download_kbps: to_kbps(download),
            upload_kbps: to_kbps(upload),
            peers: peers.len(),
            seeds: peers.iter().filter(|peer| peer.is_seed()).count(),
        });
    }
}
