//! Connection table for one torrent.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::peer::{PeerCommand, PeerEvent, PeerHandle, PeerLifecycle, PeerSnapshot};
use super::protocol::PeerId;
use super::transport::{self, ConnectOptions};
use super::{Blocklist, EncryptionPolicy, ProxyConfig, SwarmError};
use crate::bandwidth::RateLimiter;
use crate::scheduler::BlockRequest;
use crate::torrent::{InfoHash, PieceBitmap, PieceIndex};

/// Per-torrent connection policy.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub connect_timeout: Duration,
    pub encryption: EncryptionPolicy,
    pub proxy: Option<ProxyConfig>,
    pub max_peers: usize,
    /// Request timeouts tolerated before a peer is dropped
    pub max_fail_count: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            encryption: EncryptionPolicy::Enabled,
            proxy: None,
            max_peers: 50,
            max_fail_count: 5,
        }
    }
}

/// Owns the live peer connections of one torrent.
pub struct SwarmManager {
    info_hash: InfoHash,
    peer_id: PeerId,
    piece_count: u32,
    config: SwarmConfig,
    blocklist: Arc<Blocklist>,
    limiter: Arc<RateLimiter>,
    peers: RwLock<HashMap<SocketAddr, PeerHandle>>,
    connecting: Mutex<HashSet<SocketAddr>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl SwarmManager {
    /// Creates the manager and the receiver for its peer events.
    pub fn new(
        info_hash: InfoHash,
        piece_count: u32,
        config: SwarmConfig,
        blocklist: Arc<Blocklist>,
        limiter: Arc<RateLimiter>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            info_hash,
            peer_id: PeerId::generate(),
            piece_count,
            config,
            blocklist,
            limiter,
            peers: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            events,
        };
        (manager, receiver)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Connects to `address` and starts its reader and writer tasks.
    ///
    /// `local_bitmap` is advertised to the peer right after the handshake.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Blocked` - Address is on the blocklist
    /// - `SwarmError::PeerConnectionFailure` - Duplicate, over the peer limit, or setup failed
    /// - `SwarmError::ProxyUnavailable` - Configured proxy cannot be reached
    pub async fn connect(
        &self,
        address: SocketAddr,
        local_bitmap: &PieceBitmap,
    ) -> Result<PeerSnapshot, SwarmError> {
        {
            let peers = self.peers.read();
            let mut connecting = self.connecting.lock();
            if peers.contains_key(&address) || connecting.contains(&address) {
                return Err(SwarmError::connection(address, "already connected"));
            }
            if peers.len() + connecting.len() >= self.config.max_peers {
                return Err(SwarmError::connection(address, "peer limit reached"));
            }
            connecting.insert(address);
        }

        let options = ConnectOptions {
            connect_timeout: self.config.connect_timeout,
            encryption: self.config.encryption,
            proxy: self.config.proxy.clone(),
        };
        let result =
            transport::establish(address, self.info_hash, self.peer_id, &self.blocklist, &options)
                .await;
        self.connecting.lock().remove(&address);

        let connection = match result {
            Ok(connection) => connection,
            Err(error) => {
                tracing::debug!("SwarmManager::connect: failed address={address} error={error}");
                return Err(error);
            }
        };
        let handle = PeerHandle::spawn(
            connection,
            local_bitmap,
            Arc::clone(&self.limiter),
            self.events.clone(),
        );
        let snapshot = handle.snapshot();
        self.peers.write().insert(address, handle);
        Ok(snapshot)
    }

    /// Snapshots of connecting and connected peers.
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let mut snapshots: Vec<PeerSnapshot> =
            self.peers.read().values().map(PeerHandle::snapshot).collect();
        snapshots.extend(self.connecting.lock().iter().map(|&address| PeerSnapshot {
            address,
            bitmap: PieceBitmap::new(self.piece_count),
            download_bps: 0,
            upload_bps: 0,
            outstanding: 0,
            encrypted: false,
            peer_choking: true,
            peer_interested: false,
            lifecycle: PeerLifecycle::Connecting,
            failures: 0,
        }));
        snapshots
    }

    pub fn is_known(&self, address: SocketAddr) -> bool {
        self.peers.read().contains_key(&address) || self.connecting.lock().contains(&address)
    }

    /// Connected peers that are not choking us, with their bitmaps.
    pub fn unchoked_peers(&self) -> Vec<(SocketAddr, PieceBitmap)> {
        self.peers
            .read()
            .values()
            .filter(|handle| handle.is_open() && !handle.is_choking())
            .map(|handle| (handle.address(), handle.bitmap()))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Room for more connections under `max_peers`.
    pub fn free_slots(&self) -> usize {
        let used = self.peers.read().len() + self.connecting.lock().len();
        self.config.max_peers.saturating_sub(used)
    }

    /// Queues a block request on the peer's writer without waiting.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerNotConnected` - Unknown or closed peer
    pub fn request_block(&self, address: SocketAddr, request: BlockRequest) -> Result<(), SwarmError> {
        self.send(address, PeerCommand::Request(request))
    }

    /// Cancels a request already sent to the peer.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerNotConnected` - Unknown or closed peer
    pub fn cancel_block(&self, address: SocketAddr, request: BlockRequest) -> Result<(), SwarmError> {
        if let Some(handle) = self.peers.read().get(&address) {
            handle.request_cancelled();
        }
        self.send(address, PeerCommand::Cancel(request))
    }

    /// Sends a block the peer asked for; the writer draws upload budget.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerNotConnected` - Unknown or closed peer
    pub fn send_block(
        &self,
        address: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<(), SwarmError> {
        self.send(
            address,
            PeerCommand::Upload {
                piece,
                offset,
                data,
            },
        )
    }

    /// Tells every connected peer about a newly verified piece.
    pub fn announce_have(&self, piece: PieceIndex) {
        for handle in self.peers.read().values() {
            handle.send(PeerCommand::Have(piece));
        }
    }

    /// Closes a connection. Returns the peer's last bitmap so its
    /// availability can be withdrawn.
    pub fn disconnect(&self, address: SocketAddr, reason: &str) -> Option<PieceBitmap> {
        let handle = self.peers.write().remove(&address)?;
        let bitmap = handle.bitmap();
        handle.close();
        tracing::info!("SwarmManager::disconnect: address={address} reason={reason}");
        Some(bitmap)
    }

    /// Counts a request timeout; disconnects once `max_fail_count` is
    /// reached. Returns the bitmap when the peer was dropped.
    pub fn record_timeout(&self, address: SocketAddr) -> Option<PieceBitmap> {
        let failures = self.peers.read().get(&address)?.record_failure();
        if failures >= self.config.max_fail_count {
            return self.disconnect(address, "too many request timeouts");
        }
        None
    }

    /// Total download and upload rate across peers, bytes per second.
    pub fn throughput(&self) -> (u64, u64) {
        self.peers
            .read()
            .values()
            .map(PeerHandle::snapshot)
            .fold((0, 0), |(down, up), peer| {
                (down + peer.download_bps, up + peer.upload_bps)
            })
    }

    /// Closes every connection.
    pub fn shutdown(&self) {
        let peers: Vec<PeerHandle> = self.peers.write().drain().map(|(_, handle)| handle).collect();
        for handle in &peers {
            handle.close();
        }
        tracing::info!(
            "SwarmManager::shutdown: info_hash={} closed={}",
            self.info_hash,
            peers.len()
        );
    }

    fn send(&self, address: SocketAddr, command: PeerCommand) -> Result<(), SwarmError> {
        let peers = self.peers.read();
        match peers.get(&address) {
            Some(handle) if handle.is_open() && handle.send(command) => Ok(()),
            _ => Err(SwarmError::PeerNotConnected { address }),
        }
    }
}
