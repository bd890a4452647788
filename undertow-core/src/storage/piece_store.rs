//! Durable piece storage with per-piece write serialization.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tokio::sync::watch;

use super::cache_index::{CacheEntry, CacheIndex};
use super::persist::{StateDir, read_json, remove_file, write_json};
use super::{PieceStatus, StorageError, layout};
use crate::events::{EngineEvent, EventSender};
use crate::torrent::{InfoHash, PieceBitmap, PieceIndex, TorrentDescriptor};

/// Result of a successful `write_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block buffered; piece still incomplete
    Stored,
    /// Block completed the piece and the hash matched
    Verified,
    /// Block was already present or the piece is already verified
    Duplicate,
}

/// Reference to a reserved torrent.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    pub info_hash: InfoHash,
    pub descriptor: Arc<TorrentDescriptor>,
    /// Pieces restored from the persisted bitmap
    pub resumed_pieces: u32,
}

#[derive(Debug, Default)]
struct PieceBuffer {
    blocks: BTreeMap<u32, Bytes>,
    received: u32,
}

impl PieceBuffer {
    fn discard(&mut self) {
        self.blocks.clear();
        self.received = 0;
    }
}

#[derive(Debug)]
struct Coverage {
    statuses: Vec<PieceStatus>,
    verified: PieceBitmap,
}

#[derive(Debug)]
struct TorrentSlot {
    descriptor: Arc<TorrentDescriptor>,
    pieces: Vec<tokio::sync::Mutex<PieceBuffer>>,
    coverage: RwLock<Coverage>,
    coverage_tx: watch::Sender<PieceBitmap>,
    bitmap_write: tokio::sync::Mutex<()>,
    failure: Mutex<Option<String>>,
    hash_failures: AtomicU64,
}

impl TorrentSlot {
    fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn covers(&self, first: u32, last: u32) -> bool {
        self.coverage.read().verified.has_all(first, last)
    }
}

/// On-disk store for every reserved torrent.
///
/// Block writes for one piece are serialized by that piece's lock; different
/// pieces and torrents write in parallel.
#[derive(Debug)]
pub struct PieceStore {
    root: PathBuf,
    state: StateDir,
    cache: CacheIndex,
    torrents: RwLock<HashMap<InfoHash, Arc<TorrentSlot>>>,
    events: EventSender,
}

impl PieceStore {
    /// Opens the store rooted at `download_dir`, loading the cache table.
    ///
    /// # Errors
    /// - `StorageError::Io` - Download directory could not be created
    /// - `StorageError::Serialization` - Cache table is corrupt
    pub async fn open(download_dir: &Path, events: EventSender) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(download_dir).await?;
        let state = StateDir::new(download_dir);
        let cache = CacheIndex::load(state.cache_table()).await?;
        Ok(Self {
            root: download_dir.to_path_buf(),
            state,
            cache,
            torrents: RwLock::new(HashMap::new()),
            events,
        })
    }

    /// Root directory for torrent data.
    pub fn download_dir(&self) -> &Path {
        &self.root
    }

    /// Allocates the torrent's files and restores any persisted coverage.
    ///
    /// Reserving an already reserved torrent returns the existing handle.
    ///
    /// # Errors
    /// - `StorageError::InvalidDescriptor` - Manifest and layout disagree
    /// - `StorageError::DiskWriteFailure` - Files could not be allocated
    pub async fn reserve(&self, descriptor: TorrentDescriptor) -> Result<StoreHandle, StorageError> {
        let info_hash = descriptor.info_hash;
        if let Some(slot) = self.slot(info_hash) {
            self.cache.touch(info_hash, Utc::now());
            return Ok(StoreHandle {
                info_hash,
                descriptor: slot.descriptor.clone(),
                resumed_pieces: 0,
            });
        }

        descriptor
            .validate()
            .map_err(|e| StorageError::InvalidDescriptor {
                reason: e.to_string(),
            })?;

        let all_present = layout::allocate(&self.root, &descriptor.files)
            .await
            .map_err(|e| StorageError::disk_write(&self.root, e))?;

        let piece_count = descriptor.piece_count();
        let bitmap_path = self.state.bitmap(info_hash);
        let verified = if all_present {
            read_json::<PieceBitmap>(&bitmap_path)
                .await
                .ok()
                .flatten()
                .filter(|bitmap| bitmap.len() == piece_count)
        } else {
            remove_file(&bitmap_path).await?;
            None
        }
        .unwrap_or_else(|| PieceBitmap::new(piece_count));

        let resumed_pieces = verified.count_set();
        let statuses = (0..piece_count)
            .map(|index| {
                if verified.has(PieceIndex::new(index)) {
                    PieceStatus::Verified
                } else {
                    PieceStatus::Missing
                }
            })
            .collect();

        let now = Utc::now();
        self.cache.upsert(CacheEntry {
            info_hash,
            name: descriptor.name.clone(),
            files: descriptor.files.iter().map(|f| f.path.clone()).collect(),
            total_bytes: descriptor.total_length,
            created_at: now,
            last_access: now,
            keep: descriptor.keep_after_exit,
        });
        self.cache.flush().await?;

        let (coverage_tx, _) = watch::channel(verified.clone());
        let descriptor = Arc::new(descriptor);
        let slot = Arc::new(TorrentSlot {
            descriptor: descriptor.clone(),
            pieces: (0..piece_count).map(|_| Default::default()).collect(),
            coverage: RwLock::new(Coverage { statuses, verified }),
            coverage_tx,
            bitmap_write: tokio::sync::Mutex::new(()),
            failure: Mutex::new(None),
            hash_failures: AtomicU64::new(0),
        });
        self.torrents.write().entry(info_hash).or_insert(slot);

        tracing::info!(
            "reserved torrent {info_hash} ({} pieces, {resumed_pieces} resumed)",
            piece_count
        );
        Ok(StoreHandle {
            info_hash,
            descriptor,
            resumed_pieces,
        })
    }

    /// Stores one block, verifying the piece once all its blocks are present.
    ///
    /// # Errors
    /// - `StorageError::HashMismatch` - Piece completed but failed verification;
    ///   its blocks were discarded and it is Missing again
    /// - `StorageError::DiskWriteFailure` - Verified data could not be written;
    ///   the torrent is now errored
    /// - `StorageError::InvalidBlock` - Offset or length does not fit the piece
    /// - `StorageError::TorrentErrored` - Torrent already failed
    /// - `StorageError::TorrentNotReserved` - Unknown torrent
    pub async fn write_block(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<BlockOutcome, StorageError> {
        let slot = self.require_slot(info_hash)?;
        if let Some(reason) = slot.failure() {
            return Err(StorageError::TorrentErrored { info_hash, reason });
        }

        let descriptor = &slot.descriptor;
        let invalid_block = || StorageError::InvalidBlock {
            index: piece,
            offset,
            length: data.len(),
        };
        let buffer_lock = slot.pieces.get(piece.as_usize()).ok_or_else(invalid_block)?;
        let expected_len = descriptor
            .block_length(piece, offset)
            .ok_or_else(invalid_block)?;
        if data.len() != expected_len as usize {
            return Err(invalid_block());
        }

        let mut buffer = buffer_lock.lock().await;
        if self.status_of(&slot, piece) == PieceStatus::Verified
            || buffer.blocks.contains_key(&offset)
        {
            return Ok(BlockOutcome::Duplicate);
        }

        buffer.received += expected_len;
        buffer.blocks.insert(offset, data);
        self.set_status_if_missing(&slot, piece);

        if buffer.received < descriptor.piece_size(piece) {
            return Ok(BlockOutcome::Stored);
        }

        let mut piece_bytes = Vec::with_capacity(buffer.received as usize);
        for block in buffer.blocks.values() {
            piece_bytes.extend_from_slice(block);
        }
        buffer.discard();

        let digest: [u8; 20] = Sha1::digest(&piece_bytes).into();
        if descriptor.piece_hash(piece) != Some(&digest) {
            slot.coverage.write().statuses[piece.as_usize()] = PieceStatus::Missing;
            let failures = slot.hash_failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                "piece {piece} of {info_hash} failed hash check ({failures} failures so far)"
            );
            return Err(StorageError::HashMismatch { index: piece });
        }

        let start = descriptor.piece_offset(piece);
        if let Err((path, e)) = layout::write_span(&self.root, &descriptor.files, start, &piece_bytes).await {
            slot.coverage.write().statuses[piece.as_usize()] = PieceStatus::Missing;
            let error = StorageError::disk_write(&path, e);
            self.fail_torrent(&slot, info_hash, error.to_string());
            return Err(error);
        }

        let bitmap = {
            let mut coverage = slot.coverage.write();
            coverage.statuses[piece.as_usize()] = PieceStatus::Verified;
            coverage.verified.set(piece);
            coverage.verified.clone()
        };
        drop(buffer);

        if let Err(error) = self.persist_bitmap(&slot, info_hash).await {
            self.fail_torrent(&slot, info_hash, error.to_string());
            return Err(error);
        }

        slot.coverage_tx.send_replace(bitmap);
        self.events
            .emit(EngineEvent::CoverageChanged { info_hash, piece });
        tracing::debug!("write_block: piece={piece} verified for {info_hash}");
        Ok(BlockOutcome::Verified)
    }

    /// Reads `[start, end)` of the piece space.
    ///
    /// # Errors
    /// - `StorageError::DataNotReady` - Some piece in the range is not verified
    /// - `StorageError::InvalidRange` - Range exceeds the torrent length
    /// - `StorageError::TorrentNotReserved` - Unknown torrent
    /// - `StorageError::Io` - Reading verified data failed
    pub async fn read_range(
        &self,
        info_hash: InfoHash,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StorageError> {
        let slot = self.require_slot(info_hash)?;
        let total = slot.descriptor.total_length;
        if start > end || end > total {
            return Err(StorageError::InvalidRange { start, end, total });
        }
        let Some(pieces) = slot.descriptor.pieces_for_range(start, end) else {
            return Ok(Bytes::new());
        };
        if !slot.covers(*pieces.start(), *pieces.end()) {
            return Err(StorageError::DataNotReady { start, end });
        }

        self.cache.touch(info_hash, Utc::now());
        let data = layout::read_span(&self.root, &slot.descriptor.files, start, end - start).await?;
        Ok(Bytes::from(data))
    }

    /// Waits until `[start, end)` is fully verified, then reads it.
    ///
    /// # Errors
    /// - `StorageError::TorrentErrored` - Torrent failed while waiting
    /// - `StorageError::TorrentNotReserved` - Torrent unknown or released
    /// - Any error from `read_range`
    pub async fn wait_for_range(
        &self,
        info_hash: InfoHash,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StorageError> {
        let mut coverage = self.require_slot(info_hash)?.coverage_tx.subscribe();
        loop {
            match self.read_range(info_hash, start, end).await {
                Err(StorageError::DataNotReady { .. }) => {}
                other => return other,
            }
            if let Some(reason) = self.failure(info_hash) {
                return Err(StorageError::TorrentErrored { info_hash, reason });
            }
            coverage
                .changed()
                .await
                .map_err(|_| StorageError::TorrentNotReserved { info_hash })?;
        }
    }

    /// True when the piece is verified.
    pub fn is_verified(&self, info_hash: InfoHash, piece: PieceIndex) -> bool {
        self.slot(info_hash)
            .is_some_and(|slot| slot.coverage.read().verified.has(piece))
    }

    /// Snapshot of verified coverage.
    pub fn bitmap(&self, info_hash: InfoHash) -> Option<PieceBitmap> {
        self.slot(info_hash)
            .map(|slot| slot.coverage.read().verified.clone())
    }

    /// Watch channel that updates on every verification.
    pub fn subscribe(&self, info_hash: InfoHash) -> Option<watch::Receiver<PieceBitmap>> {
        self.slot(info_hash).map(|slot| slot.coverage_tx.subscribe())
    }

    /// Current status of one piece.
    pub fn status(&self, info_hash: InfoHash, piece: PieceIndex) -> Option<PieceStatus> {
        let slot = self.slot(info_hash)?;
        let coverage = slot.coverage.read();
        coverage.statuses.get(piece.as_usize()).copied()
    }

    /// Moves a Missing piece to Requested.
    pub fn mark_requested(&self, info_hash: InfoHash, piece: PieceIndex) {
        if let Some(slot) = self.slot(info_hash) {
            self.set_status_if_missing(&slot, piece);
        }
    }

    /// Block offsets of the piece not yet received.
    pub async fn outstanding_blocks(&self, info_hash: InfoHash, piece: PieceIndex) -> Vec<u32> {
        let Some(slot) = self.slot(info_hash) else {
            return Vec::new();
        };
        if self.status_of(&slot, piece) == PieceStatus::Verified {
            return Vec::new();
        }
        let Some(buffer_lock) = slot.pieces.get(piece.as_usize()) else {
            return Vec::new();
        };
        let buffer = buffer_lock.lock().await;
        (0..slot.descriptor.block_count(piece))
            .map(|block| block * crate::torrent::BLOCK_SIZE)
            .filter(|offset| !buffer.blocks.contains_key(offset))
            .collect()
    }

    /// Bytes of verified data.
    pub fn verified_bytes(&self, info_hash: InfoHash) -> u64 {
        let Some(slot) = self.slot(info_hash) else {
            return 0;
        };
        let coverage = slot.coverage.read();
        coverage
            .verified
            .iter_set()
            .map(|piece| slot.descriptor.piece_size(piece) as u64)
            .sum()
    }

    /// Number of completed pieces that failed verification.
    pub fn hash_failures(&self, info_hash: InfoHash) -> u64 {
        self.slot(info_hash)
            .map_or(0, |slot| slot.hash_failures.load(Ordering::Relaxed))
    }

    /// Failure reason if the torrent is errored.
    pub fn failure(&self, info_hash: InfoHash) -> Option<String> {
        self.slot(info_hash).and_then(|slot| slot.failure())
    }

    /// Marks the torrent errored; later writes are refused.
    pub fn mark_errored(&self, info_hash: InfoHash, reason: impl Into<String>) {
        if let Some(slot) = self.slot(info_hash) {
            self.fail_torrent(&slot, info_hash, reason.into());
        }
    }

    /// Records an access for retention purposes.
    pub fn touch(&self, info_hash: InfoHash) {
        self.cache.touch(info_hash, Utc::now());
    }

    /// Updates the keep flag of a cached torrent.
    pub fn set_keep(&self, info_hash: InfoHash, keep: bool) -> bool {
        self.cache.set_keep(info_hash, keep)
    }

    /// Read-only snapshot of the cache table.
    pub fn cache_entries(&self) -> Vec<CacheEntry> {
        self.cache.snapshot()
    }

    /// Writes pending cache table changes.
    ///
    /// # Errors
    /// - `StorageError::DiskWriteFailure` - Table could not be written
    pub async fn flush_cache(&self) -> Result<(), StorageError> {
        self.cache.flush().await
    }

    /// Drops in-memory state once in-flight writes have finished.
    ///
    /// Pending `wait_for_range` calls return `TorrentNotReserved`.
    pub async fn release(&self, info_hash: InfoHash) -> Option<Arc<TorrentDescriptor>> {
        let slot = self.torrents.write().remove(&info_hash)?;
        slot.coverage_tx.send_modify(|_| {});
        for piece in &slot.pieces {
            drop(piece.lock().await);
        }
        drop(slot.bitmap_write.lock().await);
        tracing::debug!("released torrent {info_hash}");
        Some(slot.descriptor.clone())
    }

    /// Removes the torrent's data, bitmap and cache entry.
    ///
    /// The cache entry is removed last, so a failure leaves it in place for
    /// a later retry.
    ///
    /// # Errors
    /// - `StorageError::Io` - Data or bitmap file could not be removed
    /// - `StorageError::DiskWriteFailure` - Cache table could not be written
    pub async fn delete(&self, info_hash: InfoHash) -> Result<(), StorageError> {
        let released = self.release(info_hash).await;
        let files = match (self.cache.get(info_hash), released) {
            (Some(entry), _) => entry.files,
            (None, Some(descriptor)) => descriptor.files.iter().map(|f| f.path.clone()).collect(),
            (None, None) => return Ok(()),
        };

        layout::remove_files(&self.root, &files).await?;
        remove_file(&self.state.bitmap(info_hash)).await?;
        self.cache.remove(info_hash);
        self.cache.flush().await?;
        tracing::info!("deleted torrent {info_hash}");
        Ok(())
    }

    fn slot(&self, info_hash: InfoHash) -> Option<Arc<TorrentSlot>> {
        self.torrents.read().get(&info_hash).cloned()
    }

    fn require_slot(&self, info_hash: InfoHash) -> Result<Arc<TorrentSlot>, StorageError> {
        self.slot(info_hash)
            .ok_or(StorageError::TorrentNotReserved { info_hash })
    }

    fn status_of(&self, slot: &TorrentSlot, piece: PieceIndex) -> PieceStatus {
        slot.coverage.read().statuses[piece.as_usize()]
    }

    fn set_status_if_missing(&self, slot: &TorrentSlot, piece: PieceIndex) {
        let mut coverage = slot.coverage.write();
        if let Some(status) = coverage.statuses.get_mut(piece.as_usize())
            && *status == PieceStatus::Missing
        {
            *status = PieceStatus::Requested;
        }
    }

    async fn persist_bitmap(&self, slot: &TorrentSlot, info_hash: InfoHash) -> Result<(), StorageError> {
        let _guard = slot.bitmap_write.lock().await;
        let bitmap = slot.coverage.read().verified.clone();
        write_json(&self.state.bitmap(info_hash), &bitmap).await
    }

    fn fail_torrent(&self, slot: &TorrentSlot, info_hash: InfoHash, reason: String) {
        {
            let mut failure = slot.failure.lock();
            if failure.is_some() {
                return;
            }
            *failure = Some(reason.clone());
        }
        tracing::error!("torrent {info_hash} errored: {reason}");
        slot.coverage_tx.send_modify(|_| {});
        self.events
            .emit(EngineEvent::TorrentErrored { info_hash, reason });
    }
}
