//! Persistent table of cached torrents used for retention decisions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::StorageError;
use super::persist::{read_json, write_json};
use crate::torrent::InfoHash;

/// Cache bookkeeping for one torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub info_hash: InfoHash,
    pub name: String,
    /// Data files relative to the download directory
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// Exempt from retention-based eviction
    pub keep: bool,
}

impl CacheEntry {
    /// True when the entry was last accessed more than `retention_days` ago.
    pub fn is_expired(&self, now: DateTime<Utc>, retention_days: u32) -> bool {
        now - self.last_access > ChronoDuration::days(i64::from(retention_days))
    }
}

/// In-memory cache table mirrored to `cache.json`.
///
/// Access-time updates only mark the table dirty; `flush` writes it out.
#[derive(Debug)]
pub struct CacheIndex {
    path: PathBuf,
    entries: Mutex<HashMap<InfoHash, CacheEntry>>,
    dirty: AtomicBool,
}

impl CacheIndex {
    /// Loads the table from `path`, starting empty if it does not exist.
    ///
    /// # Errors
    /// - `StorageError::Serialization` - Table file is corrupt
    /// - `StorageError::Io` - Table file is unreadable
    pub async fn load(path: PathBuf) -> Result<Self, StorageError> {
        let stored: Vec<CacheEntry> = read_json(&path).await?.unwrap_or_default();
        let entries = stored
            .into_iter()
            .map(|entry| (entry.info_hash, entry))
            .collect();
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(false),
        })
    }

    /// Inserts or replaces an entry, keeping the original creation time.
    ///
    /// A pin survives the replacement; only `set_keep` clears it.
    pub fn upsert(&self, mut entry: CacheEntry) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&entry.info_hash) {
            entry.created_at = existing.created_at;
            entry.keep |= existing.keep;
        }
        entries.insert(entry.info_hash, entry);
        self.dirty.store(true, Ordering::Release);
    }

    /// Records an access. Unknown torrents are ignored.
    pub fn touch(&self, info_hash: InfoHash, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.lock().get_mut(&info_hash) {
            entry.last_access = now;
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Updates the keep flag. Returns false for unknown torrents.
    pub fn set_keep(&self, info_hash: InfoHash, keep: bool) -> bool {
        match self.entries.lock().get_mut(&info_hash) {
            Some(entry) => {
                entry.keep = keep;
                self.dirty.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Returns a copy of one entry.
    pub fn get(&self, info_hash: InfoHash) -> Option<CacheEntry> {
        self.entries.lock().get(&info_hash).cloned()
    }

    /// Drops an entry.
    pub fn remove(&self, info_hash: InfoHash) -> Option<CacheEntry> {
        let removed = self.entries.lock().remove(&info_hash);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Read-only copy of every entry, ordered by info hash.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.lock().values().cloned().collect();
        entries.sort_by_key(|entry| entry.info_hash);
        entries
    }

    /// Writes the table if anything changed since the last flush.
    ///
    /// # Errors
    /// - `StorageError::DiskWriteFailure` - Table could not be written
    pub async fn flush(&self) -> Result<(), StorageError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let snapshot = self.snapshot();
        if let Err(e) = write_json(&self.path, &snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seed: u8, last_access: DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            info_hash: InfoHash::new([seed; 20]),
            name: format!("torrent-{seed}"),
            files: vec![PathBuf::from(format!("torrent-{seed}.mkv"))],
            total_bytes: 1024,
            created_at: last_access,
            last_access,
            keep: false,
        }
    }

    #[test]
    fn test_is_expired_past_retention_true() {
        let now = Utc::now();
        let old = entry(1, now - ChronoDuration::days(8));
        let fresh = entry(2, now - ChronoDuration::days(6));

        assert!(old.is_expired(now, 7));
        assert!(!fresh.is_expired(now, 7));
    }

    #[tokio::test]
    async fn test_flush_then_load_preserves_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("cache.json");
        let now = Utc::now();

        let index = CacheIndex::load(path.clone()).await.unwrap();
        index.upsert(entry(1, now));
        index.upsert(entry(2, now));
        assert!(index.set_keep(InfoHash::new([2; 20]), true));
        index.flush().await.unwrap();

        let reloaded = CacheIndex::load(path).await.unwrap();
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[1].keep);
        assert_eq!(snapshot, index.snapshot());
    }

    #[tokio::test]
    async fn test_upsert_existing_keeps_created_at() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::load(temp_dir.path().join("cache.json"))
            .await
            .unwrap();
        let then = Utc::now() - ChronoDuration::days(3);
        index.upsert(entry(5, then));

        let later = entry(5, Utc::now());
        index.upsert(later);

        let stored = index.get(InfoHash::new([5; 20])).unwrap();
        assert_eq!(stored.created_at, then);
        assert!(stored.last_access > then);
    }

    #[tokio::test]
    async fn test_upsert_unpinned_entry_keeps_existing_pin() {
        let temp_dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::load(temp_dir.path().join("cache.json"))
            .await
            .unwrap();
        let info_hash = InfoHash::new([6; 20]);
        index.upsert(entry(6, Utc::now()));
        assert!(index.set_keep(info_hash, true));

        index.upsert(entry(6, Utc::now()));
        assert!(index.get(info_hash).unwrap().keep);

        assert!(index.set_keep(info_hash, false));
        index.upsert(entry(6, Utc::now()));
        assert!(!index.get(info_hash).unwrap().keep);
    }

    #[test]
    fn test_touch_unknown_torrent_ignored() {
        let index = CacheIndex {
            path: PathBuf::from("unused.json"),
            entries: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        };
        index.touch(InfoHash::new([1; 20]), Utc::now());
        assert!(!index.dirty.load(Ordering::Acquire));
        assert!(index.remove(InfoHash::new([1; 20])).is_none());
    }
}
