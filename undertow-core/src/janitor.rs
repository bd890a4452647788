//! Retention-based eviction of cached torrents.
//!
//! A sweep works on a cloned snapshot of the cache table, so transfers never
//! wait on it. An entry is evicted only when its keep flag is off, its last
//! access is older than the retention period, and no playback is active on
//! it. Failed deletions stay in the table and are retried next sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::storage::PieceStore;
use crate::torrent::InfoHash;

/// Torrents with an active playback window.
#[derive(Debug, Clone, Default)]
pub struct ActivePlayback {
    inner: Arc<RwLock<HashSet<InfoHash>>>,
}

impl ActivePlayback {
    pub fn insert(&self, info_hash: InfoHash) {
        self.inner.write().insert(info_hash);
    }

    pub fn remove(&self, info_hash: InfoHash) {
        self.inner.write().remove(&info_hash);
    }

    pub fn contains(&self, info_hash: InfoHash) -> bool {
        self.inner.read().contains(&info_hash)
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub evicted: Vec<InfoHash>,
    /// Entries retained because they are pinned or still fresh
    pub kept: usize,
    pub skipped_active: usize,
    pub failed: Vec<(InfoHash, String)>,
}

/// Periodic cache sweeper.
pub struct CacheJanitor {
    store: Arc<PieceStore>,
    retention_days: u32,
    active: ActivePlayback,
}

impl CacheJanitor {
    pub fn new(store: Arc<PieceStore>, retention_days: u32, active: ActivePlayback) -> Self {
        Self {
            store,
            retention_days,
            active,
        }
    }

    /// Evaluates every cache entry against `now` once.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for entry in self.store.cache_entries() {
            if entry.keep || !entry.is_expired(now, self.retention_days) {
                report.kept += 1;
                continue;
            }
            if self.active.contains(entry.info_hash) {
                report.skipped_active += 1;
                continue;
            }

            match self.store.delete(entry.info_hash).await {
                Ok(()) => {
                    tracing::info!(
                        "CacheJanitor::sweep_once: evicted info_hash={} name={} bytes={}",
                        entry.info_hash,
                        entry.name,
                        entry.total_bytes
                    );
                    report.evicted.push(entry.info_hash);
                }
                Err(error) => {
                    tracing::warn!(
                        "CacheJanitor::sweep_once: eviction failed info_hash={} error={error}",
                        entry.info_hash
                    );
                    report.failed.push((entry.info_hash, error.to_string()));
                }
            }
        }

        if let Err(error) = self.store.flush_cache().await {
            tracing::warn!("CacheJanitor::sweep_once: cache table flush failed: {error}");
        }
        tracing::debug!(
            "CacheJanitor::sweep_once: evicted={} kept={} skipped_active={} failed={}",
            report.evicted.len(),
            report.kept,
            report.skipped_active,
            report.failed.len()
        );
        report
    }

    /// Sweeps on a fixed interval until the task is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once(Utc::now()).await;
            }
        })
    }
}
