//! Shared download and upload bandwidth limiting.
//!
//! Every peer connection draws from the same two buckets. Waiters queue on a
//! FIFO async mutex, so contending connections are served in arrival order.

pub mod token_bucket;

use std::sync::atomic::{AtomicU64, Ordering};

pub use token_bucket::TokenBucket;

/// Transfer direction a budget is drawn for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Debug)]
struct Lane {
    bucket: parking_lot::Mutex<TokenBucket>,
    queue: tokio::sync::Mutex<()>,
    transferred: AtomicU64,
}

impl Lane {
    fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: parking_lot::Mutex::new(TokenBucket::new(bytes_per_sec)),
            queue: tokio::sync::Mutex::new(()),
            transferred: AtomicU64::new(0),
        }
    }
}

/// Rate limiter shared by all connections of the engine.
#[derive(Debug)]
pub struct RateLimiter {
    download: Lane,
    upload: Lane,
}

impl RateLimiter {
    /// Creates a limiter; a rate of 0 means unlimited.
    pub fn new(download_bytes_per_sec: u64, upload_bytes_per_sec: u64) -> Self {
        Self {
            download: Lane::new(download_bytes_per_sec),
            upload: Lane::new(upload_bytes_per_sec),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Builds a limiter from KB/s limits as configured by the user.
    pub fn from_kbps(download_kbps: u64, upload_kbps: u64) -> Self {
        Self::new(download_kbps.saturating_mul(1024), upload_kbps.saturating_mul(1024))
    }

    fn lane(&self, direction: Direction) -> &Lane {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    /// Waits until `bytes` of budget have accrued for `direction`.
    ///
    /// Never drops data. Requests above one burst are drawn in
    /// capacity-sized chunks while holding the queue position.
    pub async fn acquire(&self, direction: Direction, bytes: u64) {
        let lane = self.lane(direction);
        lane.transferred.fetch_add(bytes, Ordering::Relaxed);
        if lane.bucket.lock().is_unlimited() {
            return;
        }

        let _turn = lane.queue.lock().await;
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut bucket = lane.bucket.lock();
                if bucket.is_unlimited() {
                    return;
                }
                let draw = remaining.min(bucket.capacity());
                match bucket.try_consume(draw) {
                    Ok(()) => {
                        remaining -= draw;
                        None
                    }
                    Err(wait) => Some(wait),
                }
            };
            if let Some(wait) = wait {
                tracing::trace!("acquire: direction={direction:?} remaining={remaining} wait={wait:?}");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Reconfigures one direction at runtime; 0 means unlimited.
    pub fn set_rate(&self, direction: Direction, bytes_per_sec: u64) {
        tracing::info!("Bandwidth limit for {direction:?} set to {bytes_per_sec} B/s");
        self.lane(direction).bucket.lock().set_rate(bytes_per_sec);
    }

    /// Configured rate in bytes per second, 0 when unlimited.
    pub fn rate(&self, direction: Direction) -> u64 {
        self.lane(direction).bucket.lock().refill_rate()
    }

    /// Total bytes granted for `direction` since creation.
    pub fn transferred(&self, direction: Direction) -> u64 {
        self.lane(direction).transferred.load(Ordering::Relaxed)
    }
}
