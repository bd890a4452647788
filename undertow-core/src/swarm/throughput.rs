//! Sliding-window throughput sampling.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Width of the throughput window.
pub const THROUGHPUT_WINDOW: Duration = Duration::from_secs(5);

/// Bytes transferred over the trailing window.
#[derive(Debug, Clone)]
pub struct Throughput {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new(THROUGHPUT_WINDOW)
    }
}

impl Throughput {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.total += bytes;
        self.prune(now);
    }

    /// Average bytes per second over the window.
    pub fn bytes_per_sec(&mut self, now: Instant) -> u64 {
        self.prune(now);
        let in_window: u64 = self.samples.iter().map(|&(_, bytes)| bytes).sum();
        (in_window as f64 / self.window.as_secs_f64()) as u64
    }

    /// Bytes recorded since creation.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bytes_per_sec_averages_over_window() {
        let mut throughput = Throughput::default();
        let start = Instant::now();

        throughput.record(50_000, start);
        throughput.record(50_000, start + Duration::from_secs(2));

        assert_eq!(throughput.bytes_per_sec(start + Duration::from_secs(3)), 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bytes_per_sec_old_samples_expire() {
        let mut throughput = Throughput::default();
        let start = Instant::now();

        throughput.record(100_000, start);
        assert_eq!(throughput.bytes_per_sec(start + Duration::from_secs(6)), 0);
        assert_eq!(throughput.total(), 100_000);
    }
}
