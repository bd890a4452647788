//! Peer discovery: announce types, the source trait and the retry runner.
//!
//! Every source announces independently with its own backoff. A failing
//! source never delays the others. When every source is failing at once the
//! runner reports `Exhausted`, and `Recovered` once any source answers again.

pub mod backoff;
pub mod tracker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use backoff::Backoff;
pub use tracker::HttpTracker;

use super::{PeerId, SwarmError};
use crate::torrent::InfoHash;

/// Floor for tracker-provided re-announce intervals.
const MIN_REANNOUNCE: Duration = Duration::from_secs(30);
/// Ceiling for tracker-provided re-announce intervals.
const MAX_REANNOUNCE: Duration = Duration::from_secs(30 * 60);

/// Announce lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    /// Periodic re-announce; no `event` parameter.
    Regular,
}

/// Announce parameters.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// Peers and swarm counts returned by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub seeders: u32,
    pub leechers: u32,
    pub peers: Vec<SocketAddr>,
}

/// A source of peer addresses.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Identifier used in logs and errors.
    fn name(&self) -> &str;

    /// # Errors
    ///
    /// - `SwarmError::DiscoverySourceFailure` - Source unreachable or returned an error
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, SwarmError>;
}

/// Runner output consumed by the torrent session.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Peers {
        source: String,
        peers: Vec<SocketAddr>,
        seeders: u32,
        leechers: u32,
    },
    /// Every source is currently failing.
    Exhausted,
    /// A source answered after exhaustion.
    Recovered,
}

#[derive(Debug, Default)]
struct Health {
    failing: Vec<bool>,
    exhausted: bool,
}

/// Running discovery tasks; aborted on drop.
pub struct DiscoveryHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryHandle {
    /// Starts one announce loop per source.
    ///
    /// Each announce reads the latest `request` snapshot; the first uses
    /// `Started`, the first after `left` reaches zero `Completed`, others
    /// `Regular`. An empty source list reports `Exhausted` immediately.
    pub fn spawn(
        sources: Vec<Arc<dyn PeerDiscovery>>,
        request: watch::Receiver<AnnounceRequest>,
        backoff: Backoff,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        if sources.is_empty() {
            tracing::warn!("DiscoveryHandle::spawn: no discovery sources configured");
            let _ = events.send(DiscoveryEvent::Exhausted);
            return Self { tasks: Vec::new() };
        }

        let health = Arc::new(Mutex::new(Health {
            failing: vec![false; sources.len()],
            exhausted: false,
        }));
        let tasks = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| {
                tokio::spawn(run_source(
                    index,
                    source,
                    request.clone(),
                    backoff,
                    Arc::clone(&health),
                    events.clone(),
                ))
            })
            .collect();
        Self { tasks }
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_source(
    index: usize,
    source: Arc<dyn PeerDiscovery>,
    request: watch::Receiver<AnnounceRequest>,
    backoff: Backoff,
    health: Arc<Mutex<Health>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut started = false;
    let mut reported_left: Option<u64> = None;
    let mut failures = 0u32;
    loop {
        let mut snapshot = request.borrow().clone();
        snapshot.event = if !started {
            AnnounceEvent::Started
        } else if snapshot.left == 0 && reported_left.is_some_and(|left| left > 0) {
            AnnounceEvent::Completed
        } else {
            AnnounceEvent::Regular
        };

        let delay = match source.announce(&snapshot).await {
            Ok(response) => {
                failures = 0;
                started = true;
                reported_left = Some(snapshot.left);
                let recovered = {
                    let mut health = health.lock();
                    health.failing[index] = false;
                    std::mem::replace(&mut health.exhausted, false)
                };
                if recovered {
                    tracing::info!("run_source: discovery recovered source={}", source.name());
                    let _ = events.send(DiscoveryEvent::Recovered);
                }
                let sent = events.send(DiscoveryEvent::Peers {
                    source: source.name().to_string(),
                    peers: response.peers,
                    seeders: response.seeders,
                    leechers: response.leechers,
                });
                if sent.is_err() {
                    return;
                }
                response.interval.clamp(MIN_REANNOUNCE, MAX_REANNOUNCE)
            }
            Err(error) => {
                failures = failures.saturating_add(1);
                let delay = backoff.delay(failures);
                tracing::warn!(
                    "run_source: announce failed source={} failures={failures} retry_in={delay:?} error={error}",
                    source.name()
                );
                let exhausted = {
                    let mut health = health.lock();
                    health.failing[index] = true;
                    let all_failing = health.failing.iter().all(|&failing| failing);
                    all_failing && !std::mem::replace(&mut health.exhausted, true)
                };
                if exhausted && events.send(DiscoveryEvent::Exhausted).is_err() {
                    return;
                }
                delay
            }
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio::time::Instant;

    use super::*;

    /// Source that replays scripted outcomes, then keeps failing.
    struct ScriptedSource {
        name: String,
        script: Mutex<VecDeque<Result<Vec<SocketAddr>, ()>>>,
        calls: Mutex<Vec<(Instant, AnnounceEvent)>>,
    }

    impl ScriptedSource {
        fn new(name: &str, script: Vec<Result<Vec<SocketAddr>, ()>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PeerDiscovery for ScriptedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, SwarmError> {
            self.calls.lock().push((Instant::now(), request.event));
            match self.script.lock().pop_front() {
                Some(Ok(peers)) => Ok(AnnounceResponse {
                    interval: Duration::from_secs(60),
                    seeders: 1,
                    leechers: 0,
                    peers,
                }),
                _ => Err(SwarmError::DiscoverySourceFailure {
                    url: self.name.clone(),
                    reason: "scripted failure".to_string(),
                }),
            }
        }
    }

    fn request() -> watch::Receiver<AnnounceRequest> {
        let (_tx, rx) = watch::channel(AnnounceRequest {
            info_hash: InfoHash::new([1u8; 20]),
            peer_id: PeerId::new([2u8; 20]),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: AnnounceEvent::Regular,
        });
        rx
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_source_retries_with_backoff() {
        let source = ScriptedSource::new("a", vec![Err(()), Err(()), Err(()), Ok(vec![peer(1)])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let _handle = DiscoveryHandle::spawn(
            vec![source.clone() as Arc<dyn PeerDiscovery>],
            request(),
            Backoff::default(),
            tx,
        );

        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Exhausted));
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Recovered));
        let Some(DiscoveryEvent::Peers { peers, .. }) = rx.recv().await else {
            panic!("expected peers");
        };
        assert_eq!(peers, vec![peer(1)]);

        let offsets: Vec<u64> = source
            .calls
            .lock()
            .iter()
            .map(|(at, _)| at.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3, 7]);
        assert!(source.calls.lock().iter().all(|(_, e)| *e == AnnounceEvent::Started));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_source_does_not_block_others() {
        let broken = ScriptedSource::new("broken", vec![]);
        let healthy = ScriptedSource::new("healthy", vec![Ok(vec![peer(2)]), Ok(vec![peer(3)])]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = DiscoveryHandle::spawn(
            vec![
                broken.clone() as Arc<dyn PeerDiscovery>,
                healthy.clone() as Arc<dyn PeerDiscovery>,
            ],
            request(),
            Backoff::default(),
            tx,
        );

        let Some(DiscoveryEvent::Peers { source, peers, .. }) = rx.recv().await else {
            panic!("expected peers");
        };
        assert_eq!(source, "healthy");
        assert_eq!(peers, vec![peer(2)]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(healthy.calls.lock().len() >= 2);
        assert_eq!(healthy.calls.lock()[1].1, AnnounceEvent::Regular);
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event, DiscoveryEvent::Exhausted);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_announced_once() {
        let source = ScriptedSource::new(
            "a",
            vec![Ok(vec![]), Ok(vec![]), Ok(vec![]), Ok(vec![])],
        );
        let (request_tx, request_rx) = watch::channel(request().borrow().clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let _handle = DiscoveryHandle::spawn(
            vec![source.clone() as Arc<dyn PeerDiscovery>],
            request_rx,
            Backoff::default(),
            tx,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        request_tx.send_modify(|request| request.left = 0);
        tokio::time::sleep(Duration::from_secs(121)).await;

        let events: Vec<AnnounceEvent> = source.calls.lock().iter().map(|(_, e)| *e).collect();
        assert_eq!(
            events,
            vec![
                AnnounceEvent::Started,
                AnnounceEvent::Completed,
                AnnounceEvent::Regular
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sources_reports_exhausted() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = DiscoveryHandle::spawn(Vec::new(), request(), Backoff::default(), tx);
        assert_eq!(rx.recv().await, Some(DiscoveryEvent::Exhausted));
    }
}
