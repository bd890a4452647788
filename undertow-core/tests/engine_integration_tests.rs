//! Integration tests for the streaming engine.
//!
//! These drive the public `EngineHandle` API against in-process seeders over
//! loopback TCP: streaming from a seek position, resuming after a restart
//! and the registry operations around them.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;
use undertow_core::engine::TorrentState;
use undertow_core::storage::test_fixtures::sample_content;
use undertow_core::swarm::test_peer::MockSeeder;
use undertow_core::{
    EngineEvent, EngineHandle, EventReceiver, PlaybackState, TorrentDescriptor, UndertowConfig,
    UndertowError, spawn_engine,
};

const PIECE_LENGTH: u32 = 32_768;

/// Engine over a temporary download directory.
struct EngineTestFixture {
    _dir: tempfile::TempDir,
    config: UndertowConfig,
    handle: EngineHandle,
    events: EventReceiver,
}

impl EngineTestFixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UndertowConfig::for_testing();
        config.storage.download_dir = dir.path().join("downloads");
        let (handle, events) = spawn_engine(config.clone()).await.unwrap();
        Self {
            _dir: dir,
            config,
            handle,
            events,
        }
    }

    /// Shuts the engine down and starts a fresh one on the same directory.
    async fn restart(&mut self) {
        self.handle.shutdown().await.unwrap();
        let (handle, events) = spawn_engine(self.config.clone()).await.unwrap();
        self.handle = handle;
        self.events = events;
    }

    /// Waits until a readiness event says playback can proceed.
    async fn playable(&mut self) {
        timeout(Duration::from_secs(10), async {
            while let Some(event) = self.events.recv().await {
                if let EngineEvent::Readiness { state, .. } = event
                    && matches!(state, PlaybackState::Ready | PlaybackState::Finished)
                {
                    return;
                }
            }
            panic!("event stream closed before playback was ready");
        })
        .await
        .unwrap();
    }
}

async fn seeded_torrent(name: &str, length: usize) -> (TorrentDescriptor, Vec<u8>, MockSeeder) {
    let content = sample_content(length);
    let descriptor = TorrentDescriptor::for_content(name, PIECE_LENGTH, &content);
    let seeder = MockSeeder::spawn(&descriptor, Bytes::from(content.clone()))
        .await
        .unwrap();
    (descriptor, content, seeder)
}

#[tokio::test]
async fn test_engine_seek_then_read_returns_seeded_bytes() {
    let mut fixture = EngineTestFixture::new().await;
    let (descriptor, content, seeder) = seeded_torrent("episode.mkv", 400_000).await;

    let info_hash = fixture.handle.add_torrent(descriptor).await.unwrap();
    let state = fixture.handle.seek(info_hash, 200_000).await.unwrap();
    assert_eq!(state, PlaybackState::Buffering);

    fixture.handle.start(info_hash).await.unwrap();
    fixture
        .handle
        .add_peers(info_hash, vec![seeder.address()])
        .await
        .unwrap();
    fixture.playable().await;

    let data = timeout(
        Duration::from_secs(10),
        fixture.handle.wait_for_range(info_hash, 200_000, 260_000),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(data.as_ref(), &content[200_000..260_000]);

    let whole = timeout(
        Duration::from_secs(10),
        fixture.handle.wait_for_range(info_hash, 0, content.len() as u64),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(whole.as_ref(), content.as_slice());
    assert!(seeder.requests_served() > 0);

    fixture.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_restart_resumes_without_redownload() {
    let mut fixture = EngineTestFixture::new().await;
    let (descriptor, content, seeder) = seeded_torrent("film.mp4", 150_000).await;

    let info_hash = fixture.handle.add_torrent(descriptor.clone()).await.unwrap();
    fixture.handle.start(info_hash).await.unwrap();
    fixture
        .handle
        .add_peers(info_hash, vec![seeder.address()])
        .await
        .unwrap();
    timeout(
        Duration::from_secs(10),
        fixture
            .handle
            .wait_for_range(info_hash, 0, content.len() as u64),
    )
    .await
    .unwrap()
    .unwrap();
    drop(seeder);

    fixture.restart().await;
    fixture.handle.add_torrent(descriptor).await.unwrap();

    let status = fixture.handle.status(info_hash).await.unwrap();
    assert_eq!(status.state, TorrentState::Complete);
    assert_eq!(status.playback, PlaybackState::Finished);
    assert_eq!(status.verified_bytes, content.len() as u64);

    let tail = fixture
        .handle
        .read_range(info_hash, 100_000, 150_000)
        .await
        .unwrap();
    assert_eq!(tail.as_ref(), &content[100_000..]);
    fixture.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_list_reports_every_torrent_by_name() {
    let fixture = EngineTestFixture::new().await;
    let handle = &fixture.handle;

    let second = TorrentDescriptor::for_content("b.mkv", PIECE_LENGTH, &sample_content(50_000));
    let first = TorrentDescriptor::for_content("a.mkv", PIECE_LENGTH, &sample_content(60_000));
    let second = handle.add_torrent(second).await.unwrap();
    let first = handle.add_torrent(first).await.unwrap();

    let listed = handle.list().await.unwrap();
    let hashes: Vec<_> = listed.iter().map(|status| status.info_hash).collect();
    assert_eq!(hashes, vec![first, second]);
    assert!(listed.iter().all(|status| status.state == TorrentState::Idle));
    assert_eq!(listed[0].file_length, 60_000);

    handle.remove(first).await.unwrap();
    assert_eq!(handle.list().await.unwrap().len(), 1);
    assert!(matches!(
        handle.set_keep(first, true).await,
        Err(UndertowError::TorrentNotFound { .. })
    ));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_add_peers_before_start_rejected() {
    let fixture = EngineTestFixture::new().await;
    let (descriptor, _content, seeder) = seeded_torrent("clip.webm", 40_000).await;

    let info_hash = fixture.handle.add_torrent(descriptor).await.unwrap();
    let result = fixture
        .handle
        .add_peers(info_hash, vec![seeder.address()])
        .await;
    assert!(matches!(
        result,
        Err(UndertowError::ConfigurationRejected { .. })
    ));
    fixture.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_rate_limits_apply_without_restart() {
    let fixture = EngineTestFixture::new().await;
    fixture.handle.set_rate_limits(64, 16).await.unwrap();
    fixture.handle.set_rate_limits(0, 0).await.unwrap();
    fixture.handle.shutdown().await.unwrap();
    assert!(matches!(
        fixture.handle.set_rate_limits(1, 1).await,
        Err(UndertowError::EngineShutdown)
    ));
}
