use bytes::Bytes;

use super::test_fixtures::{create_temp_store, piece_blocks, sample_content};
use super::{BlockOutcome, PieceStatus, PieceStore, StorageError};
use crate::events::{EngineEvent, event_channel};
use crate::torrent::{BLOCK_SIZE, PieceIndex, TorrentDescriptor};

const PIECE: u32 = BLOCK_SIZE * 2;

async fn write_piece(
    store: &PieceStore,
    descriptor: &TorrentDescriptor,
    content: &[u8],
    piece: u32,
) -> Result<BlockOutcome, StorageError> {
    let mut outcome = BlockOutcome::Stored;
    for (offset, block) in piece_blocks(descriptor, content, PieceIndex::new(piece)) {
        outcome = store
            .write_block(descriptor.info_hash, PieceIndex::new(piece), offset, block)
            .await?;
    }
    Ok(outcome)
}

#[tokio::test]
async fn test_write_block_all_blocks_verifies_piece() {
    let (_dir, store, mut events) = create_temp_store().await;
    let content = sample_content(PIECE as usize * 3);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let handle = store.reserve(descriptor.clone()).await.unwrap();
    let piece = PieceIndex::new(1);

    let blocks = piece_blocks(&descriptor, &content, piece);
    let first = store
        .write_block(handle.info_hash, piece, blocks[0].0, blocks[0].1.clone())
        .await
        .unwrap();
    assert_eq!(first, BlockOutcome::Stored);
    assert_eq!(
        store.status(handle.info_hash, piece),
        Some(PieceStatus::Requested)
    );
    assert_eq!(
        store.outstanding_blocks(handle.info_hash, piece).await,
        vec![BLOCK_SIZE]
    );

    let second = store
        .write_block(handle.info_hash, piece, blocks[1].0, blocks[1].1.clone())
        .await
        .unwrap();
    assert_eq!(second, BlockOutcome::Verified);
    assert!(store.is_verified(handle.info_hash, piece));
    assert_eq!(
        events.recv().await,
        Some(EngineEvent::CoverageChanged {
            info_hash: handle.info_hash,
            piece
        })
    );

    let again = store
        .write_block(handle.info_hash, piece, blocks[1].0, blocks[1].1.clone())
        .await
        .unwrap();
    assert_eq!(again, BlockOutcome::Duplicate);
}

#[tokio::test]
async fn test_write_block_corrupt_block_never_verified() {
    let (_dir, store, _events) = create_temp_store().await;
    let content = sample_content(PIECE as usize * 2);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;
    let piece = PieceIndex::new(0);

    let blocks = piece_blocks(&descriptor, &content, piece);
    let mut corrupt = blocks[1].1.to_vec();
    corrupt[100] ^= 0xff;

    store
        .write_block(info_hash, piece, blocks[0].0, blocks[0].1.clone())
        .await
        .unwrap();
    let result = store
        .write_block(info_hash, piece, blocks[1].0, Bytes::from(corrupt))
        .await;

    assert!(matches!(result, Err(StorageError::HashMismatch { index }) if index == piece));
    assert!(result.unwrap_err().is_recoverable());
    assert!(!store.is_verified(info_hash, piece));
    assert_eq!(store.status(info_hash, piece), Some(PieceStatus::Missing));
    assert_eq!(store.hash_failures(info_hash), 1);
    assert_eq!(
        store.outstanding_blocks(info_hash, piece).await,
        vec![0, BLOCK_SIZE]
    );

    let outcome = write_piece(&store, &descriptor, &content, 0).await.unwrap();
    assert_eq!(outcome, BlockOutcome::Verified);
}

#[tokio::test]
async fn test_write_block_wrong_length_rejected() {
    let (_dir, store, _events) = create_temp_store().await;
    let content = sample_content(PIECE as usize);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor).await.unwrap().info_hash;

    let short = store
        .write_block(info_hash, PieceIndex::new(0), 0, Bytes::from_static(b"tiny"))
        .await;
    assert!(matches!(short, Err(StorageError::InvalidBlock { .. })));

    let unaligned = store
        .write_block(info_hash, PieceIndex::new(0), 7, Bytes::from(vec![0u8; 16]))
        .await;
    assert!(matches!(unaligned, Err(StorageError::InvalidBlock { .. })));

    let beyond = store
        .write_block(info_hash, PieceIndex::new(5), 0, Bytes::from(vec![0u8; 16]))
        .await;
    assert!(matches!(beyond, Err(StorageError::InvalidBlock { .. })));
}

#[tokio::test]
async fn test_read_range_last_verified_byte_boundary() {
    let (_dir, store, _events) = create_temp_store().await;
    let content = sample_content(PIECE as usize * 3);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;

    write_piece(&store, &descriptor, &content, 0).await.unwrap();

    let end = PIECE as u64;
    let data = store.read_range(info_hash, 0, end).await.unwrap();
    assert_eq!(&data[..], &content[..PIECE as usize]);

    let past = store.read_range(info_hash, 0, end + 1).await;
    assert!(matches!(
        past,
        Err(StorageError::DataNotReady { start: 0, end: e }) if e == end + 1
    ));

    let empty = store.read_range(info_hash, 10, 10).await.unwrap();
    assert!(empty.is_empty());

    let outside = store.read_range(info_hash, 0, content.len() as u64 + 1).await;
    assert!(matches!(outside, Err(StorageError::InvalidRange { .. })));
}

#[tokio::test]
async fn test_read_range_multi_file_layout_byte_exact() {
    let (_dir, store, _events) = create_temp_store().await;
    let content = sample_content(PIECE as usize * 2);
    let single = TorrentDescriptor::for_content("set", PIECE, &content);
    let descriptor = TorrentDescriptor::new(
        single.info_hash,
        "set",
        PIECE,
        single.piece_hashes.clone(),
        vec![
            ("set/a.srt".into(), 1000),
            ("set/b.mkv".into(), content.len() as u64 - 1000),
        ],
    )
    .unwrap();
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;

    write_piece(&store, &descriptor, &content, 0).await.unwrap();
    write_piece(&store, &descriptor, &content, 1).await.unwrap();

    let data = store.read_range(info_hash, 900, 1100).await.unwrap();
    assert_eq!(&data[..], &content[900..1100]);

    let on_disk = std::fs::read(store.download_dir().join("set/a.srt")).unwrap();
    assert_eq!(on_disk, &content[..1000]);
}

#[tokio::test]
async fn test_reserve_after_restart_resumes_bitmap() {
    let temp_dir = tempfile::tempdir().unwrap();
    let download_dir = temp_dir.path().join("downloads");
    let content = sample_content(PIECE as usize * 4);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);

    {
        let (events, _receiver) = event_channel();
        let store = PieceStore::open(&download_dir, events).await.unwrap();
        store.reserve(descriptor.clone()).await.unwrap();
        write_piece(&store, &descriptor, &content, 0).await.unwrap();
        write_piece(&store, &descriptor, &content, 2).await.unwrap();
    }

    let (events, _receiver) = event_channel();
    let store = PieceStore::open(&download_dir, events).await.unwrap();
    assert_eq!(store.cache_entries().len(), 1);

    let handle = store.reserve(descriptor.clone()).await.unwrap();
    assert_eq!(handle.resumed_pieces, 2);
    assert!(store.is_verified(handle.info_hash, PieceIndex::new(2)));
    assert!(!store.is_verified(handle.info_hash, PieceIndex::new(1)));
    let data = store
        .read_range(handle.info_hash, 2 * PIECE as u64, 3 * PIECE as u64)
        .await
        .unwrap();
    assert_eq!(&data[..], &content[2 * PIECE as usize..3 * PIECE as usize]);
}

#[tokio::test]
async fn test_reserve_missing_data_file_discards_bitmap() {
    let temp_dir = tempfile::tempdir().unwrap();
    let download_dir = temp_dir.path().join("downloads");
    let content = sample_content(PIECE as usize * 2);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);

    {
        let (events, _receiver) = event_channel();
        let store = PieceStore::open(&download_dir, events).await.unwrap();
        store.reserve(descriptor.clone()).await.unwrap();
        write_piece(&store, &descriptor, &content, 0).await.unwrap();
    }
    std::fs::remove_file(download_dir.join("movie.mkv")).unwrap();

    let (events, _receiver) = event_channel();
    let store = PieceStore::open(&download_dir, events).await.unwrap();
    let handle = store.reserve(descriptor).await.unwrap();
    assert_eq!(handle.resumed_pieces, 0);
}

#[tokio::test]
async fn test_write_block_disk_failure_marks_torrent_errored() {
    let (_dir, store, mut events) = create_temp_store().await;
    let content = sample_content(PIECE as usize * 2);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;

    let data_path = store.download_dir().join("movie.mkv");
    std::fs::remove_file(&data_path).unwrap();
    std::fs::create_dir(&data_path).unwrap();

    let result = write_piece(&store, &descriptor, &content, 0).await;
    assert!(matches!(result, Err(StorageError::DiskWriteFailure { .. })));
    assert!(!store.is_verified(info_hash, PieceIndex::new(0)));
    assert!(store.failure(info_hash).is_some());
    assert!(matches!(
        events.recv().await,
        Some(EngineEvent::TorrentErrored { .. })
    ));

    let later = write_piece(&store, &descriptor, &content, 1).await;
    assert!(matches!(later, Err(StorageError::TorrentErrored { .. })));
}

#[tokio::test]
async fn test_wait_for_range_completes_after_verification() {
    let (_dir, store, _events) = create_temp_store().await;
    let store = std::sync::Arc::new(store);
    let content = sample_content(PIECE as usize * 2);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_for_range(info_hash, 10, 20).await })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    write_piece(&store, &descriptor, &content, 0).await.unwrap();
    let data = waiter.await.unwrap().unwrap();
    assert_eq!(&data[..], &content[10..20]);
}

#[tokio::test]
async fn test_delete_removes_data_and_entry() {
    let (_dir, store, _events) = create_temp_store().await;
    let content = sample_content(PIECE as usize);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;
    write_piece(&store, &descriptor, &content, 0).await.unwrap();

    store.delete(info_hash).await.unwrap();

    assert!(!store.download_dir().join("movie.mkv").exists());
    assert!(store.cache_entries().is_empty());
    assert!(store.bitmap(info_hash).is_none());
    assert!(matches!(
        store.read_range(info_hash, 0, 1).await,
        Err(StorageError::TorrentNotReserved { .. })
    ));
}

#[tokio::test]
async fn test_wait_for_range_released_torrent_returns_not_reserved() {
    let (_dir, store, _events) = create_temp_store().await;
    let store = std::sync::Arc::new(store);
    let content = sample_content(PIECE as usize * 2);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor).await.unwrap().info_hash;

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_for_range(info_hash, 0, 100).await })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    store.delete(info_hash).await.unwrap();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StorageError::TorrentNotReserved { .. })));
}

#[tokio::test]
async fn test_wait_for_range_disk_failure_returns_errored() {
    let (_dir, store, _events) = create_temp_store().await;
    let store = std::sync::Arc::new(store);
    let content = sample_content(PIECE as usize * 2);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_for_range(info_hash, PIECE as u64, PIECE as u64 + 10).await })
    };
    tokio::task::yield_now().await;

    let data_path = store.download_dir().join("movie.mkv");
    std::fs::remove_file(&data_path).unwrap();
    std::fs::create_dir(&data_path).unwrap();
    assert!(write_piece(&store, &descriptor, &content, 0).await.is_err());

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StorageError::TorrentErrored { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_block_pieces_from_parallel_tasks_all_verified() {
    let (_dir, store, _events) = create_temp_store().await;
    let store = std::sync::Arc::new(store);
    let content = sample_content(PIECE as usize * 6);
    let descriptor = TorrentDescriptor::for_content("movie.mkv", PIECE, &content);
    let info_hash = store.reserve(descriptor.clone()).await.unwrap().info_hash;

    let mut writers = tokio::task::JoinSet::new();
    for piece in 0..descriptor.piece_count() {
        for (offset, block) in piece_blocks(&descriptor, &content, PieceIndex::new(piece)) {
            let store = store.clone();
            writers.spawn(async move {
                store
                    .write_block(info_hash, PieceIndex::new(piece), offset, block)
                    .await
            });
        }
    }

    let mut verified = 0;
    while let Some(joined) = writers.join_next().await {
        if joined.unwrap().unwrap() == BlockOutcome::Verified {
            verified += 1;
        }
    }
    assert_eq!(verified, descriptor.piece_count());
    assert!(store.bitmap(info_hash).unwrap().is_complete());
    let data = store.read_range(info_hash, 0, content.len() as u64).await.unwrap();
    assert_eq!(&data[..], content.as_slice());
}
