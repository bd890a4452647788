//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use undertow_core::events::{EngineEvent, EventSender};
use undertow_core::janitor::ActivePlayback;
use undertow_core::{
    CacheJanitor, EngineHandle, EventReceiver, InfoHash, PieceStore, PlaybackState,
    TorrentDescriptor, UndertowConfig, spawn_engine,
};

/// Bytes copied to `--output` per read.
const COPY_CHUNK: u64 = 4 * 1024 * 1024;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a torrent, prioritizing its selected file from the start
    Stream {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Index of the file to stream; defaults to the largest
        #[arg(long)]
        file_index: Option<usize>,
        /// Copy the selected file here once it is complete
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Peer to connect to directly, in addition to discovery
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
        /// Pin the data so cache sweeps never evict it
        #[arg(long)]
        keep: bool,
        /// Download limit in KB/s, 0 for unlimited
        #[arg(long)]
        download_limit: Option<u64>,
        /// Upload limit in KB/s, 0 for unlimited
        #[arg(long)]
        upload_limit: Option<u64>,
    },
    /// Print what a .torrent file describes
    Inspect {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Evict cached torrents older than the retention period
    Sweep,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the failure of the command that ran
pub async fn handle_command(command: Commands, config: UndertowConfig) -> anyhow::Result<()> {
    match command {
        Commands::Stream {
            torrent,
            file_index,
            output,
            peers,
            keep,
            download_limit,
            upload_limit,
        } => {
            let mut config = config;
            if let Some(kbps) = download_limit {
                config.bandwidth.download_limit_kbps = kbps;
            }
            if let Some(kbps) = upload_limit {
                config.bandwidth.upload_limit_kbps = kbps;
            }
            let descriptor = load_descriptor(&torrent)
                .await?
                .with_file_index(file_index)
                .with_keep_after_exit(keep);
            descriptor.validate()?;
            stream(config, descriptor, peers, output).await
        }
        Commands::Inspect { torrent } => inspect(&torrent).await,
        Commands::Sweep => sweep(config).await,
    }
}

async fn load_descriptor(path: &Path) -> anyhow::Result<TorrentDescriptor> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(TorrentDescriptor::from_torrent_bytes(&bytes)?)
}

/// Streams the selected file until it is complete or the user interrupts.
async fn stream(
    config: UndertowConfig,
    descriptor: TorrentDescriptor,
    peers: Vec<SocketAddr>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let file_length = descriptor.selected_file().length;
    let (engine, mut events) = spawn_engine(config).await?;
    let info_hash = engine.add_torrent(descriptor).await?;
    engine.start(info_hash).await?;
    if !peers.is_empty() {
        engine.add_peers(info_hash, peers).await?;
    }

    let finished = if engine.status(info_hash).await?.playback == PlaybackState::Finished {
        Ok(true)
    } else {
        tokio::select! {
            finished = wait_until_finished(&mut events) => finished,
            _ = tokio::signal::ctrl_c() => Ok(false),
        }
    };

    let result = match finished {
        Ok(true) => {
            tracing::info!("selected file complete ({file_length} bytes)");
            match output {
                Some(path) => {
                    copy_selected_file(&engine, info_hash, file_length, &path, COPY_CHUNK).await
                }
                None => Ok(()),
            }
        }
        Ok(false) => {
            tracing::info!("interrupted");
            Ok(())
        }
        Err(error) => Err(error),
    };

    engine.shutdown().await?;
    result
}

/// Logs engine events until playback of the selected file is `Finished`.
///
/// Returns `Ok(true)` on completion.
async fn wait_until_finished(events: &mut EventReceiver) -> anyhow::Result<bool> {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Readiness { state, .. } => {
                tracing::info!("playback {state:?}");
                if state == PlaybackState::Finished {
                    return Ok(true);
                }
            }
            EngineEvent::Progress {
                progress_percent,
                download_kbps,
                upload_kbps,
                peers,
                seeds,
                ..
            } => {
                tracing::info!(
                    "{progress_percent:.1}% down {download_kbps:.0} KB/s up {upload_kbps:.0} KB/s peers {peers} seeds {seeds}"
                );
            }
            EngineEvent::SourcesExhausted { .. } => {
                tracing::warn!("every discovery source is failing, retrying");
            }
            EngineEvent::TorrentErrored { reason, .. } => {
                anyhow::bail!("download stopped: {reason}");
            }
            EngineEvent::CoverageChanged { .. } => {}
        }
    }
    anyhow::bail!("engine stopped before the file was complete")
}

/// Copies the verified selected file to `path`, `chunk_size` bytes at a time.
async fn copy_selected_file(
    engine: &EngineHandle,
    info_hash: InfoHash,
    file_length: u64,
    path: &Path,
    chunk_size: u64,
) -> anyhow::Result<()> {
    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut offset = 0;
    while offset < file_length {
        let end = (offset + chunk_size).min(file_length);
        let chunk = match engine.read_range(info_hash, offset, end).await {
            Ok(chunk) => chunk,
            Err(error) => {
                let message = error.user_message();
                return Err(anyhow::Error::from(error).context(message));
            }
        };
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        offset = end;
    }
    file.flush().await?;
    Ok(())
}

async fn inspect(path: &Path) -> anyhow::Result<()> {
    let descriptor = load_descriptor(path).await?;
    println!("Name:         {}", descriptor.name);
    println!("Info hash:    {}", descriptor.info_hash);
    println!("Total size:   {} bytes", descriptor.total_length);
    println!(
        "Pieces:       {} x {} bytes",
        descriptor.piece_count(),
        descriptor.piece_length
    );
    if let Some(created) = descriptor.creation_date {
        println!("Created:      {created}");
    }

    let selected = descriptor.selected_file();
    println!("Files:");
    for (index, file) in descriptor.files.iter().enumerate() {
        let marker = if file.path == selected.path { '*' } else { ' ' };
        println!(
            "  {marker} [{index}] {} ({} bytes)",
            file.path.display(),
            file.length
        );
    }
    if !descriptor.trackers.is_empty() {
        println!("Trackers:");
        for tracker in &descriptor.trackers {
            println!("    {tracker}");
        }
    }
    if !descriptor.dht_routers.is_empty() {
        println!("DHT nodes:");
        for router in &descriptor.dht_routers {
            println!("    {router}");
        }
    }
    Ok(())
}

async fn sweep(config: UndertowConfig) -> anyhow::Result<()> {
    let store = PieceStore::open(&config.storage.download_dir, EventSender::detached()).await?;
    let janitor = CacheJanitor::new(
        Arc::new(store),
        config.cache.retention_days,
        ActivePlayback::default(),
    );
    let report = janitor.sweep_once(chrono::Utc::now()).await;

    for info_hash in &report.evicted {
        println!("evicted {info_hash}");
    }
    for (info_hash, reason) in &report.failed {
        println!("failed  {info_hash}: {reason}");
    }
    println!(
        "{} evicted, {} kept, {} failed",
        report.evicted.len(),
        report.kept,
        report.failed.len()
    );
    Ok(())
}
