//! Per-peer reader and writer tasks.
//!
//! Each connection runs two tasks. The reader decodes wire messages, updates
//! the shared `PeerState` and forwards `PeerEvent`s to the torrent session.
//! The writer drains `PeerCommand`s and draws rate-limiter budget before any
//! Request (download) or Piece (upload) leaves the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::protocol::PeerMessage;
use super::throughput::Throughput;
use super::transport::{Connection, MessageReader, MessageWriter};
use super::SwarmError;
use crate::bandwidth::{Direction, RateLimiter};
use crate::scheduler::BlockRequest;
use crate::torrent::{PieceBitmap, PieceIndex};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerLifecycle {
    Connecting,
    Active,
    Draining,
    Closed,
}

/// Notification from a peer task to its session.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Bitfield {
        address: SocketAddr,
        bitmap: PieceBitmap,
    },
    Have {
        address: SocketAddr,
        piece: PieceIndex,
    },
    Choked {
        address: SocketAddr,
    },
    Unchoked {
        address: SocketAddr,
    },
    Block {
        address: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// The peer asked us for a block.
    Requested {
        address: SocketAddr,
        request: BlockRequest,
    },
    Closed {
        address: SocketAddr,
        reason: String,
    },
}

/// Instructions for the writer task.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    Request(BlockRequest),
    Cancel(BlockRequest),
    Have(PieceIndex),
    Upload {
        piece: PieceIndex,
        offset: u32,
        data: Bytes,
    },
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub address: SocketAddr,
    pub bitmap: PieceBitmap,
    pub download_bps: u64,
    pub upload_bps: u64,
    pub outstanding: usize,
    pub encrypted: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub lifecycle: PeerLifecycle,
    pub failures: u32,
}

impl PeerSnapshot {
    pub fn is_seed(&self) -> bool {
        self.bitmap.is_complete()
    }
}

#[derive(Debug)]
pub(crate) struct PeerState {
    pub bitmap: PieceBitmap,
    pub lifecycle: PeerLifecycle,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub download: Throughput,
    pub upload: Throughput,
    pub outstanding: usize,
    pub failures: u32,
    /// A Bitfield or Have has been received
    pub availability_seen: bool,
}

impl PeerState {
    fn new(piece_count: u32) -> Self {
        Self {
            bitmap: PieceBitmap::new(piece_count),
            lifecycle: PeerLifecycle::Active,
            peer_choking: true,
            peer_interested: false,
            download: Throughput::default(),
            upload: Throughput::default(),
            outstanding: 0,
            failures: 0,
            availability_seen: false,
        }
    }

    /// Marks `piece` as held by the peer. False when it was already known,
    /// so each piece is counted toward rarity once per peer.
    fn record_have(&mut self, piece: PieceIndex) -> bool {
        self.availability_seen = true;
        if self.bitmap.has(piece) {
            return false;
        }
        self.bitmap.set(piece);
        true
    }

    /// Accepts the peer's bitfield, which must precede any Have.
    fn record_bitfield(&mut self, bitmap: PieceBitmap) -> Result<(), String> {
        if self.availability_seen {
            return Err("Bitfield after availability was already announced".to_string());
        }
        if bitmap.len() != self.bitmap.len() {
            return Err("Bitfield has wrong length".to_string());
        }
        self.availability_seen = true;
        self.bitmap = bitmap;
        Ok(())
    }
}

/// Handle to a running connection.
pub struct PeerHandle {
    address: SocketAddr,
    encrypted: bool,
    commands: mpsc::UnboundedSender<PeerCommand>,
    state: Arc<Mutex<PeerState>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerHandle {
    /// Spawns reader and writer tasks for an established connection.
    ///
    /// Our bitfield (when non-empty) and an Interested/Unchoke pair are sent first.
    pub(crate) fn spawn(
        connection: Connection,
        local_bitmap: &PieceBitmap,
        limiter: Arc<RateLimiter>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        let Connection {
            address,
            encrypted,
            reader,
            writer,
            ..
        } = connection;

        let state = Arc::new(Mutex::new(PeerState::new(local_bitmap.len())));

        let mut greeting = Vec::with_capacity(3);
        if local_bitmap.count_set() > 0 {
            greeting.push(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(local_bitmap.as_bytes()),
            });
        }
        greeting.push(PeerMessage::Interested);
        greeting.push(PeerMessage::Unchoke);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(
            address,
            writer,
            greeting,
            command_rx,
            limiter,
            Arc::clone(&state),
            events.clone(),
        ));
        let reader = tokio::spawn(run_reader(address, reader, Arc::clone(&state), events));

        tracing::info!("PeerHandle::spawn: connected address={address} encrypted={encrypted}");
        Self {
            address,
            encrypted,
            commands,
            state,
            reader,
            writer,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state.lock().lifecycle, PeerLifecycle::Active)
    }

    /// Queues a command; returns false when the writer has gone away.
    pub(crate) fn send(&self, command: PeerCommand) -> bool {
        if let PeerCommand::Request(_) = &command {
            self.state.lock().outstanding += 1;
        }
        self.commands.send(command).is_ok()
    }

    pub fn bitmap(&self) -> PieceBitmap {
        self.state.lock().bitmap.clone()
    }

    pub fn is_choking(&self) -> bool {
        self.state.lock().peer_choking
    }

    /// Counts a timed-out request; returns the updated failure count.
    pub(crate) fn record_failure(&self) -> u32 {
        let mut state = self.state.lock();
        state.failures += 1;
        state.outstanding = state.outstanding.saturating_sub(1);
        state.failures
    }

    pub(crate) fn request_cancelled(&self) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        PeerSnapshot {
            address: self.address,
            bitmap: state.bitmap.clone(),
            download_bps: state.download.bytes_per_sec(now),
            upload_bps: state.upload.bytes_per_sec(now),
            outstanding: state.outstanding,
            encrypted: self.encrypted,
            peer_choking: state.peer_choking,
            peer_interested: state.peer_interested,
            lifecycle: state.lifecycle,
            failures: state.failures,
        }
    }

    /// Moves through Draining to Closed and stops both tasks.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.lifecycle == PeerLifecycle::Active {
                state.lifecycle = PeerLifecycle::Draining;
            }
        }
        self.reader.abort();
        self.writer.abort();
        self.state.lock().lifecycle = PeerLifecycle::Closed;
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn mark_closed(state: &Mutex<PeerState>) -> bool {
    let mut state = state.lock();
    let was_open = state.lifecycle == PeerLifecycle::Active;
    if was_open {
        state.lifecycle = PeerLifecycle::Closed;
    }
    was_open
}

async fn run_reader(
    address: SocketAddr,
    mut reader: MessageReader<OwnedReadHalf>,
    state: Arc<Mutex<PeerState>>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let reason = loop {
        let message = match reader.read_message().await {
            Ok(message) => message,
            Err(error) => break error.to_string(),
        };

        let event = match message {
            PeerMessage::KeepAlive | PeerMessage::Port { .. } | PeerMessage::Cancel { .. } => None,
            PeerMessage::Choke => {
                let mut state = state.lock();
                state.peer_choking = true;
                state.outstanding = 0;
                Some(PeerEvent::Choked { address })
            }
            PeerMessage::Unchoke => {
                state.lock().peer_choking = false;
                Some(PeerEvent::Unchoked { address })
            }
            PeerMessage::Interested => {
                state.lock().peer_interested = true;
                None
            }
            PeerMessage::NotInterested => {
                state.lock().peer_interested = false;
                None
            }
            PeerMessage::Have { piece_index } => {
                let mut state = state.lock();
                if piece_index.as_u32() >= state.bitmap.len() {
                    break format!("Have for out-of-range piece {piece_index}");
                }
                state.record_have(piece_index).then_some(PeerEvent::Have {
                    address,
                    piece: piece_index,
                })
            }
            PeerMessage::Bitfield { bitfield } => {
                let mut state = state.lock();
                let Some(bitmap) = PieceBitmap::from_bytes(&bitfield, state.bitmap.len()) else {
                    break "Bitfield has wrong length".to_string();
                };
                if let Err(reason) = state.record_bitfield(bitmap.clone()) {
                    break reason;
                }
                Some(PeerEvent::Bitfield { address, bitmap })
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => Some(PeerEvent::Requested {
                address,
                request: BlockRequest {
                    piece: piece_index,
                    offset,
                    length,
                },
            }),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let mut state = state.lock();
                state.download.record(data.len() as u64, Instant::now());
                state.outstanding = state.outstanding.saturating_sub(1);
                Some(PeerEvent::Block {
                    address,
                    piece: piece_index,
                    offset,
                    data,
                })
            }
        };

        if let Some(event) = event
            && events.send(event).is_err()
        {
            break "session closed".to_string();
        }
    };

    tracing::debug!("run_reader: closed address={address} reason={reason}");
    if mark_closed(&state) {
        let _ = events.send(PeerEvent::Closed { address, reason });
    }
}

async fn run_writer(
    address: SocketAddr,
    mut writer: MessageWriter<OwnedWriteHalf>,
    greeting: Vec<PeerMessage>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    limiter: Arc<RateLimiter>,
    state: Arc<Mutex<PeerState>>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    if let Err(error) = write_loop(&mut writer, greeting, commands, &limiter, &state).await {
        let reason = format!("write failed: {error}");
        tracing::debug!("run_writer: closed address={address} reason={reason}");
        if mark_closed(&state) {
            let _ = events.send(PeerEvent::Closed { address, reason });
        }
    }
}

async fn write_loop(
    writer: &mut MessageWriter<OwnedWriteHalf>,
    greeting: Vec<PeerMessage>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    limiter: &RateLimiter,
    state: &Mutex<PeerState>,
) -> Result<(), SwarmError> {
    for message in &greeting {
        writer.write_message(message).await?;
    }

    let mut keep_alive =
        tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
    loop {
        let message = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command_message(command, limiter, state).await,
                None => return Ok(()),
            },
            _ = keep_alive.tick() => PeerMessage::KeepAlive,
        };
        writer.write_message(&message).await?;
    }
}

async fn command_message(
    command: PeerCommand,
    limiter: &RateLimiter,
    state: &Mutex<PeerState>,
) -> PeerMessage {
    match command {
        PeerCommand::Request(request) => {
            limiter
                .acquire(Direction::Download, u64::from(request.length))
                .await;
            PeerMessage::Request {
                piece_index: request.piece,
                offset: request.offset,
                length: request.length,
            }
        }
        PeerCommand::Cancel(request) => PeerMessage::Cancel {
            piece_index: request.piece,
            offset: request.offset,
            length: request.length,
        },
        PeerCommand::Have(piece) => PeerMessage::Have { piece_index: piece },
        PeerCommand::Upload {
            piece,
            offset,
            data,
        } => {
            limiter.acquire(Direction::Upload, data.len() as u64).await;
            state.lock().upload.record(data.len() as u64, Instant::now());
            PeerMessage::Piece {
                piece_index: piece,
                offset,
                data,
            }
        }
    }
}
