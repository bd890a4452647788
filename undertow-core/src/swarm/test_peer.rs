//! In-process seeder for tests.
//!
//! Accepts plaintext or MSE-encrypted connections, advertises every piece,
//! unchokes immediately and answers block requests from in-memory content.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::mse::{self, Negotiated};
use super::protocol::{HANDSHAKE_LEN, HandshakeCodec, PeerHandshake, PeerId, PeerMessage};
use super::transport::{MessageReader, MessageWriter, exchange_handshake};
use crate::torrent::{InfoHash, PieceBitmap, TorrentDescriptor};

const PLAINTEXT_PREFIX: &[u8; 20] = b"\x13BitTorrent protocol";

/// Seeder serving one torrent's content.
pub struct MockSeeder {
    address: SocketAddr,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockSeeder {
    /// Binds on loopback and starts accepting connections.
    pub async fn spawn(descriptor: &TorrentDescriptor, content: Bytes) -> std::io::Result<Self> {
        Self::spawn_with(descriptor, content, None).await
    }

    /// Like `spawn`, but every block of `corrupt_piece` is served zeroed.
    pub async fn spawn_with(
        descriptor: &TorrentDescriptor,
        content: Bytes,
        corrupt_piece: Option<u32>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Self::start(listener, descriptor, content, corrupt_piece)
    }

    /// Like `spawn`, but listens on a fixed address.
    pub async fn spawn_at(
        address: SocketAddr,
        descriptor: &TorrentDescriptor,
        content: Bytes,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Self::start(listener, descriptor, content, None)
    }

    fn start(
        listener: TcpListener,
        descriptor: &TorrentDescriptor,
        content: Bytes,
        corrupt_piece: Option<u32>,
    ) -> std::io::Result<Self> {
        let address = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let seed = Seed {
            info_hash: descriptor.info_hash,
            piece_length: descriptor.piece_length,
            bitmap: PieceBitmap::full(descriptor.piece_count()),
            content,
            corrupt_piece,
            requests: Arc::clone(&requests),
        };
        let seed = Arc::new(seed);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seed = Arc::clone(&seed);
                tokio::spawn(async move {
                    let _ = seed.serve(stream).await;
                });
            }
        });
        Ok(Self {
            address,
            requests,
            task,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Block requests answered so far.
    pub fn requests_served(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for MockSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Seed {
    info_hash: InfoHash,
    piece_length: u32,
    bitmap: PieceBitmap,
    content: Bytes,
    corrupt_piece: Option<u32>,
    requests: Arc<AtomicUsize>,
}

impl Seed {
    async fn serve(&self, mut stream: TcpStream) -> Result<(), super::SwarmError> {
        let peer_id = PeerId::new([0x5e; 20]);
        let mut prefix = [0u8; 20];
        loop {
            let peeked = stream.peek(&mut prefix).await?;
            if peeked == 0 {
                return Ok(());
            }
            if peeked == prefix.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (outbound, inbound) = if &prefix == PLAINTEXT_PREFIX {
            let mut handshake = [0u8; HANDSHAKE_LEN];
            tokio::io::AsyncReadExt::read_exact(&mut stream, &mut handshake).await?;
            let reply = PeerHandshake::new(self.info_hash, peer_id);
            stream
                .write_all(&HandshakeCodec::serialize_handshake(&reply))
                .await?;
            (None, None)
        } else {
            let (negotiated, _, _) = mse::accept(&mut stream, &[self.info_hash], true).await?;
            match negotiated {
                Negotiated::Rc4(mut cipher) => {
                    exchange_handshake(&mut stream, Some(&mut cipher), self.info_hash, peer_id).await?;
                    let (outbound, inbound) = cipher.split();
                    (Some(outbound), Some(inbound))
                }
                Negotiated::Plaintext => {
                    exchange_handshake(&mut stream, None, self.info_hash, peer_id).await?;
                    (None, None)
                }
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half, inbound);
        let mut writer = MessageWriter::new(write_half, outbound);
        writer
            .write_message(&PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(self.bitmap.as_bytes()),
            })
            .await?;
        writer.write_message(&PeerMessage::Unchoke).await?;

        loop {
            if let PeerMessage::Request {
                piece_index,
                offset,
                length,
            } = reader.read_message().await?
            {
                let start = piece_index.as_usize() * self.piece_length as usize + offset as usize;
                let end = (start + length as usize).min(self.content.len());
                if start >= end {
                    continue;
                }
                let data = if self.corrupt_piece == Some(piece_index.as_u32()) {
                    Bytes::from(vec![0u8; end - start])
                } else {
                    self.content.slice(start..end)
                };
                self.requests.fetch_add(1, Ordering::SeqCst);
                writer
                    .write_message(&PeerMessage::Piece {
                        piece_index,
                        offset,
                        data,
                    })
                    .await?;
            }
        }
    }
}
