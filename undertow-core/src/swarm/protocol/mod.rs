//! BitTorrent wire protocol types (BEP 3).

pub mod handshake;
pub mod messages;

use bytes::Bytes;

pub use handshake::HandshakeCodec;
pub use messages::MessageCodec;

use crate::torrent::{InfoHash, PieceIndex};

/// Length of a BitTorrent handshake with the standard protocol string.
pub const HANDSHAKE_LEN: usize = 68;

const PROTOCOL: &str = "BitTorrent protocol";

/// 20-byte peer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Random peer ID carrying the Undertow client prefix.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-UT0001-");
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// Wire protocol messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    /// Piece availability, MSB first
    Bitfield {
        bitfield: Bytes,
    },
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT port announcement; accepted and ignored
    Port {
        port: u16,
    },
}

/// Handshake exchanged right after the transport is established.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    pub protocol: String,
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl PeerHandshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn is_bittorrent(&self) -> bool {
        self.protocol == PROTOCOL
    }
}
