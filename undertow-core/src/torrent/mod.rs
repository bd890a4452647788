//! Torrent identity and descriptor types shared by every engine component

pub mod bitmap;
pub mod descriptor;

use std::fmt;
use std::str::FromStr;

pub use bitmap::PieceBitmap;
pub use descriptor::{FileEntry, TorrentDescriptor};

/// Size of a block requested over the wire (16 KiB).
pub const BLOCK_SIZE: u32 = 16_384;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network and as
/// the key of every per-torrent registry in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form used for on-disk file names.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TorrentError::InvalidInfoHash {
            value: s.to_string(),
        })?;
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::InvalidInfoHash {
                value: s.to_string(),
            })?;
        Ok(Self(hash))
    }
}

impl serde::Serialize for InfoHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for InfoHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as usize for slice access.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while building or validating a torrent descriptor.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Invalid torrent descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("Invalid info hash: {value}")]
    InvalidInfoHash { value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display_hex_lowercase() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(info_hash.to_hex(), info_hash.to_string());
    }

    #[test]
    fn test_info_hash_from_str_round_trips() {
        let info_hash = InfoHash::new([0xab; 20]);
        let parsed: InfoHash = info_hash.to_string().parse().unwrap();
        assert_eq!(parsed, info_hash);
    }

    #[test]
    fn test_info_hash_from_str_wrong_length_rejected() {
        assert!("abcd".parse::<InfoHash>().is_err());
        assert!("zz".repeat(20).parse::<InfoHash>().is_err());
    }

    #[test]
    fn test_info_hash_serde_uses_hex_string() {
        let info_hash = InfoHash::new([0x11; 20]);
        let json = serde_json::to_string(&info_hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(20)));
        let back: InfoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info_hash);
    }

    #[test]
    fn test_piece_index_ordering_by_value() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
        assert_eq!(piece2.to_string(), "10");
    }
}
