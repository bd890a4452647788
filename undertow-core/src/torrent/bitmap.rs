//! Piece availability bitmap in BitTorrent wire order (MSB first).

use serde::{Deserialize, Serialize};

use super::PieceIndex;

/// Set of pieces, one bit per piece.
///
/// Used both for our own Verified coverage (persisted across restarts) and
/// for the bitfield each peer advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceBitmap {
    #[serde(with = "hex_bits")]
    bits: Vec<u8>,
    piece_count: u32,
}

impl PieceBitmap {
    /// Create new empty bitmap for given number of pieces
    pub fn new(piece_count: u32) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0u8; byte_count as usize],
            piece_count,
        }
    }

    /// Bitmap with every piece set.
    pub fn full(piece_count: u32) -> Self {
        let mut bitmap = Self::new(piece_count);
        for index in 0..piece_count {
            bitmap.set(PieceIndex::new(index));
        }
        bitmap
    }

    /// Create bitmap from raw wire bytes.
    ///
    /// Returns `None` when the byte count does not match the piece count or
    /// when spare trailing bits are set.
    pub fn from_bytes(bytes: &[u8], piece_count: u32) -> Option<Self> {
        let expected_bytes = piece_count.div_ceil(8) as usize;
        if bytes.len() != expected_bytes {
            return None;
        }
        let spare_bits = expected_bytes as u32 * 8 - piece_count;
        if spare_bits > 0 {
            let mask = (1u8 << spare_bits) - 1;
            if bytes[expected_bytes - 1] & mask != 0 {
                return None;
            }
        }
        Some(Self {
            bits: bytes.to_vec(),
            piece_count,
        })
    }

    /// Check if piece is present
    pub fn has(&self, piece: PieceIndex) -> bool {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return false;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] & (1 << bit_index) != 0
    }

    /// Mark piece as present
    pub fn set(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Mark piece as absent
    pub fn clear(&mut self, piece: PieceIndex) {
        let index = piece.as_u32();
        if index >= self.piece_count {
            return;
        }
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] &= !(1 << bit_index);
    }

    /// Raw bytes for transmission
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of pieces the bitmap describes.
    pub fn len(&self) -> u32 {
        self.piece_count
    }

    /// True when the bitmap describes zero pieces.
    pub fn is_empty(&self) -> bool {
        self.piece_count == 0
    }

    /// Number of pieces present.
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// True when every piece is present.
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.piece_count
    }

    /// True when every piece in the inclusive index range is present.
    pub fn has_all(&self, first: u32, last: u32) -> bool {
        (first..=last).all(|index| self.has(PieceIndex::new(index)))
    }

    /// Iterates over present piece indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(PieceIndex::new)
            .filter(|piece| self.has(*piece))
    }
}

mod hex_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bits: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bits))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_set_msb_first_layout() {
        let mut bitmap = PieceBitmap::new(10);
        bitmap.set(PieceIndex::new(0));
        bitmap.set(PieceIndex::new(9));

        assert_eq!(bitmap.as_bytes(), &[0b1000_0000, 0b0100_0000]);
        assert!(bitmap.has(PieceIndex::new(0)));
        assert!(!bitmap.has(PieceIndex::new(1)));
        assert_eq!(bitmap.count_set(), 2);

        bitmap.clear(PieceIndex::new(0));
        assert!(!bitmap.has(PieceIndex::new(0)));
    }

    #[test]
    fn test_bitmap_out_of_range_ignored() {
        let mut bitmap = PieceBitmap::new(3);
        bitmap.set(PieceIndex::new(3));
        assert!(!bitmap.has(PieceIndex::new(3)));
        assert_eq!(bitmap.count_set(), 0);
    }

    #[test]
    fn test_bitmap_from_bytes_spare_bits_rejected() {
        assert!(PieceBitmap::from_bytes(&[0xff, 0xc0], 10).is_some());
        assert!(PieceBitmap::from_bytes(&[0xff, 0xe0], 10).is_none());
        assert!(PieceBitmap::from_bytes(&[0xff], 10).is_none());
    }

    #[test]
    fn test_bitmap_full_is_complete() {
        let bitmap = PieceBitmap::full(13);
        assert!(bitmap.is_complete());
        assert!(bitmap.has_all(0, 12));
        assert_eq!(bitmap.iter_set().count(), 13);
    }

    #[test]
    fn test_bitmap_serde_round_trip_preserved() {
        let mut bitmap = PieceBitmap::new(12);
        bitmap.set(PieceIndex::new(4));
        bitmap.set(PieceIndex::new(11));

        let json = serde_json::to_string(&bitmap).unwrap();
        let back: PieceBitmap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bitmap);
    }
}
