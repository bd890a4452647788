//! Length-prefixed message encoding.

use bytes::{Buf, BufMut, Bytes};

use super::PeerMessage;
use crate::swarm::SwarmError;
use crate::torrent::PieceIndex;

/// Message serialization for the wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a message including its 4-byte length prefix.
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => buf.put_u32(0),
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
        }

        buf
    }

    /// Parses one message including its length prefix.
    ///
    /// # Errors
    ///
    /// - `SwarmError::Protocol` - Truncated frame, bad length for the id, or unknown id
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, SwarmError> {
        if data.len() < 4 {
            return Err(SwarmError::protocol("Message too short"));
        }

        let mut buf = data;
        let length = buf.get_u32() as usize;
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if buf.len() < length {
            return Err(SwarmError::protocol("Incomplete message"));
        }
        let mut payload = &buf[..length];
        let message_id = payload.get_u8();

        let expect_len = |expected: usize, name: &str| {
            if length == expected {
                Ok(())
            } else {
                Err(SwarmError::protocol(format!(
                    "Invalid {name} message length {length}"
                )))
            }
        };

        match message_id {
            0 => expect_len(1, "Choke").map(|()| PeerMessage::Choke),
            1 => expect_len(1, "Unchoke").map(|()| PeerMessage::Unchoke),
            2 => expect_len(1, "Interested").map(|()| PeerMessage::Interested),
            3 => expect_len(1, "NotInterested").map(|()| PeerMessage::NotInterested),
            4 => {
                expect_len(5, "Have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(payload.get_u32()),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(payload),
            }),
            6 | 8 => {
                expect_len(13, if message_id == 6 { "Request" } else { "Cancel" })?;
                let piece_index = PieceIndex::new(payload.get_u32());
                let offset = payload.get_u32();
                let length = payload.get_u32();
                Ok(if message_id == 6 {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            7 => {
                if length < 9 {
                    return Err(SwarmError::protocol("Invalid Piece message length"));
                }
                let piece_index = PieceIndex::new(payload.get_u32());
                let offset = payload.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(payload),
                })
            }
            9 => {
                expect_len(3, "Port")?;
                Ok(PeerMessage::Port {
                    port: payload.get_u16(),
                })
            }
            _ => Err(SwarmError::protocol(format!(
                "Unknown message ID: {message_id}"
            ))),
        }
    }
}
