//! Handshake encoding.

use super::{PeerHandshake, PeerId};
use crate::swarm::SwarmError;
use crate::torrent::InfoHash;

/// Handshake serialization for the wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// `<pstrlen><pstr><reserved><info_hash><peer_id>`
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(49 + handshake.protocol.len());
        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// # Errors
    ///
    /// - `SwarmError::Protocol` - Truncated handshake
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, SwarmError> {
        let Some(&protocol_len) = data.first() else {
            return Err(SwarmError::protocol("Handshake too short"));
        };
        let protocol_len = protocol_len as usize;
        if data.len() < 1 + protocol_len + 8 + 20 + 20 {
            return Err(SwarmError::protocol("Handshake too short"));
        }

        let protocol = String::from_utf8_lossy(&data[1..1 + protocol_len]).to_string();
        let mut cursor = 1 + protocol_len;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[cursor..cursor + 8]);
        cursor += 8;

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[cursor..cursor + 20]);
        cursor += 20;

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[cursor..cursor + 20]);

        Ok(PeerHandshake {
            protocol,
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}
