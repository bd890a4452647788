//! Message Stream Encryption (MSE/PE) key exchange and RC4 stream cipher.
//!
//! Outbound connections negotiate with an empty initial payload, so the
//! BitTorrent handshake travels through the established cipher afterwards.

use num_bigint::BigUint;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SwarmError;
use crate::torrent::InfoHash;

const KEY_LEN: usize = 96;
const MAX_PAD: usize = 512;
const RC4_DISCARD: usize = 1024;

const CRYPTO_PLAINTEXT: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// 768-bit safe prime from the MSE specification; generator is 2.
const PRIME: [u8; KEY_LEN] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2, 0x34,
    0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74,
    0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37,
    0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6,
    0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x3A, 0x36, 0x20, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Result of a completed key exchange.
pub enum Negotiated {
    Plaintext,
    Rc4(CipherState),
}

/// Paired RC4 streams for one connection.
pub struct CipherState {
    outbound: Rc4,
    inbound: Rc4,
}

impl CipherState {
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.outbound.apply(data);
    }

    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.inbound.apply(data);
    }

    /// Splits into (outbound, inbound) ciphers for separate writer and reader tasks.
    pub fn split(self) -> (Rc4, Rc4) {
        (self.outbound, self.inbound)
    }
}

/// Runs the initiator side of the exchange.
///
/// # Errors
///
/// - `SwarmError::Protocol` - Peer did not answer with a valid MSE response
/// - `SwarmError::Io` - Stream closed during the exchange
pub async fn initiate<S>(
    stream: &mut S,
    info_hash: &InfoHash,
    allow_plaintext: bool,
) -> Result<Negotiated, SwarmError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (private_key, public_key) = dh_generate();
    stream.write_all(&to_fixed_bytes(&public_key, KEY_LEN)).await?;

    let mut peer_public = [0u8; KEY_LEN];
    stream.read_exact(&mut peer_public).await?;
    let secret = shared_secret(&peer_public, &private_key)?;

    let skey = info_hash.as_bytes();
    let req1 = hash_parts(&[b"req1", &secret]);
    let req2 = hash_parts(&[b"req2", skey]);
    let req3 = hash_parts(&[b"req3", &secret]);
    let (out_key, in_key) = derive_keys(&secret, skey);

    let mut outbound = Rc4::with_discard(&out_key);
    let provide = if allow_plaintext {
        CRYPTO_RC4 | CRYPTO_PLAINTEXT
    } else {
        CRYPTO_RC4
    };
    let mut payload = Vec::with_capacity(16);
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&provide.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    outbound.apply(&mut payload);

    let mut message = Vec::with_capacity(40 + payload.len());
    message.extend_from_slice(&req1);
    message.extend_from_slice(&xor20(&req2, &req3));
    message.extend_from_slice(&payload);
    stream.write_all(&message).await?;
    stream.flush().await?;

    // Encrypted VC marks the end of the peer's PadB.
    let mut vc_pattern = [0u8; 8];
    Rc4::with_discard(&in_key).apply(&mut vc_pattern);
    scan_for(stream, &vc_pattern, MAX_PAD + vc_pattern.len()).await?;

    let mut inbound = Rc4::with_discard(&in_key);
    inbound.apply(&mut [0u8; 8]);

    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await?;
    inbound.apply(&mut header);
    let select = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let pad_len = u16::from_be_bytes([header[4], header[5]]) as usize;
    if pad_len > MAX_PAD {
        return Err(SwarmError::protocol("MSE PadD too large"));
    }
    let mut pad = vec![0u8; pad_len];
    stream.read_exact(&mut pad).await?;
    inbound.apply(&mut pad);

    if select == CRYPTO_RC4 {
        Ok(Negotiated::Rc4(CipherState { outbound, inbound }))
    } else if allow_plaintext && select == CRYPTO_PLAINTEXT {
        Ok(Negotiated::Plaintext)
    } else {
        Err(SwarmError::protocol(format!(
            "MSE peer selected unsupported crypto {select:#x}"
        )))
    }
}

/// Runs the responder side of the exchange.
///
/// Returns the negotiated mode, the matched info hash and the initiator's
/// initial payload.
///
/// # Errors
///
/// - `SwarmError::Protocol` - Unknown info hash, bad verification constant or no common crypto
/// - `SwarmError::Io` - Stream closed during the exchange
pub async fn accept<S>(
    stream: &mut S,
    info_hashes: &[InfoHash],
    allow_plaintext: bool,
) -> Result<(Negotiated, InfoHash, Vec<u8>), SwarmError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut peer_public = [0u8; KEY_LEN];
    stream.read_exact(&mut peer_public).await?;

    let (private_key, public_key) = dh_generate();
    stream.write_all(&to_fixed_bytes(&public_key, KEY_LEN)).await?;
    stream.flush().await?;
    let secret = shared_secret(&peer_public, &private_key)?;

    let req1 = hash_parts(&[b"req1", &secret]);
    let req3 = hash_parts(&[b"req3", &secret]);
    scan_for(stream, &req1, MAX_PAD + req1.len()).await?;

    let mut obfuscated = [0u8; 20];
    stream.read_exact(&mut obfuscated).await?;
    let req2 = xor20(&obfuscated, &req3);
    let info_hash = info_hashes
        .iter()
        .find(|hash| hash_parts(&[b"req2", hash.as_bytes()]) == req2)
        .copied()
        .ok_or_else(|| SwarmError::protocol("MSE unknown info hash"))?;

    // Responder keys are the initiator's, swapped.
    let (in_key, out_key) = derive_keys(&secret, info_hash.as_bytes());
    let mut inbound = Rc4::with_discard(&in_key);

    let mut header = [0u8; 14];
    stream.read_exact(&mut header).await?;
    inbound.apply(&mut header);
    if header[..8] != [0u8; 8] {
        return Err(SwarmError::protocol("MSE verification constant mismatch"));
    }
    let provide = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let pad_len = u16::from_be_bytes([header[12], header[13]]) as usize;
    if pad_len > MAX_PAD {
        return Err(SwarmError::protocol("MSE PadC too large"));
    }
    let mut pad = vec![0u8; pad_len + 2];
    stream.read_exact(&mut pad).await?;
    inbound.apply(&mut pad);
    let ia_len = u16::from_be_bytes([pad[pad_len], pad[pad_len + 1]]) as usize;
    let mut initial_payload = vec![0u8; ia_len];
    stream.read_exact(&mut initial_payload).await?;
    inbound.apply(&mut initial_payload);

    let select = if provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if allow_plaintext && provide & CRYPTO_PLAINTEXT != 0 {
        CRYPTO_PLAINTEXT
    } else {
        return Err(SwarmError::protocol("MSE no compatible crypto"));
    };

    let mut outbound = Rc4::with_discard(&out_key);
    let mut response = Vec::with_capacity(14);
    response.extend_from_slice(&[0u8; 8]);
    response.extend_from_slice(&select.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    outbound.apply(&mut response);
    stream.write_all(&response).await?;
    stream.flush().await?;

    let negotiated = if select == CRYPTO_RC4 {
        Negotiated::Rc4(CipherState { outbound, inbound })
    } else {
        Negotiated::Plaintext
    };
    Ok((negotiated, info_hash, initial_payload))
}

/// Reads byte by byte until `pattern` has been seen, within `limit` bytes.
async fn scan_for<S>(stream: &mut S, pattern: &[u8], limit: usize) -> Result<(), SwarmError>
where
    S: AsyncRead + Unpin,
{
    let mut window = Vec::with_capacity(limit);
    while window.len() < limit {
        window.push(stream.read_u8().await?);
        if window.ends_with(pattern) {
            return Ok(());
        }
    }
    Err(SwarmError::protocol("MSE synchronisation failed"))
}

fn hash_parts(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn xor20(a: &[u8; 20], b: &[u8; 20]) -> [u8; 20] {
    std::array::from_fn(|i| a[i] ^ b[i])
}

/// Initiator (outbound, inbound) keys.
fn derive_keys(secret: &[u8], skey: &[u8; 20]) -> ([u8; 20], [u8; 20]) {
    (
        hash_parts(&[b"keyA", secret, skey]),
        hash_parts(&[b"keyB", secret, skey]),
    )
}

fn dh_generate() -> (BigUint, BigUint) {
    let private_bytes: [u8; 20] = rand::random();
    let private_key = BigUint::from_bytes_be(&private_bytes);
    let public_key = BigUint::from(2u8).modpow(&private_key, &BigUint::from_bytes_be(&PRIME));
    (private_key, public_key)
}

fn shared_secret(peer_public: &[u8], private_key: &BigUint) -> Result<Vec<u8>, SwarmError> {
    let prime = BigUint::from_bytes_be(&PRIME);
    let peer = BigUint::from_bytes_be(peer_public);
    if peer <= BigUint::from(1u8) || peer >= prime {
        return Err(SwarmError::protocol("MSE invalid public key"));
    }
    Ok(to_fixed_bytes(&peer.modpow(private_key, &prime), KEY_LEN))
}

fn to_fixed_bytes(value: &BigUint, len: usize) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if bytes.len() >= len {
        return bytes[bytes.len() - len..].to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

/// RC4 keystream generator.
pub struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut state: [u8; 256] = std::array::from_fn(|i| i as u8);
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { state, i: 0, j: 0 }
    }

    fn with_discard(key: &[u8]) -> Self {
        let mut rc4 = Self::new(key);
        rc4.apply(&mut [0u8; RC4_DISCARD]);
        rc4
    }

    /// XORs `data` in place with the next keystream bytes.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let index = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[index as usize];
        }
    }
}
