//! Connection establishment and framed message I/O.
//!
//! `establish` applies, in order: blocklist, optional SOCKS5 proxy, the
//! encryption policy, then the BitTorrent handshake with an info-hash check.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::mse::{self, CipherState, Negotiated, Rc4};
use super::protocol::{HANDSHAKE_LEN, HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
use super::{Blocklist, EncryptionPolicy, ProxyConfig, SwarmError};
use crate::torrent::InfoHash;

/// Largest accepted frame; a 16 KiB block plus headers fits easily.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Options that shape outbound connection setup.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub encryption: EncryptionPolicy,
    pub proxy: Option<ProxyConfig>,
}

/// Reads length-prefixed messages, decrypting when a cipher is present.
pub struct MessageReader<R> {
    inner: R,
    cipher: Option<Rc4>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R, cipher: Option<Rc4>) -> Self {
        Self { inner, cipher }
    }

    /// # Errors
    ///
    /// - `SwarmError::Protocol` - Oversized or malformed frame
    /// - `SwarmError::Io` - Connection closed or failed
    pub async fn read_message(&mut self) -> Result<PeerMessage, SwarmError> {
        let mut frame = vec![0u8; 4];
        self.read_decrypted(&mut frame).await?;
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(SwarmError::protocol(format!("Frame of {length} bytes exceeds limit")));
        }
        frame.resize(4 + length, 0);
        self.read_decrypted(&mut frame[4..]).await?;
        MessageCodec::deserialize_message(&frame)
    }

    async fn read_decrypted(&mut self, buf: &mut [u8]) -> Result<(), SwarmError> {
        self.inner.read_exact(buf).await?;
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(buf);
        }
        Ok(())
    }
}

/// Writes length-prefixed messages, encrypting when a cipher is present.
pub struct MessageWriter<W> {
    inner: W,
    cipher: Option<Rc4>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W, cipher: Option<Rc4>) -> Self {
        Self { inner, cipher }
    }

    /// # Errors
    ///
    /// - `SwarmError::Io` - Connection closed or failed
    pub async fn write_message(&mut self, message: &PeerMessage) -> Result<(), SwarmError> {
        let mut frame = MessageCodec::serialize_message(message);
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut frame);
        }
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Established, handshaken peer connection.
pub struct Connection {
    pub address: SocketAddr,
    pub remote_peer_id: PeerId,
    pub encrypted: bool,
    pub reader: MessageReader<OwnedReadHalf>,
    pub writer: MessageWriter<OwnedWriteHalf>,
}

/// Opens an outbound connection and completes the BitTorrent handshake.
///
/// # Errors
///
/// - `SwarmError::Blocked` - Address is on the blocklist
/// - `SwarmError::PeerConnectionFailure` - TCP, proxy, encryption or handshake failure
/// - `SwarmError::ProxyUnavailable` - Configured proxy cannot be reached
pub async fn establish(
    address: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    blocklist: &Blocklist,
    options: &ConnectOptions,
) -> Result<Connection, SwarmError> {
    if blocklist.is_blocked(address.ip()) {
        return Err(SwarmError::Blocked { address });
    }

    match options.encryption {
        EncryptionPolicy::Disabled => plaintext(address, info_hash, peer_id, options).await,
        EncryptionPolicy::Required => encrypted(address, info_hash, peer_id, options, false).await,
        EncryptionPolicy::Enabled => {
            match encrypted(address, info_hash, peer_id, options, true).await {
                Ok(connection) => Ok(connection),
                Err(error @ SwarmError::ProxyUnavailable { .. }) => Err(error),
                Err(error) => {
                    tracing::debug!("establish: encrypted attempt failed, retrying plaintext address={address} error={error}");
                    plaintext(address, info_hash, peer_id, options).await
                }
            }
        }
    }
}

async fn plaintext(
    address: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    options: &ConnectOptions,
) -> Result<Connection, SwarmError> {
    let mut stream = open_stream(address, options).await?;
    let remote_peer_id = with_timeout(
        address,
        options.connect_timeout,
        exchange_handshake(&mut stream, None, info_hash, peer_id),
    )
    .await?;
    let (read_half, write_half) = stream.into_split();
    Ok(Connection {
        address,
        remote_peer_id,
        encrypted: false,
        reader: MessageReader::new(read_half, None),
        writer: MessageWriter::new(write_half, None),
    })
}

async fn encrypted(
    address: SocketAddr,
    info_hash: InfoHash,
    peer_id: PeerId,
    options: &ConnectOptions,
    allow_plaintext: bool,
) -> Result<Connection, SwarmError> {
    let mut stream = open_stream(address, options).await?;
    let negotiated = with_timeout(
        address,
        options.connect_timeout,
        mse::initiate(&mut stream, &info_hash, allow_plaintext),
    )
    .await?;

    let mut cipher = match negotiated {
        Negotiated::Rc4(cipher) => Some(cipher),
        Negotiated::Plaintext => None,
    };
    let remote_peer_id = with_timeout(
        address,
        options.connect_timeout,
        exchange_handshake(&mut stream, cipher.as_mut(), info_hash, peer_id),
    )
    .await?;

    let encrypted = cipher.is_some();
    let (outbound, inbound) = match cipher.map(CipherState::split) {
        Some((outbound, inbound)) => (Some(outbound), Some(inbound)),
        None => (None, None),
    };
    let (read_half, write_half) = stream.into_split();
    Ok(Connection {
        address,
        remote_peer_id,
        encrypted,
        reader: MessageReader::new(read_half, inbound),
        writer: MessageWriter::new(write_half, outbound),
    })
}

async fn open_stream(address: SocketAddr, options: &ConnectOptions) -> Result<TcpStream, SwarmError> {
    if let Some(proxy) = &options.proxy {
        return proxy.connect(address, options.connect_timeout).await;
    }
    match tokio::time::timeout(options.connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(error)) => Err(SwarmError::connection(address, error.to_string())),
        Err(_) => Err(SwarmError::connection(address, "connect timed out")),
    }
}

async fn with_timeout<T>(
    address: SocketAddr,
    timeout: Duration,
    future: impl Future<Output = Result<T, SwarmError>>,
) -> Result<T, SwarmError> {
    match tokio::time::timeout(timeout, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(SwarmError::connection(address, error.to_string())),
        Err(_) => Err(SwarmError::connection(address, "handshake timed out")),
    }
}

/// Sends our handshake, reads and validates the peer's.
pub(crate) async fn exchange_handshake<S>(
    stream: &mut S,
    mut cipher: Option<&mut CipherState>,
    info_hash: InfoHash,
    peer_id: PeerId,
) -> Result<PeerId, SwarmError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outbound = HandshakeCodec::serialize_handshake(&PeerHandshake::new(info_hash, peer_id));
    if let Some(cipher) = cipher.as_deref_mut() {
        cipher.encrypt(&mut outbound);
    }
    stream.write_all(&outbound).await?;
    stream.flush().await?;

    let mut inbound = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut inbound).await?;
    if let Some(cipher) = cipher.as_deref_mut() {
        cipher.decrypt(&mut inbound);
    }
    let handshake = HandshakeCodec::deserialize_handshake(&inbound)?;
    if !handshake.is_bittorrent() {
        return Err(SwarmError::protocol("Peer does not speak BitTorrent"));
    }
    if handshake.info_hash != info_hash {
        return Err(SwarmError::protocol(format!(
            "Info hash mismatch: expected {info_hash}, got {}",
            handshake.info_hash
        )));
    }
    Ok(handshake.peer_id)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::net::TcpListener;

    use super::*;
    use crate::torrent::PieceIndex;

    fn options(encryption: EncryptionPolicy) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_secs(2),
            encryption,
            proxy: None,
        }
    }

    /// Answers one plaintext handshake, then sends a single Have.
    async fn spawn_plain_peer(info_hash: InfoHash) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut prefix = [0u8; 20];
            stream.read_exact(&mut prefix).await.unwrap();
            if &prefix != b"\x13BitTorrent protocol" {
                // Encrypted attempt: refuse it so the caller falls back.
                drop(stream);
                stream = listener.accept().await.unwrap().0;
                stream.read_exact(&mut prefix).await.unwrap();
            }
            let mut rest = [0u8; HANDSHAKE_LEN - 20];
            stream.read_exact(&mut rest).await.unwrap();
            let reply = PeerHandshake::new(info_hash, PeerId::new([7u8; 20]));
            stream
                .write_all(&HandshakeCodec::serialize_handshake(&reply))
                .await
                .unwrap();
            let have = PeerMessage::Have {
                piece_index: PieceIndex::new(3),
            };
            stream
                .write_all(&MessageCodec::serialize_message(&have))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_establish_plaintext_exchanges_handshake() {
        let info_hash = InfoHash::new([4u8; 20]);
        let addr = spawn_plain_peer(info_hash).await;

        let mut connection = establish(
            addr,
            info_hash,
            PeerId::generate(),
            &Blocklist::default(),
            &options(EncryptionPolicy::Disabled),
        )
        .await
        .unwrap();

        assert_eq!(connection.remote_peer_id, PeerId::new([7u8; 20]));
        assert!(!connection.encrypted);
        assert_eq!(
            connection.reader.read_message().await.unwrap(),
            PeerMessage::Have {
                piece_index: PieceIndex::new(3)
            }
        );
    }

    #[tokio::test]
    async fn test_establish_enabled_falls_back_to_plaintext() {
        let info_hash = InfoHash::new([4u8; 20]);
        let addr = spawn_plain_peer(info_hash).await;

        let connection = establish(
            addr,
            info_hash,
            PeerId::generate(),
            &Blocklist::default(),
            &options(EncryptionPolicy::Enabled),
        )
        .await
        .unwrap();
        assert!(!connection.encrypted);
    }

    #[tokio::test]
    async fn test_establish_blocked_address_rejected() {
        let blocklist = Blocklist::parse("127.0.0.0/8").unwrap();
        let result = establish(
            "127.0.0.1:6881".parse().unwrap(),
            InfoHash::new([4u8; 20]),
            PeerId::generate(),
            &blocklist,
            &options(EncryptionPolicy::Disabled),
        )
        .await;
        assert!(matches!(result, Err(SwarmError::Blocked { .. })));
    }

    #[tokio::test]
    async fn test_establish_info_hash_mismatch_rejected() {
        let addr = spawn_plain_peer(InfoHash::new([1u8; 20])).await;
        let result = establish(
            addr,
            InfoHash::new([2u8; 20]),
            PeerId::generate(),
            &Blocklist::default(),
            &options(EncryptionPolicy::Disabled),
        )
        .await;
        assert!(matches!(result, Err(SwarmError::PeerConnectionFailure { .. })));
    }

    #[tokio::test]
    async fn test_encrypted_stream_carries_messages() {
        let info_hash = InfoHash::new([6u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (negotiated, _, _) = mse::accept(&mut stream, &[info_hash], false).await.unwrap();
            let Negotiated::Rc4(mut cipher) = negotiated else {
                return;
            };
            exchange_handshake(&mut stream, Some(&mut cipher), info_hash, PeerId::new([8u8; 20]))
                .await
                .unwrap();
            let (outbound, _) = cipher.split();
            let mut writer = MessageWriter::new(stream, Some(outbound));
            writer
                .write_message(&PeerMessage::Piece {
                    piece_index: PieceIndex::new(0),
                    offset: 0,
                    data: Bytes::from_static(b"payload"),
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut connection = establish(
            addr,
            info_hash,
            PeerId::generate(),
            &Blocklist::default(),
            &options(EncryptionPolicy::Required),
        )
        .await
        .unwrap();
        assert!(connection.encrypted);
        assert_eq!(connection.remote_peer_id, PeerId::new([8u8; 20]));
        let PeerMessage::Piece { data, .. } = connection.reader.read_message().await.unwrap() else {
            panic!("expected piece");
        };
        assert_eq!(&data[..], b"payload");
    }
}
