//! SOCKS5 proxy support for peer connections.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::SwarmError;

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// SOCKS5 proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// Parses `socks5://host:port`, `host:port` or `[v6]:port`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem for unsupported schemes or a
    /// malformed address.
    pub fn parse(url: &str) -> Result<Self, String> {
        let url = url.trim();
        let rest = match url.split_once("://") {
            Some(("socks5" | "socks5h", rest)) => rest,
            Some((scheme, _)) => return Err(format!("unsupported proxy scheme '{scheme}'")),
            None => url,
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err("empty proxy address".to_string());
        }

        if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| "unterminated IPv6 proxy address".to_string())?;
            if host.is_empty() {
                return Err("empty proxy address".to_string());
            }
            let port = match tail {
                "" => DEFAULT_SOCKS_PORT,
                _ => parse_port(tail.strip_prefix(':').ok_or("invalid proxy address")?)?,
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }
        if rest.contains(']') {
            return Err("invalid proxy address".to_string());
        }

        match rest.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self {
                host: host.to_string(),
                port: parse_port(port)?,
            }),
            Some(_) => Err("empty proxy host".to_string()),
            None => Ok(Self {
                host: rest.to_string(),
                port: DEFAULT_SOCKS_PORT,
            }),
        }
    }

    /// Checks that the proxy accepts connections and speaks SOCKS5 without
    /// authentication.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerConnectionFailure` - Proxy unreachable or rejected the greeting
    pub async fn probe(&self, timeout: Duration) -> Result<(), SwarmError> {
        let mut stream = self.open(timeout).await?;
        tokio::time::timeout(timeout, greet(&mut stream))
            .await
            .map_err(|_| self.failure("greeting timed out"))?
            .map_err(|error| self.failure(error.to_string()))
    }

    /// Opens a TCP connection to `target` through the proxy.
    ///
    /// # Errors
    ///
    /// - `SwarmError::PeerConnectionFailure` - Proxy unreachable or refused the CONNECT
    pub async fn connect(&self, target: SocketAddr, timeout: Duration) -> Result<TcpStream, SwarmError> {
        let mut stream = self.open(timeout).await?;
        tokio::time::timeout(timeout, socks5_handshake(&mut stream, target))
            .await
            .map_err(|_| SwarmError::PeerConnectionFailure {
                address: target,
                reason: format!("SOCKS5 handshake via {self} timed out"),
            })?
            .map_err(|error| SwarmError::PeerConnectionFailure {
                address: target,
                reason: format!("SOCKS5 via {self}: {error}"),
            })?;
        Ok(stream)
    }

    async fn open(&self, timeout: Duration) -> Result<TcpStream, SwarmError> {
        let endpoint = (self.host.as_str(), self.port);
        match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(error)) => Err(self.failure(error.to_string())),
            Err(_) => Err(self.failure("connect timed out")),
        }
    }

    fn failure(&self, reason: impl Into<String>) -> SwarmError {
        SwarmError::ProxyUnavailable {
            proxy: self.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "socks5://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "socks5://{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(text: &str) -> Result<u16, String> {
    text.parse()
        .map_err(|_| format!("invalid proxy port '{text}'"))
}

fn protocol_error(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}

/// Version 5 greeting offering only "no authentication".
async fn greet<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(protocol_error("proxy requires unsupported authentication"));
    }
    Ok(())
}

/// Greeting plus CONNECT by IP address.
pub(crate) async fn socks5_handshake<S>(stream: &mut S, target: SocketAddr) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    greet(stream).await?;

    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[0x05, 0x01, 0x00]);
    match target.ip() {
        IpAddr::V4(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(0x04);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x05 {
        return Err(protocol_error("invalid SOCKS version in reply"));
    }
    if header[1] != 0x00 {
        return Err(protocol_error(format!("CONNECT refused with status {}", header[1])));
    }

    let bound_len = match header[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => stream.read_u8().await? as usize + 2,
        other => return Err(protocol_error(format!("unknown address type {other}"))),
    };
    let mut bound = vec![0u8; bound_len];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// Minimal SOCKS5 server that accepts one CONNECT and echoes bytes.
    async fn spawn_fake_proxy(reply_status: u8) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            stream
                .write_all(&[0x05, reply_status, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90])
                .await
                .unwrap();

            if reply_status == 0 {
                let mut payload = [0u8; 4];
                stream.read_exact(&mut payload).await.unwrap();
                stream.write_all(&payload).await.unwrap();
            }
            request.to_vec()
        });
        (addr, task)
    }

    #[test]
    fn test_parse_accepts_scheme_and_bare_forms() {
        assert_eq!(
            ProxyConfig::parse("socks5://127.0.0.1:9050/").unwrap(),
            ProxyConfig {
                host: "127.0.0.1".to_string(),
                port: 9050
            }
        );
        assert_eq!(ProxyConfig::parse("proxy.lan").unwrap().port, 1080);
        assert_eq!(ProxyConfig::parse("[::1]:1081").unwrap().host, "::1");
    }

    #[test]
    fn test_parse_malformed_rejected() {
        assert!(ProxyConfig::parse("http://proxy:8080").is_err());
        assert!(ProxyConfig::parse("socks5://").is_err());
        assert!(ProxyConfig::parse("[::1").is_err());
        assert!(ProxyConfig::parse("[::1]x").is_err());
        assert!(ProxyConfig::parse("host:notaport").is_err());
        assert!(ProxyConfig::parse(":1080").is_err());
    }

    #[tokio::test]
    async fn test_connect_through_fake_proxy_relays_bytes() {
        let (proxy_addr, proxy) = spawn_fake_proxy(0x00).await;
        let config = ProxyConfig {
            host: proxy_addr.ip().to_string(),
            port: proxy_addr.port(),
        };
        let target: SocketAddr = "203.0.113.7:6881".parse().unwrap();

        let mut stream = config.connect(target, Duration::from_secs(2)).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        let request = proxy.await.unwrap();
        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
        assert_eq!(&request[4..8], &[203, 0, 113, 7]);
        assert_eq!(u16::from_be_bytes([request[8], request[9]]), 6881);
    }

    #[tokio::test]
    async fn test_connect_refused_by_proxy_is_connection_failure() {
        let (proxy_addr, _proxy) = spawn_fake_proxy(0x05).await;
        let config = ProxyConfig {
            host: proxy_addr.ip().to_string(),
            port: proxy_addr.port(),
        };
        let target: SocketAddr = "203.0.113.7:6881".parse().unwrap();

        let result = config.connect(target, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(SwarmError::PeerConnectionFailure { .. })));
    }

    #[tokio::test]
    async fn test_probe_unreachable_proxy_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ProxyConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
        };
        let result = config.probe(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(SwarmError::ProxyUnavailable { .. })));
    }
}
