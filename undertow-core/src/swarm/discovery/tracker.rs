//! HTTP tracker announces (BEP 3, compact peer lists per BEP 23).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use async_trait::async_trait;

use super::{AnnounceEvent, AnnounceRequest, AnnounceResponse, PeerDiscovery};
use crate::swarm::SwarmError;

const USER_AGENT: &str = concat!("Undertow/", env!("CARGO_PKG_VERSION"));

/// Announce client for one HTTP(S) tracker.
pub struct HttpTracker {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    /// # Errors
    ///
    /// - `SwarmError::DiscoverySourceFailure` - URL is not HTTP(S) or the client cannot be built
    pub fn new(announce_url: impl Into<String>, timeout: Duration) -> Result<Self, SwarmError> {
        let announce_url = announce_url.into();
        let parsed = url::Url::parse(&announce_url).map_err(|e| SwarmError::DiscoverySourceFailure {
            url: announce_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SwarmError::DiscoverySourceFailure {
                url: announce_url,
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| SwarmError::DiscoverySourceFailure {
                url: announce_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            announce_url,
            client,
        })
    }

    fn failure(&self, reason: impl Into<String>) -> SwarmError {
        SwarmError::DiscoverySourceFailure {
            url: self.announce_url.clone(),
            reason: reason.into(),
        }
    }

    /// Announce URL with the query appended. Binary fields are percent
    /// encoded from raw bytes so they are not double-encoded.
    pub(crate) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            urlencoding::encode_binary(request.info_hash.as_bytes()),
            urlencoding::encode_binary(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event.as_query() {
            query.push_str("&event=");
            query.push_str(event);
        }
        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        format!("{}{separator}{query}", self.announce_url)
    }

    pub(crate) fn parse_announce_response(&self, body: &[u8]) -> Result<AnnounceResponse, SwarmError> {
        let parsed = bencode_rs::Value::parse(body)
            .map_err(|e| self.failure(format!("invalid bencode: {e:?}")))?;
        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(self.failure("response is not a dictionary"));
        };

        if let Some(bencode_rs::Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
            return Err(self.failure(format!(
                "tracker error: {}",
                String::from_utf8_lossy(reason)
            )));
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(bencode_rs::Value::Integer(secs)) if *secs >= 0 => *secs as u64,
            _ => return Err(self.failure("missing interval")),
        };
        let count = |key: &[u8]| match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) if *value >= 0 => *value as u32,
            _ => 0,
        };

        let mut peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(compact)) => {
                parse_compact_peers(compact).map_err(|reason| self.failure(reason))?
            }
            _ => Vec::new(),
        };
        if let Some(bencode_rs::Value::Bytes(compact)) = dict.get(b"peers6".as_slice()) {
            peers.extend(parse_compact_peers6(compact).map_err(|reason| self.failure(reason))?);
        }

        Ok(AnnounceResponse {
            interval: Duration::from_secs(interval),
            seeders: count(b"complete"),
            leechers: count(b"incomplete"),
            peers,
        })
    }
}

#[async_trait]
impl PeerDiscovery for HttpTracker {
    fn name(&self) -> &str {
        &self.announce_url
    }

    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, SwarmError> {
        let url = self.build_announce_url(request);
        tracing::debug!("HttpTracker::announce: url={} event={:?}", self.announce_url, request.event);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                self.failure("request timed out")
            } else {
                self.failure(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.failure(format!("HTTP status {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| self.failure(format!("failed to read body: {e}")))?;

        let parsed = self.parse_announce_response(&body)?;
        tracing::debug!(
            "HttpTracker::announce: url={} peers={} seeders={} leechers={}",
            self.announce_url,
            parsed.peers.len(),
            parsed.seeders,
            parsed.leechers
        );
        Ok(parsed)
    }
}

/// Parses 6-byte IPv4 compact peers.
pub(crate) fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, String> {
    if !bytes.len().is_multiple_of(6) {
        return Err("invalid compact peer data length".to_string());
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// Parses 18-byte IPv6 compact peers.
pub(crate) fn parse_compact_peers6(bytes: &[u8]) -> Result<Vec<SocketAddr>, String> {
    if !bytes.len().is_multiple_of(18) {
        return Err("invalid compact peer6 data length".to_string());
    }
    Ok(bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[..16]);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
        })
        .collect())
}

impl AnnounceEvent {
    fn as_query(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Regular => None,
        }
    }
}
