//! Centralized configuration for Undertow.
//!
//! All tunable parameters are defined here so limits and timeouts are not
//! scattered through the engine. The settings collaborator can load the
//! configuration from JSON; every section falls back to its defaults for
//! missing fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::UndertowError;
use crate::scheduler::DEFAULT_PIPELINE_DEPTH;
use crate::swarm::discovery::Backoff;
use crate::swarm::{EncryptionPolicy, ProxyConfig, SwarmConfig};

/// Port range used when `network.random_port` is set.
const RANDOM_PORT_RANGE: std::ops::RangeInclusive<u16> = 6881..=6999;

/// Central configuration for all Undertow components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndertowConfig {
    pub bandwidth: BandwidthConfig,
    pub network: NetworkConfig,
    pub privacy: PrivacyConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub streaming: StreamingConfig,
    pub discovery: DiscoveryConfig,
}

/// Transfer caps shared by every torrent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Download cap in KB/s (0 = unlimited)
    pub download_limit_kbps: u64,
    /// Upload cap in KB/s (0 = unlimited)
    pub upload_limit_kbps: u64,
}

/// Peer connection limits and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port advertised to trackers
    pub listen_port: u16,
    /// Pick a port from 6881..=6999 at start instead of `listen_port`
    pub random_port: bool,
    /// TCP connect plus handshake timeout
    #[serde(with = "duration_secs")]
    pub peer_connect_timeout: Duration,
    /// Time a block request may stay unanswered before it is reissued
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Request timeouts tolerated before a peer is disconnected, and failed
    /// connection attempts before an address is given up
    pub max_fail_count: u32,
    /// Wait before reconnecting to a failed address; doubles per failure
    #[serde(with = "duration_secs")]
    pub min_reconnect_time: Duration,
    pub max_peers_per_torrent: usize,
    /// Outstanding block requests per peer
    pub pipeline_depth: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            random_port: false,
            peer_connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_fail_count: 5,
            min_reconnect_time: Duration::from_secs(60),
            max_peers_per_torrent: 50,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
        }
    }
}

impl NetworkConfig {
    /// Retry schedule for failed peer connections.
    pub fn reconnect_backoff(&self) -> Backoff {
        Backoff::new(
            self.min_reconnect_time,
            self.min_reconnect_time.saturating_mul(16),
        )
    }
}

/// Connection privacy policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub encryption: EncryptionPolicy,
    /// Mandatory SOCKS5 proxy; when set no peer is contacted directly
    pub proxy: Option<ProxyConfig>,
    pub blocklist_path: Option<PathBuf>,
}

/// Where torrent data lives and whether it outlives the torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub download_dir: PathBuf,
    /// Keep data on disk after a torrent is removed from the engine
    pub keep_files: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_dir: std::env::temp_dir().join("undertow"),
            keep_files: false,
        }
    }
}

/// Retention policy for cached torrents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub retention_days: u32,
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Playback window sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Bytes past the read offset that must be verified for `Ready`
    pub lookahead_bytes: u64,
    /// Trailing pieces of the selected file fetched first (container index)
    pub tail_pieces: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            lookahead_bytes: 8 * 1024 * 1024,
            tail_pieces: 6,
        }
    }
}

/// Peer discovery sources and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Extra trackers appended to the descriptor's hints
    pub trackers: Vec<String>,
    /// DHT bootstrap routers, `host:port`
    pub dht_routers: Vec<String>,
    #[serde(with = "duration_secs")]
    pub retry_base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub retry_max_delay: Duration,
    #[serde(with = "duration_secs")]
    pub announce_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            trackers: Vec::new(),
            dht_routers: vec![
                "router.bittorrent.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
            ],
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            announce_timeout: Duration::from_secs(15),
        }
    }
}

impl DiscoveryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.retry_base_delay, self.retry_max_delay)
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparsable values are ignored and the default kept, except for
    /// `UNDERTOW_PROXY`: an invalid proxy is kept so `validate` rejects it.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(kbps) = env_parse("UNDERTOW_DOWNLOAD_LIMIT_KBPS") {
            config.bandwidth.download_limit_kbps = kbps;
        }
        if let Some(kbps) = env_parse("UNDERTOW_UPLOAD_LIMIT_KBPS") {
            config.bandwidth.upload_limit_kbps = kbps;
        }

        if let Some(port) = env_parse("UNDERTOW_LISTEN_PORT") {
            config.network.listen_port = port;
        }
        if let Some(random) = env_parse("UNDERTOW_RANDOM_PORT") {
            config.network.random_port = random;
        }
        if let Some(seconds) = env_parse("UNDERTOW_PEER_CONNECT_TIMEOUT") {
            config.network.peer_connect_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse("UNDERTOW_REQUEST_TIMEOUT") {
            config.network.request_timeout = Duration::from_secs(seconds);
        }
        if let Some(seconds) = env_parse("UNDERTOW_MIN_RECONNECT_TIME") {
            config.network.min_reconnect_time = Duration::from_secs(seconds);
        }
        if let Some(count) = env_parse("UNDERTOW_MAX_FAIL_COUNT") {
            config.network.max_fail_count = count;
        }
        if let Some(count) = env_parse("UNDERTOW_MAX_PEERS") {
            config.network.max_peers_per_torrent = count;
        }
        if let Some(depth) = env_parse("UNDERTOW_PIPELINE_DEPTH") {
            config.network.pipeline_depth = depth;
        }

        if let Ok(policy) = std::env::var("UNDERTOW_ENCRYPTION") {
            match policy.to_lowercase().as_str() {
                "disabled" => config.privacy.encryption = EncryptionPolicy::Disabled,
                "enabled" => config.privacy.encryption = EncryptionPolicy::Enabled,
                "required" => config.privacy.encryption = EncryptionPolicy::Required,
                _ => tracing::warn!("UndertowConfig::from_env: ignoring encryption={policy}"),
            }
        }
        if let Ok(proxy) = std::env::var("UNDERTOW_PROXY") {
            config.privacy.proxy = Some(ProxyConfig::parse(&proxy).unwrap_or(ProxyConfig {
                host: proxy,
                port: 0,
            }));
        }
        if let Ok(path) = std::env::var("UNDERTOW_BLOCKLIST") {
            config.privacy.blocklist_path = Some(PathBuf::from(path));
        }

        if let Ok(dir) = std::env::var("UNDERTOW_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }
        if let Some(keep) = env_parse("UNDERTOW_KEEP_FILES") {
            config.storage.keep_files = keep;
        }

        if let Some(days) = env_parse("UNDERTOW_RETENTION_DAYS") {
            config.cache.retention_days = days;
        }
        if let Some(bytes) = env_parse("UNDERTOW_LOOKAHEAD_BYTES") {
            config.streaming.lookahead_bytes = bytes;
        }
        if let Ok(trackers) = std::env::var("UNDERTOW_TRACKERS") {
            config.discovery.trackers = trackers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }

        config
    }

    /// Creates a configuration optimized for testing: short timeouts, small
    /// windows and no encryption negotiation.
    pub fn for_testing() -> Self {
        Self {
            network: NetworkConfig {
                peer_connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(5),
                min_reconnect_time: Duration::from_millis(100),
                ..Default::default()
            },
            privacy: PrivacyConfig {
                encryption: EncryptionPolicy::Disabled,
                ..Default::default()
            },
            storage: StorageConfig {
                download_dir: std::env::temp_dir().join("undertow-test"),
                keep_files: false,
            },
            cache: CacheConfig {
                retention_days: 7,
                sweep_interval: Duration::from_secs(1),
            },
            streaming: StreamingConfig {
                lookahead_bytes: 64 * 1024,
                tail_pieces: 1,
            },
            discovery: DiscoveryConfig {
                dht_routers: Vec::new(),
                retry_base_delay: Duration::from_millis(100),
                retry_max_delay: Duration::from_secs(1),
                announce_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reads a JSON configuration file and validates it.
    ///
    /// # Errors
    ///
    /// - `UndertowError::ConfigurationRejected` - File unreadable, malformed or invalid
    pub fn from_json_file(path: &Path) -> Result<Self, UndertowError> {
        let text = std::fs::read_to_string(path).map_err(|e| UndertowError::ConfigurationRejected {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| UndertowError::ConfigurationRejected {
                reason: format!("invalid configuration {}: {e}", path.display()),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// - `UndertowError::ConfigurationRejected` - Zero pipeline depth, peer limit,
    ///   fail count, timeout, sweep interval or retry delay, or a malformed proxy
    pub fn validate(&self) -> Result<(), UndertowError> {
        let reject = |reason: &str| {
            Err(UndertowError::ConfigurationRejected {
                reason: reason.to_string(),
            })
        };

        if self.network.pipeline_depth == 0 {
            return reject("network.pipeline_depth must be at least 1");
        }
        if self.network.max_peers_per_torrent == 0 {
            return reject("network.max_peers_per_torrent must be at least 1");
        }
        if self.network.peer_connect_timeout.is_zero()
            || self.network.request_timeout.is_zero()
            || self.network.min_reconnect_time.is_zero()
        {
            return reject("network timeouts must be non-zero");
        }
        if self.network.max_fail_count == 0 {
            return reject("network.max_fail_count must be at least 1");
        }
        if self.cache.sweep_interval.is_zero() {
            return reject("cache.sweep_interval must be non-zero");
        }
        if self.discovery.retry_base_delay.is_zero()
            || self.discovery.retry_max_delay < self.discovery.retry_base_delay
        {
            return reject("discovery retry delays must be non-zero and ordered");
        }
        if let Some(proxy) = &self.privacy.proxy
            && (proxy.host.trim().is_empty() || proxy.port == 0)
        {
            return Err(UndertowError::ConfigurationRejected {
                reason: format!("invalid proxy '{}'", proxy.host),
            });
        }
        Ok(())
    }

    /// Port to advertise, drawing a random one when configured.
    pub fn effective_listen_port(&self) -> u16 {
        if self.network.random_port {
            rand::rng().random_range(RANDOM_PORT_RANGE)
        } else {
            self.network.listen_port
        }
    }

    /// Connection policy handed to each torrent's swarm.
    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig {
            connect_timeout: self.network.peer_connect_timeout,
            encryption: self.privacy.encryption,
            proxy: self.privacy.proxy.clone(),
            max_peers: self.network.max_peers_per_torrent,
            max_fail_count: self.network.max_fail_count,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("UndertowConfig::from_env: ignoring {name}={value}");
            None
        }
    }
}

/// Durations as (fractional) seconds in serialized configuration.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();

        assert_eq!(config.bandwidth.download_limit_kbps, 0);
        assert_eq!(config.network.listen_port, 6881);
        assert_eq!(config.network.pipeline_depth, 10);
        assert_eq!(config.privacy.encryption, EncryptionPolicy::Enabled);
        assert!(config.privacy.proxy.is_none());
        assert!(!config.storage.keep_files);
        assert_eq!(config.cache.retention_days, 7);
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.streaming.lookahead_bytes, 8 * 1024 * 1024);
        assert_eq!(config.streaming.tail_pieces, 6);
        assert_eq!(config.discovery.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.discovery.retry_max_delay, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_presets() {
        let testing = UndertowConfig::for_testing();
        assert_eq!(testing.privacy.encryption, EncryptionPolicy::Disabled);
        assert!(testing.network.request_timeout < NetworkConfig::default().request_timeout);
        assert_eq!(
            testing.network.reconnect_backoff().delay(2),
            Duration::from_millis(200)
        );
        assert!(testing.discovery.dht_routers.is_empty());
        assert!(testing.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_pipeline_rejected() {
        let mut config = UndertowConfig::default();
        config.network.pipeline_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(UndertowError::ConfigurationRejected { reason }) if reason.contains("pipeline_depth")
        ));
    }

    #[test]
    fn test_validate_invalid_proxy_rejected() {
        let mut config = UndertowConfig::default();
        config.privacy.proxy = Some(ProxyConfig {
            host: "proxy.local".to_string(),
            port: 0,
        });
        assert!(config.validate().is_err());

        config.privacy.proxy = Some(ProxyConfig::parse("socks5://proxy.local:9050").unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_listen_port_random_in_range() {
        let mut config = UndertowConfig::default();
        config.network.listen_port = 7000;
        assert_eq!(config.effective_listen_port(), 7000);

        config.network.random_port = true;
        for _ in 0..50 {
            assert!(RANDOM_PORT_RANGE.contains(&config.effective_listen_port()));
        }
    }

    #[test]
    fn test_json_partial_sections_use_defaults() {
        let json = r#"{
            "bandwidth": { "download_limit_kbps": 512 },
            "privacy": { "encryption": "required", "proxy": { "host": "10.0.0.1", "port": 1080 } },
            "discovery": { "retry_base_delay": 0.5 }
        }"#;
        let config: UndertowConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.bandwidth.download_limit_kbps, 512);
        assert_eq!(config.bandwidth.upload_limit_kbps, 0);
        assert_eq!(config.privacy.encryption, EncryptionPolicy::Required);
        assert_eq!(config.privacy.proxy.as_ref().map(|p| p.port), Some(1080));
        assert_eq!(config.discovery.retry_base_delay, Duration::from_millis(500));
        assert_eq!(config.network, NetworkConfig::default());
    }

    #[test]
    fn test_from_json_file_invalid_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("undertow.json");
        std::fs::write(&path, r#"{ "network": { "pipeline_depth": 0 } }"#).unwrap();
        assert!(UndertowConfig::from_json_file(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(UndertowConfig::from_json_file(&path).is_err());

        std::fs::write(&path, r#"{ "cache": { "retention_days": 3 } }"#).unwrap();
        assert_eq!(
            UndertowConfig::from_json_file(&path).unwrap().cache.retention_days,
            3
        );
    }

    #[test]
    fn test_swarm_config_mirrors_network_and_privacy() {
        let mut config = UndertowConfig::default();
        config.network.max_peers_per_torrent = 12;
        config.privacy.encryption = EncryptionPolicy::Required;

        let swarm = config.swarm_config();
        assert_eq!(swarm.max_peers, 12);
        assert_eq!(swarm.encryption, EncryptionPolicy::Required);
        assert_eq!(swarm.connect_timeout, config.network.peer_connect_timeout);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("UNDERTOW_DOWNLOAD_LIMIT_KBPS", "250");
            std::env::set_var("UNDERTOW_MAX_PEERS", "80");
            std::env::set_var("UNDERTOW_ENCRYPTION", "required");
            std::env::set_var("UNDERTOW_PROXY", "socks5://127.0.0.1:9050");
            std::env::set_var("UNDERTOW_RETENTION_DAYS", "not-a-number");
            std::env::set_var("UNDERTOW_TRACKERS", "http://a/announce, http://b/announce");
        }

        let config = UndertowConfig::from_env();

        assert_eq!(config.bandwidth.download_limit_kbps, 250);
        assert_eq!(config.network.max_peers_per_torrent, 80);
        assert_eq!(config.privacy.encryption, EncryptionPolicy::Required);
        assert_eq!(
            config.privacy.proxy,
            Some(ProxyConfig {
                host: "127.0.0.1".to_string(),
                port: 9050
            })
        );
        assert_eq!(config.cache.retention_days, 7);
        assert_eq!(
            config.discovery.trackers,
            vec!["http://a/announce".to_string(), "http://b/announce".to_string()]
        );

        unsafe {
            std::env::set_var("UNDERTOW_PROXY", "http://127.0.0.1:8080");
        }
        assert!(UndertowConfig::from_env().validate().is_err());

        // Cleanup
        unsafe {
            std::env::remove_var("UNDERTOW_DOWNLOAD_LIMIT_KBPS");
            std::env::remove_var("UNDERTOW_MAX_PEERS");
            std::env::remove_var("UNDERTOW_ENCRYPTION");
            std::env::remove_var("UNDERTOW_PROXY");
            std::env::remove_var("UNDERTOW_RETENTION_DAYS");
            std::env::remove_var("UNDERTOW_TRACKERS");
        }
    }
}
