// Gateway configuration
//
// One explicit value threaded into every component. Nothing here is read from
// process environment; proxy settings in particular travel with each call.

use crate::privacy::padding::{validate_buckets, DEFAULT_BUCKETS};
use crate::privacy::timing::{DelayRange, DispatchDelays};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name the relay client expects for its keyring
pub const KEYRING_FILE_NAME: &str = "pubring.mix";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// When traffic must go through the anonymity proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TorPolicy {
    /// Every fetch and every relay invocation is proxied
    Mandatory,
    /// Relay invocations are proxied only for `.onion` recipients.
    /// Remailer list fetches are always proxied.
    OnionRecipientsOnly,
}

impl TorPolicy {
    pub fn requires_proxy_for(&self, recipient: &str) -> bool {
        match self {
            TorPolicy::Mandatory => true,
            TorPolicy::OnionRecipientsOnly => recipient
                .trim()
                .trim_end_matches('>')
                .to_ascii_lowercase()
                .ends_with(".onion"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// SOCKS5 host
    pub host: String,
    /// SOCKS5 port
    pub port: u16,
    /// JSON endpoint answering `{"IsTor": bool, ...}`
    pub verify_url: String,
    /// Timeout for the verification round-trip, in seconds
    pub probe_timeout_secs: u64,
    pub policy: TorPolicy,
    /// Tor control port on `host`, used only to request new circuits
    pub control_port: u16,
    /// Control port password. Unset means null authentication.
    pub control_password: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9050,
            verify_url: "https://check.torproject.org/api/ip".to_string(),
            probe_timeout_secs: 30,
            policy: TorPolicy::Mandatory,
            control_port: 9051,
            control_password: None,
        }
    }
}

impl ProxyConfig {
    /// Proxy URL in the form the HTTP client expects
    pub fn socks_url(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn control_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Remailer stats sources, highest priority first
    pub stats_sources: Vec<String>,
    /// Keyring sources, highest priority first. Empty = derive from `stats_sources`.
    pub keyring_sources: Vec<String>,
    pub stats_path: PathBuf,
    /// Where the refreshed keyring is installed. The relay client reads it
    /// from beside its own config, see [`DispatchConfig::client_keyring_path`].
    pub keyring_path: PathBuf,
    pub backup_dir: PathBuf,
    /// Lower bound of the randomized staleness threshold
    pub min_refresh_hours: u64,
    /// Upper bound of the randomized staleness threshold
    pub max_refresh_hours: u64,
    /// Backups kept per category
    pub backup_retention: usize,
    /// Pause before a refresh begins
    pub pre_refresh_delay: DelayRange,
    /// Pause before each source attempt
    pub source_delay: DelayRange,
    pub connect_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub max_download_bytes: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stats_sources: vec![
                "https://echolot.virebent.art/mlist2.txt".to_string(),
                "http://echolot.theremailer.net/yamn/mlist.txt".to_string(),
                "https://www.mixmin.net/yamn/mlist.txt".to_string(),
                "https://www.haph.org/yamn/mlist.txt".to_string(),
            ],
            keyring_sources: Vec::new(),
            stats_path: PathBuf::from("/opt/yamn-data/cache/remailers.txt"),
            keyring_path: PathBuf::from("/opt/yamn-master").join(KEYRING_FILE_NAME),
            backup_dir: PathBuf::from("/opt/yamn-data/backups"),
            min_refresh_hours: 20,
            max_refresh_hours: 28,
            backup_retention: 10,
            pre_refresh_delay: DelayRange::from_secs(5, 60),
            source_delay: DelayRange::from_secs(3, 20),
            connect_timeout_secs: 60,
            fetch_timeout_secs: 120,
            max_download_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub db_path: PathBuf,
    /// How long a sent fingerprint blocks resubmission
    pub ttl_secs: u64,
    /// How long an unconfirmed reservation survives a crashed worker
    pub reservation_lease_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/opt/yamn-data/cache/replay_cache"),
            ttl_secs: 7 * 24 * 3600,
            reservation_lease_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingConfig {
    pub buckets: Vec<usize>,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    pub dir: PathBuf,
    /// Random overwrite passes before the final zero pass
    pub random_passes: u32,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/opt/yamn-data/pool"),
            random_passes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Mix network client executable
    pub yamn_path: PathBuf,
    /// Its configuration file
    pub yamn_config: PathBuf,
    /// Wrapper that forces the client's sockets through the proxy
    pub torsocks_path: PathBuf,
    pub delays: DispatchDelays,
    /// Record boolean outcome and chain shape after each dispatch
    pub log_outcomes: bool,
    /// Longest a single relay client invocation may run before it is killed
    pub relay_timeout_secs: u64,
}

impl DispatchConfig {
    /// The keyring file the relay client loads, next to its config file
    pub fn client_keyring_path(&self) -> PathBuf {
        self.yamn_config
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(KEYRING_FILE_NAME)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            yamn_path: PathBuf::from("/opt/yamn-master/yamn"),
            yamn_config: PathBuf::from("/opt/yamn-master/yamn.yml"),
            torsocks_path: PathBuf::from("torsocks"),
            delays: DispatchDelays::default(),
            log_outcomes: false,
            relay_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Opt-in file log. Off means no log file is ever created.
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub proxy: ProxyConfig,
    pub registry: RegistryConfig,
    pub replay: ReplayConfig,
    pub padding: PaddingConfig,
    pub scratch: ScratchConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Root every gateway-owned data path under `dir`. The keyring belongs
    /// to the relay client and stays where it is.
    pub fn with_data_dir(mut self, dir: &Path) -> Self {
        self.registry.stats_path = dir.join("cache").join("remailers.txt");
        self.registry.backup_dir = dir.join("backups");
        self.replay.db_path = dir.join("cache").join("replay_cache");
        self.scratch.dir = dir.join("pool");
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.proxy.host.is_empty() || self.proxy.port == 0 {
            return invalid("proxy host and port are required");
        }
        if self.registry.stats_sources.is_empty() {
            return invalid("at least one stats source is required");
        }
        if self.registry.min_refresh_hours > self.registry.max_refresh_hours {
            return invalid("min_refresh_hours must not exceed max_refresh_hours");
        }
        if self.registry.backup_retention == 0 {
            return invalid("backup_retention must be at least 1");
        }
        if self.replay.ttl_secs == 0 {
            return invalid("replay ttl_secs must be greater than 0");
        }
        if self.dispatch.relay_timeout_secs == 0 {
            return invalid("relay_timeout_secs must be greater than 0");
        }
        if self.scratch.random_passes == 0 {
            return invalid("scratch random_passes must be at least 1");
        }
        validate_buckets(&self.padding.buckets)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.registry
            .pre_refresh_delay
            .validate()
            .and_then(|_| self.registry.source_delay.validate())
            .and_then(|_| self.dispatch.delays.validate())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}
