// Configuration management for the mixgate CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/mixgate/config.json
// - Linux: ~/.config/mixgate/config.json
// - Windows: %APPDATA%\mixgate\config.json

use anyhow::{Context, Result};
use mixgate_core::config::GatewayConfig;
use mixgate_core::TorPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for cache, backups, replay store and scratch pool.
    /// Unset means the platform data directory.
    pub data_path: Option<PathBuf>,

    /// Where refreshed keyrings are installed. Unset means beside the
    /// relay client's config file, which is where the client reads it.
    pub keyring_path: Option<PathBuf>,

    /// Everything the gateway itself reads
    pub gateway: GatewayConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("mixgate");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("mixgate");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;

        if config_file.exists() {
            let contents =
                std::fs::read_to_string(&config_file).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_file = Self::config_file()?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Gateway config with every data path rooted in the data directory
    pub fn resolved(&self) -> Result<GatewayConfig> {
        let data_dir = match &self.data_path {
            Some(path) => {
                std::fs::create_dir_all(path).context("Failed to create data directory")?;
                path.clone()
            }
            None => Self::data_dir()?,
        };
        let mut gateway = self.gateway.clone().with_data_dir(&data_dir);
        gateway.registry.keyring_path = match &self.keyring_path {
            Some(path) => path.clone(),
            None => gateway.dispatch.client_keyring_path(),
        };
        if gateway.logging.directory.is_none() {
            gateway.logging.directory = Some(data_dir.join("logs"));
        }
        Ok(gateway)
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.gateway
            .validate()
            .context("Value rejected by configuration check")?;
        self.save()?;
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let gw = &mut self.gateway;
        match key {
            "data_path" => {
                self.data_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "keyring_path" => {
                self.keyring_path = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "proxy_host" => gw.proxy.host = value.to_string(),
            "proxy_port" => gw.proxy.port = value.parse().context("Invalid port number")?,
            "verify_url" => gw.proxy.verify_url = value.to_string(),
            "control_port" => {
                gw.proxy.control_port = value.parse().context("Invalid port number")?
            }
            "control_password" => {
                gw.proxy.control_password = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "tor_policy" => gw.proxy.policy = parse_policy(value)?,
            "stats_sources" => gw.registry.stats_sources = split_list(value),
            "keyring_sources" => gw.registry.keyring_sources = split_list(value),
            "min_refresh_hours" => {
                gw.registry.min_refresh_hours = value.parse().context("Invalid number of hours")?
            }
            "max_refresh_hours" => {
                gw.registry.max_refresh_hours = value.parse().context("Invalid number of hours")?
            }
            "backup_retention" => {
                gw.registry.backup_retention = value.parse().context("Invalid retention count")?
            }
            "replay_ttl_secs" => {
                gw.replay.ttl_secs = value.parse().context("Invalid number of seconds")?
            }
            "yamn_path" => gw.dispatch.yamn_path = PathBuf::from(value),
            "yamn_config" => gw.dispatch.yamn_config = PathBuf::from(value),
            "torsocks_path" => gw.dispatch.torsocks_path = PathBuf::from(value),
            "relay_timeout_secs" => {
                gw.dispatch.relay_timeout_secs =
                    value.parse().context("Invalid number of seconds")?
            }
            "log_outcomes" => {
                gw.dispatch.log_outcomes = value.parse().context("Invalid boolean value")?
            }
            "logging_enabled" => {
                gw.logging.enabled = value.parse().context("Invalid boolean value")?
            }
            "logging_directory" => {
                gw.logging.directory = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let gw = &self.gateway;
        let path_or_auto = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(auto)".to_string())
        };
        vec![
            ("data_path".to_string(), path_or_auto(&self.data_path)),
            ("keyring_path".to_string(), path_or_auto(&self.keyring_path)),
            ("proxy_host".to_string(), gw.proxy.host.clone()),
            ("proxy_port".to_string(), gw.proxy.port.to_string()),
            ("verify_url".to_string(), gw.proxy.verify_url.clone()),
            ("control_port".to_string(), gw.proxy.control_port.to_string()),
            (
                "control_password".to_string(),
                if gw.proxy.control_password.is_some() { "(set)" } else { "(none)" }.to_string(),
            ),
            ("tor_policy".to_string(), policy_name(gw.proxy.policy).to_string()),
            ("stats_sources".to_string(), gw.registry.stats_sources.join(",")),
            ("keyring_sources".to_string(), gw.registry.keyring_sources.join(",")),
            ("min_refresh_hours".to_string(), gw.registry.min_refresh_hours.to_string()),
            ("max_refresh_hours".to_string(), gw.registry.max_refresh_hours.to_string()),
            ("backup_retention".to_string(), gw.registry.backup_retention.to_string()),
            ("replay_ttl_secs".to_string(), gw.replay.ttl_secs.to_string()),
            ("yamn_path".to_string(), gw.dispatch.yamn_path.display().to_string()),
            ("yamn_config".to_string(), gw.dispatch.yamn_config.display().to_string()),
            ("torsocks_path".to_string(), gw.dispatch.torsocks_path.display().to_string()),
            ("relay_timeout_secs".to_string(), gw.dispatch.relay_timeout_secs.to_string()),
            ("log_outcomes".to_string(), gw.dispatch.log_outcomes.to_string()),
            ("logging_enabled".to_string(), gw.logging.enabled.to_string()),
            ("logging_directory".to_string(), path_or_auto(&gw.logging.directory)),
        ]
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_policy(value: &str) -> Result<TorPolicy> {
    match value {
        "mandatory" => Ok(TorPolicy::Mandatory),
        "onion-only" => Ok(TorPolicy::OnionRecipientsOnly),
        _ => anyhow::bail!("Invalid tor_policy (expected mandatory or onion-only)"),
    }
}

fn policy_name(policy: TorPolicy) -> &'static str {
    match policy {
        TorPolicy::Mandatory => "mandatory",
        TorPolicy::OnionRecipientsOnly => "onion-only",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.data_path.is_none());
        assert_eq!(config.gateway.proxy.port, 9050);
        assert_eq!(config.get("tor_policy").as_deref(), Some("mandatory"));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.gateway.proxy.host, deserialized.gateway.proxy.host);
        assert_eq!(
            config.gateway.registry.stats_sources,
            deserialized.gateway.registry.stats_sources
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"gateway":{"proxy":{"port":9150}}}"#).unwrap();
        assert_eq!(config.gateway.proxy.port, 9150);
        assert_eq!(config.gateway.proxy.host, "127.0.0.1");
        assert_eq!(config.gateway.registry.backup_retention, 10);
    }

    #[test]
    fn test_apply_known_and_unknown_keys() {
        let mut config = Config::default();
        config.apply("tor_policy", "onion-only").unwrap();
        config.apply("stats_sources", "https://a.example/mlist.txt, https://b.example/mlist2.txt").unwrap();
        assert_eq!(config.gateway.proxy.policy, TorPolicy::OnionRecipientsOnly);
        assert_eq!(config.gateway.registry.stats_sources.len(), 2);
        assert!(config.apply("proxy_port", "not-a-port").is_err());
        assert!(config.apply("listen_port", "1").is_err());
    }

    #[test]
    fn test_control_password_is_not_listed() {
        let mut config = Config::default();
        config.apply("control_port", "9151").unwrap();
        config.apply("control_password", "hunter2").unwrap();
        assert_eq!(config.gateway.proxy.control_port, 9151);
        assert_eq!(config.gateway.proxy.control_password.as_deref(), Some("hunter2"));
        assert_eq!(config.get("control_password").as_deref(), Some("(set)"));
        assert!(config.list().iter().all(|(_, v)| !v.contains("hunter2")));
    }

    #[test]
    fn test_resolved_roots_paths_in_data_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_path: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let gateway = config.resolved().unwrap();
        assert!(gateway.registry.stats_path.starts_with(dir.path()));
        assert!(gateway.scratch.dir.starts_with(dir.path()));
        assert_eq!(gateway.logging.directory, Some(dir.path().join("logs")));
    }

    #[test]
    fn test_keyring_lands_beside_relay_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            data_path: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        config.apply("yamn_config", "/srv/yamn/yamn.yml").unwrap();
        let gateway = config.resolved().unwrap();
        assert_eq!(
            gateway.registry.keyring_path,
            PathBuf::from("/srv/yamn/pubring.mix")
        );
        assert!(!gateway.registry.keyring_path.starts_with(dir.path()));

        config.apply("keyring_path", "/etc/mix/keys.mix").unwrap();
        let gateway = config.resolved().unwrap();
        assert_eq!(gateway.registry.keyring_path, PathBuf::from("/etc/mix/keys.mix"));
        assert_eq!(config.get("keyring_path").as_deref(), Some("/etc/mix/keys.mix"));

        config.apply("keyring_path", "").unwrap();
        assert!(config.keyring_path.is_none());
    }
}
