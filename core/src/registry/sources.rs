//! Which lists exist and where each one comes from

use crate::config::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// The two documents the registry maintains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListKind {
    /// Remailer capability/statistics list (`mlist.txt`)
    Stats,
    /// Public keyring (`pubring.mix`)
    Keyring,
}

impl ListKind {
    pub const ALL: [ListKind; 2] = [ListKind::Stats, ListKind::Keyring];

    /// Backup category name
    pub fn category(&self) -> &'static str {
        match self {
            ListKind::Stats => "remailers",
            ListKind::Keyring => "pubring",
        }
    }

    pub fn destination<'a>(&self, config: &'a RegistryConfig) -> &'a Path {
        match self {
            ListKind::Stats => &config.stats_path,
            ListKind::Keyring => &config.keyring_path,
        }
    }

    /// Ordered source URLs, highest priority first
    pub fn sources(&self, config: &RegistryConfig) -> Vec<String> {
        match self {
            ListKind::Stats => config.stats_sources.clone(),
            ListKind::Keyring if !config.keyring_sources.is_empty() => {
                config.keyring_sources.clone()
            }
            ListKind::Keyring => config
                .stats_sources
                .iter()
                .filter_map(|url| keyring_url_for(url))
                .collect(),
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKind::Stats => write!(f, "stats"),
            ListKind::Keyring => write!(f, "keyring"),
        }
    }
}

/// Keyring URL published next to a stats list (`.../mlist2.txt` -> `.../pubring.mix`)
pub fn keyring_url_for(stats_url: &str) -> Option<String> {
    ["mlist2.txt", "mlist.txt"].iter().find_map(|suffix| {
        stats_url
            .strip_suffix(suffix)
            .map(|base| format!("{}pubring.mix", base))
    })
}
