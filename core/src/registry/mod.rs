//! Source Registry: acquisition of the remailer stats list and public keyring
//!
//! A refresh only ever replaces an accepted file with content that passed
//! validation, written atomically. When every source fails, the destination is
//! put back to the snapshot taken at the start of that same attempt.

pub mod backup;
pub mod fetch;
pub mod remailers;
pub mod sources;
pub mod validate;

pub use backup::{BackupEntry, BackupSet};
pub use fetch::{FetchError, ProxiedFetcher, SourceFetcher};
pub use remailers::{
    parse_remailer_list, LatencyClass, RemailerEntry, RemailerPool, MIDDLEMAN_FLAG,
};
pub use sources::{keyring_url_for, ListKind};
pub use validate::{validate_keyring, validate_stats, ContentError, KeyringReport};

use crate::anonymity::AnonymityGate;
use crate::config::RegistryConfig;
use chrono::{DateTime, Local};
use rand::Rng;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Anonymity proxy unavailable")]
    ProxyUnavailable,
    #[error("All {0} sources failed")]
    SourceExhausted(ListKind),
    #[error("No accepted {0} available")]
    NotAvailable(ListKind),
    #[error("Registry I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What a successful `refresh` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Destination is younger than this attempt's staleness threshold
    UpToDate,
    Replaced { source: String, bytes: usize },
}

/// Snapshot of one accepted file
#[derive(Debug, Clone)]
pub struct ListStatus {
    pub kind: ListKind,
    pub exists: bool,
    pub size_bytes: u64,
    pub age_hours: Option<f64>,
    pub last_modified: Option<String>,
}

pub struct SourceRegistry {
    config: RegistryConfig,
    gate: Arc<dyn AnonymityGate>,
    fetcher: Arc<dyn SourceFetcher>,
    stats_lock: Mutex<()>,
    keyring_lock: Mutex<()>,
}

impl SourceRegistry {
    pub fn new(
        config: RegistryConfig,
        gate: Arc<dyn AnonymityGate>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        Self {
            config,
            gate,
            fetcher,
            stats_lock: Mutex::new(()),
            keyring_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Refresh `kind` if its file is older than a freshly drawn threshold
    pub async fn refresh(&self, kind: ListKind) -> Result<RefreshOutcome, RegistryError> {
        self.refresh_inner(kind, false).await
    }

    /// Refresh `kind` regardless of age
    pub async fn force_refresh(&self, kind: ListKind) -> Result<RefreshOutcome, RegistryError> {
        self.refresh_inner(kind, true).await
    }

    async fn refresh_inner(
        &self,
        kind: ListKind,
        force: bool,
    ) -> Result<RefreshOutcome, RegistryError> {
        let _guard = match kind {
            ListKind::Stats => self.stats_lock.lock().await,
            ListKind::Keyring => self.keyring_lock.lock().await,
        };
        let dest = kind.destination(&self.config);

        if !force && !self.is_stale(dest) {
            debug!("{} list is fresh, skipping refresh", kind);
            return Ok(RefreshOutcome::UpToDate);
        }

        self.config.pre_refresh_delay.sleep().await;

        if !self.gate.is_proxy_functional().await {
            error!("Refusing to fetch {} list without a working anonymity proxy", kind);
            return Err(RegistryError::ProxyUnavailable);
        }

        let mut backups = BackupSet::load(
            &self.config.backup_dir,
            kind.category(),
            self.config.backup_retention,
        )?;
        let snapshot = backups.snapshot(dest)?;

        for url in kind.sources(&self.config) {
            self.config.source_delay.sleep().await;

            let content = match self.fetcher.fetch(&url).await {
                Ok(content) => content,
                Err(e) => {
                    warn!("Fetch of {} failed: {}", url, e);
                    continue;
                }
            };

            if let Err(e) = validate_content(kind, &content) {
                warn!("Rejected {} list from {}: {}", kind, url, e);
                continue;
            }

            if let Err(e) = backup::write_private_atomic(dest, &content) {
                error!("Could not store {} list: {}", kind, e);
                self.rollback(&backups, snapshot.as_ref(), dest);
                return Err(e.into());
            }

            info!("Updated {} list from {} ({} bytes)", kind, url, content.len());
            return Ok(RefreshOutcome::Replaced {
                source: url,
                bytes: content.len(),
            });
        }

        error!("All {} sources failed", kind);
        self.rollback(&backups, snapshot.as_ref(), dest);
        Err(RegistryError::SourceExhausted(kind))
    }

    fn rollback(&self, backups: &BackupSet, snapshot: Option<&BackupEntry>, dest: &Path) {
        let Some(entry) = snapshot else {
            return;
        };
        match backups.restore(entry, dest) {
            Ok(true) => info!("Restored previous {} from backup", dest.display()),
            Ok(false) => debug!("Destination unchanged, nothing to restore"),
            Err(e) => error!("Rollback failed: {}", e),
        }
    }

    /// Stale when missing, or older than a threshold drawn anew on every call
    fn is_stale(&self, dest: &Path) -> bool {
        let age = match file_age(dest) {
            Some(age) => age,
            None => return true,
        };
        let min = self.config.min_refresh_hours * 3600;
        let max = self.config.max_refresh_hours.max(self.config.min_refresh_hours) * 3600;
        let threshold = rand::thread_rng().gen_range(min..=max);
        age.as_secs() > threshold
    }

    pub fn status(&self, kind: ListKind) -> ListStatus {
        let dest = kind.destination(&self.config);
        match fs::metadata(dest) {
            Ok(meta) => {
                let modified = meta.modified().ok();
                ListStatus {
                    kind,
                    exists: true,
                    size_bytes: meta.len(),
                    age_hours: file_age(dest).map(|age| age.as_secs_f64() / 3600.0),
                    last_modified: modified.map(|t| {
                        DateTime::<Local>::from(t)
                            .format("%Y-%m-%d %H:%M:%S")
                            .to_string()
                    }),
                }
            }
            Err(_) => ListStatus {
                kind,
                exists: false,
                size_bytes: 0,
                age_hours: None,
                last_modified: None,
            },
        }
    }

    /// Accepted stats list, fetched first if none exists yet
    pub async fn remailer_list(&self) -> Result<Vec<u8>, RegistryError> {
        self.read_or_fetch(ListKind::Stats).await
    }

    /// Accepted keyring, fetched first if none exists yet
    pub async fn keyring(&self) -> Result<Vec<u8>, RegistryError> {
        self.read_or_fetch(ListKind::Keyring).await
    }

    pub async fn remailer_pool(&self) -> Result<RemailerPool, RegistryError> {
        let list = self.remailer_list().await?;
        Ok(RemailerPool::parse(&list))
    }

    async fn read_or_fetch(&self, kind: ListKind) -> Result<Vec<u8>, RegistryError> {
        let dest = kind.destination(&self.config);
        if !dest.exists() {
            if let Err(e) = self.refresh(kind).await {
                warn!("Initial {} fetch failed: {}", kind, e);
            }
        }
        match fs::read(dest) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RegistryError::NotAvailable(kind)),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_content(kind: ListKind, content: &[u8]) -> Result<(), ContentError> {
    match kind {
        ListKind::Stats => validate_stats(content),
        ListKind::Keyring => validate_keyring(content).map(|report| {
            debug!(
                "Keyring accepted: {} bytes, {} key blocks, binary={}",
                report.bytes, report.key_blocks, report.binary
            );
        }),
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}
