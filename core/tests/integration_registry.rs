// Integration test: Source Registry refresh, fallback, rollback and pruning
//
// Fetches and the proxy check are faked; everything on disk is real.

use async_trait::async_trait;
use mixgate_core::anonymity::AnonymityGate;
use mixgate_core::config::RegistryConfig;
use mixgate_core::privacy::DelayRange;
use mixgate_core::registry::{
    BackupSet, FetchError, ListKind, RefreshOutcome, RegistryError, SourceFetcher,
    SourceRegistry,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct SwitchGate(AtomicBool);

#[async_trait]
impl AnonymityGate for SwitchGate {
    async fn is_proxy_functional(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serves canned bodies per URL and records every request
#[derive(Default)]
struct ScriptedFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().insert(url.to_string(), body);
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl SourceFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.requests.lock().push(url.to_string());
        self.bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Task("connection refused".to_string()))
    }
}

const PRIMARY: &str = "https://primary.example/mlist.txt";
const SECONDARY: &str = "https://secondary.example/mlist.txt";

fn config(dir: &Path) -> RegistryConfig {
    RegistryConfig {
        stats_sources: vec![PRIMARY.to_string(), SECONDARY.to_string()],
        stats_path: dir.join("remailers.txt"),
        keyring_path: dir.join("pubring.mix"),
        backup_dir: dir.join("backups"),
        backup_retention: 3,
        pre_refresh_delay: DelayRange::none(),
        source_delay: DelayRange::none(),
        ..RegistryConfig::default()
    }
}

fn stats(tag: &str) -> Vec<u8> {
    format!(
        "Stats-Version: 2.0\nMixmaster Latent-Hist Latent Uptime-Hist Uptime Options\n\
         ------------------------------------------------------------\n\
         alpha    000000000000   :10  ++++++++++++ 99.9%\n\
         bravo    000000000000   :12  ++++++++++++ 98.0%  D\n\
         charlie  000000000000   :30  ++++++++++++ 97.5%\n\
         \n\
         Remailer-Capabilities: {}\n",
        tag
    )
    .into_bytes()
}

fn keyring() -> Vec<u8> {
    let mut ring = Vec::new();
    for name in ["alpha", "bravo", "charlie"] {
        ring.extend_from_slice(b"-----BEGIN PGP PUBLIC KEY BLOCK-----\n");
        ring.extend_from_slice(format!("Comment: {} remailer-key\n", name).as_bytes());
        ring.extend_from_slice(&[b'Q'; 400]);
        ring.extend_from_slice(b"\n-----END PGP PUBLIC KEY BLOCK-----\n");
    }
    ring
}

fn setup(dir: &Path, up: bool) -> (SourceRegistry, Arc<ScriptedFetcher>, Arc<SwitchGate>) {
    let gate = Arc::new(SwitchGate(AtomicBool::new(up)));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let registry = SourceRegistry::new(config(dir), gate.clone(), fetcher.clone());
    (registry, fetcher, gate)
}

#[tokio::test]
async fn test_primary_wins_and_secondary_is_not_contacted() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);
    fetcher.serve(PRIMARY, stats("primary"));
    fetcher.serve(SECONDARY, stats("secondary"));

    let outcome = registry.refresh(ListKind::Stats).await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Replaced {
            source: PRIMARY.to_string(),
            bytes: stats("primary").len(),
        }
    );
    assert_eq!(fetcher.requests(), vec![PRIMARY.to_string()]);
}

#[tokio::test]
async fn test_falls_back_past_unreachable_and_invalid_sources() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);
    fetcher.serve(SECONDARY, stats("secondary"));

    registry.refresh(ListKind::Stats).await.unwrap();
    assert_eq!(
        fs::read(dir.path().join("remailers.txt")).unwrap(),
        stats("secondary")
    );

    // Primary now answers, but with an error page
    fetcher.serve(PRIMARY, b"<html>502 Bad Gateway</html>".to_vec());
    fetcher.serve(SECONDARY, stats("secondary-2"));
    registry.force_refresh(ListKind::Stats).await.unwrap();
    assert_eq!(
        fs::read(dir.path().join("remailers.txt")).unwrap(),
        stats("secondary-2")
    );
}

#[tokio::test]
async fn test_all_sources_invalid_leaves_file_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);
    let dest = dir.path().join("remailers.txt");
    fs::write(&dest, stats("accepted")).unwrap();
    let before = fs::read(&dest).unwrap();

    fetcher.serve(PRIMARY, b"too short".to_vec());
    fetcher.serve(SECONDARY, vec![b'x'; 4096]);

    let err = registry.force_refresh(ListKind::Stats).await.unwrap_err();
    assert!(matches!(err, RegistryError::SourceExhausted(ListKind::Stats)));
    assert_eq!(fs::read(&dest).unwrap(), before);
    assert_eq!(fetcher.requests().len(), 2);

    // Same again: rollback is idempotent
    registry.force_refresh(ListKind::Stats).await.unwrap_err();
    assert_eq!(fs::read(&dest).unwrap(), before);
}

#[tokio::test]
async fn test_proxy_down_means_no_fetch_at_all() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, gate) = setup(dir.path(), false);
    fetcher.serve(PRIMARY, stats("primary"));

    for kind in ListKind::ALL {
        let err = registry.force_refresh(kind).await.unwrap_err();
        assert!(matches!(err, RegistryError::ProxyUnavailable));
    }
    assert!(fetcher.requests().is_empty());

    // Re-checked on every call
    gate.0.store(true, Ordering::SeqCst);
    registry.force_refresh(ListKind::Stats).await.unwrap();
    assert_eq!(fetcher.requests().len(), 1);
}

#[tokio::test]
async fn test_fresh_list_is_not_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);
    fetcher.serve(PRIMARY, stats("primary"));

    registry.refresh(ListKind::Stats).await.unwrap();
    let outcome = registry.refresh(ListKind::Stats).await.unwrap();
    assert_eq!(outcome, RefreshOutcome::UpToDate);
    assert_eq!(fetcher.requests().len(), 1);
}

#[tokio::test]
async fn test_keyring_uses_derived_urls() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);
    fetcher.serve("https://secondary.example/pubring.mix", keyring());

    let ring = registry.keyring().await.unwrap();
    assert_eq!(ring, keyring());
    assert_eq!(
        fetcher.requests(),
        vec![
            "https://primary.example/pubring.mix".to_string(),
            "https://secondary.example/pubring.mix".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_backups_are_pruned_to_retention() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);

    for i in 0..6 {
        fetcher.serve(PRIMARY, stats(&format!("round-{}", i)));
        registry.force_refresh(ListKind::Stats).await.unwrap();
    }

    // Five refreshes had a previous file to back up; retention is three
    let backups = BackupSet::load(&dir.path().join("backups"), "remailers", 3).unwrap();
    assert_eq!(backups.len(), 3);
    let newest = backups.latest().unwrap();
    assert_eq!(fs::read(backups.path_of(newest)).unwrap(), stats("round-4"));

    let keyring_backups = BackupSet::load(&dir.path().join("backups"), "pubring", 3).unwrap();
    assert!(keyring_backups.is_empty());
}

#[tokio::test]
async fn test_pool_partition_from_accepted_list() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);
    fetcher.serve(PRIMARY, stats("primary"));

    let pool = registry.remailer_pool().await.unwrap();
    assert_eq!(pool.entry_exit_names(), vec!["alpha", "charlie"]);
    assert_eq!(pool.middle_names(), vec!["bravo"]);
}

#[tokio::test]
async fn test_repeated_failed_refreshes_stay_within_retention() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, fetcher, _) = setup(dir.path(), true);
    let dest = dir.path().join("remailers.txt");
    fs::write(&dest, stats("accepted")).unwrap();
    fetcher.serve(PRIMARY, b"<html>maintenance</html>".to_vec());
    fetcher.serve(SECONDARY, b"<html>maintenance</html>".to_vec());

    for _ in 0..12 {
        let err = registry.force_refresh(ListKind::Stats).await.unwrap_err();
        assert!(matches!(err, RegistryError::SourceExhausted(ListKind::Stats)));
    }

    let backups = BackupSet::load(&dir.path().join("backups"), "remailers", 3).unwrap();
    assert_eq!(backups.len(), 3);
    let bak_files = fs::read_dir(dir.path().join("backups"))
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".bak"))
        .count();
    assert_eq!(bak_files, 3);
    assert_eq!(fs::read(&dest).unwrap(), stats("accepted"));
}
