//! Bounded backup history per list category
//!
//! Backups live next to each other in one directory. Order comes from a JSON
//! manifest rather than file names or timestamps, so two snapshots taken in
//! the same second still sort correctly.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub file_name: String,
    pub created_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: VecDeque<BackupEntry>,
}

/// Ordered backups of one category, oldest first
pub struct BackupSet {
    dir: PathBuf,
    category: String,
    retention: usize,
    entries: VecDeque<BackupEntry>,
}

impl BackupSet {
    /// Load the manifest for `category`, dropping entries whose file is gone
    pub fn load(dir: &Path, category: &str, retention: usize) -> io::Result<Self> {
        ensure_private_dir(dir)?;
        let manifest_path = manifest_path(dir, category);

        let manifest = match fs::read(&manifest_path) {
            Ok(bytes) => serde_json::from_slice::<Manifest>(&bytes).unwrap_or_else(|e| {
                warn!("Backup manifest for {} unreadable, starting fresh: {}", category, e);
                Manifest::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Manifest::default(),
            Err(e) => return Err(e),
        };

        let entries = manifest
            .entries
            .into_iter()
            .filter(|entry| dir.join(&entry.file_name).is_file())
            .collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            category: category.to_string(),
            retention,
            entries,
        })
    }

    /// Copy `source` into the set if it exists and prune down to the
    /// retention limit. Returns the new entry.
    pub fn snapshot(&mut self, source: &Path) -> io::Result<Option<BackupEntry>> {
        let content = match fs::read(source) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let now = Utc::now();
        let suffix: u16 = rand::thread_rng().gen();
        let entry = BackupEntry {
            file_name: format!(
                "{}_{}_{:04x}.bak",
                self.category,
                now.format("%Y%m%d_%H%M%S"),
                suffix
            ),
            created_at: now.timestamp(),
        };

        write_private_atomic(&self.dir.join(&entry.file_name), &content)?;
        self.entries.push_back(entry.clone());
        self.save()?;
        debug!("Backed up {} ({} bytes)", self.category, content.len());
        self.prune()?;
        Ok(Some(entry))
    }

    pub fn latest(&self) -> Option<&BackupEntry> {
        self.entries.back()
    }

    pub fn entries(&self) -> impl Iterator<Item = &BackupEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path_of(&self, entry: &BackupEntry) -> PathBuf {
        self.dir.join(&entry.file_name)
    }

    /// Drop the oldest backups beyond the retention limit. The newest one
    /// always stays.
    pub fn prune(&mut self) -> io::Result<usize> {
        let keep = self.retention.max(1);
        let mut removed = 0;
        while self.entries.len() > keep {
            if let Some(oldest) = self.entries.pop_front() {
                match fs::remove_file(self.dir.join(&oldest.file_name)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                removed += 1;
            }
        }
        if removed > 0 {
            self.save()?;
            debug!("Pruned {} old {} backups", removed, self.category);
        }
        Ok(removed)
    }

    /// Put `entry` back at `dest`, unless `dest` already holds the same bytes
    pub fn restore(&self, entry: &BackupEntry, dest: &Path) -> io::Result<bool> {
        let backup = fs::read(self.path_of(entry))?;
        match fs::read(dest) {
            Ok(current) if current == backup => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        write_private_atomic(dest, &backup)?;
        Ok(true)
    }

    fn save(&self) -> io::Result<()> {
        let manifest = Manifest {
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_private_atomic(&manifest_path(&self.dir, &self.category), &bytes)
    }
}

fn manifest_path(dir: &Path, category: &str) -> PathBuf {
    dir.join(format!("{}.manifest.json", category))
}

/// Create `dir` (and parents) readable only by the owner
pub(crate) fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Write via a sibling temp file and rename, so readers never see a partial file
pub(crate) fn write_private_atomic(dest: &Path, content: &[u8]) -> io::Result<()> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
    }
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}
