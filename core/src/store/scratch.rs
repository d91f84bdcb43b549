// Secure Scratch Store: transient files holding one padded message
//
// Files get a random name, owner-only permissions at creation time and an
// exclusive advisory lock while written. Wiping overwrites the full extent with random
// bytes for a fixed number of passes, then zeros, then unlinks.

use crate::config::ScratchConfig;
use fs2::FileExt;
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

const WIPE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("Scratch file I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// What a write to a scratch file was for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Content,
    RandomPass,
    ZeroPass,
}

/// Hook notified after every completed write to a scratch file
pub trait WriteObserver: Send + Sync {
    fn on_write(&self, path: &Path, kind: WriteKind, bytes: u64);
}

#[derive(Clone)]
struct WipePolicy {
    random_passes: u32,
    observer: Option<Arc<dyn WriteObserver>>,
}

impl WipePolicy {
    fn notify(&self, path: &Path, kind: WriteKind, bytes: u64) {
        if let Some(observer) = &self.observer {
            observer.on_write(path, kind, bytes);
        }
    }
}

pub struct ScratchStore {
    dir: PathBuf,
    policy: WipePolicy,
}

impl ScratchStore {
    /// Open (and create, owner-only) the scratch directory
    pub fn new(dir: impl Into<PathBuf>, random_passes: u32) -> Result<Self, ScratchError> {
        let dir = dir.into();
        create_private_dir(&dir)?;
        Ok(Self {
            dir,
            policy: WipePolicy {
                random_passes,
                observer: None,
            },
        })
    }

    pub fn from_config(config: &ScratchConfig) -> Result<Self, ScratchError> {
        Self::new(&config.dir, config.random_passes)
    }

    pub fn with_observer(mut self, observer: Arc<dyn WriteObserver>) -> Self {
        self.policy.observer = Some(observer);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `content` to a fresh scratch file
    pub fn create(&self, content: &[u8]) -> Result<ScratchHandle, ScratchError> {
        let mut name = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut name);
        let path = self.dir.join(format!("{}.tmp", hex::encode(name)));

        let mut file = open_private_new(&path)?;
        // From here on the handle owns the path; any early return wipes it
        let handle = ScratchHandle {
            path,
            len: content.len() as u64,
            policy: self.policy.clone(),
            wiped: false,
        };

        lock_exclusive(&file)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);
        handle
            .policy
            .notify(&handle.path, WriteKind::Content, content.len() as u64);

        Ok(handle)
    }

    /// Overwrite and remove a scratch file
    pub fn wipe(&self, mut handle: ScratchHandle) -> Result<(), ScratchError> {
        handle.wipe_now()
    }
}

/// Exclusive owner of one scratch file.
///
/// Dropping an unwiped handle wipes it, so the file cannot outlive the
/// dispatch even on an unexpected exit path.
pub struct ScratchHandle {
    path: PathBuf,
    len: u64,
    policy: WipePolicy,
    wiped: bool,
}

impl ScratchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn wipe_now(&mut self) -> Result<(), ScratchError> {
        if self.wiped {
            return Ok(());
        }

        let extent = match fs::metadata(&self.path) {
            Ok(meta) => meta.len().max(self.len),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Nothing left to overwrite
                self.wiped = true;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        // Unlink only after a full overwrite so a retry still finds the file
        overwrite_extent(&self.path, extent, &self.policy)?;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        self.wiped = true;
        Ok(())
    }
}

impl Drop for ScratchHandle {
    fn drop(&mut self) {
        if !self.wiped {
            if let Err(e) = self.wipe_now() {
                warn!("Scratch wipe on drop failed: {}", e);
                if let Err(e) = fs::remove_file(&self.path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!("Scratch unlink on drop failed: {}", e);
                    }
                }
            }
        }
    }
}

fn overwrite_extent(path: &Path, extent: u64, policy: &WipePolicy) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    lock_exclusive(&file)?;

    let mut buf = vec![0u8; WIPE_CHUNK.min(extent as usize).max(1)];
    for _ in 0..policy.random_passes {
        write_pass(&mut file, extent, &mut buf, true)?;
        policy.notify(path, WriteKind::RandomPass, extent);
    }
    write_pass(&mut file, extent, &mut buf, false)?;
    policy.notify(path, WriteKind::ZeroPass, extent);
    Ok(())
}

fn write_pass(file: &mut File, extent: u64, buf: &mut [u8], random: bool) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut remaining = extent;
    while remaining > 0 {
        let n = (remaining as usize).min(buf.len());
        if random {
            rand::rngs::OsRng.fill_bytes(&mut buf[..n]);
        } else {
            buf[..n].fill(0);
        }
        file.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    file.sync_data()
}

#[cfg(unix)]
fn open_private_new(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
    if !dir.exists() {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

/// Blocks until no other handle holds the file; released when it is closed
fn lock_exclusive(file: &File) -> io::Result<()> {
    FileExt::lock_exclusive(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every write and a snapshot of the file right after it
    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(WriteKind, u64, Vec<u8>)>>,
    }

    impl WriteObserver for Recorder {
        fn on_write(&self, path: &Path, kind: WriteKind, bytes: u64) {
            let snapshot = fs::read(path).unwrap_or_default();
            self.writes.lock().push((kind, bytes, snapshot));
        }
    }

    #[test]
    fn test_create_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path().join("pool"), 3).unwrap();
        let handle = store.create(b"padded message").unwrap();
        assert_eq!(fs::read(handle.path()).unwrap(), b"padded message");
        assert_eq!(handle.len(), 14);

        let name = handle.path().file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 64 + ".tmp".len());
        store.wipe(handle).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path().join("pool"), 3).unwrap();
        let handle = store.create(b"x").unwrap();

        let file_mode = fs::metadata(handle.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        store.wipe(handle).unwrap();
    }

    #[test]
    fn test_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path(), 1).unwrap();
        let a = store.create(b"a").unwrap();
        let b = store.create(b"a").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_wipe_pass_sequence_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = ScratchStore::new(dir.path(), 3)
            .unwrap()
            .with_observer(recorder.clone());

        let content = b"attack at dawn, attack at dawn, attack at dawn".to_vec();
        let handle = store.create(&content).unwrap();
        let path = handle.path().to_path_buf();
        store.wipe(handle).unwrap();

        assert!(!path.exists());

        let writes = recorder.writes.lock();
        let kinds: Vec<WriteKind> = writes.iter().map(|w| w.0).collect();
        assert_eq!(
            kinds,
            vec![
                WriteKind::Content,
                WriteKind::RandomPass,
                WriteKind::RandomPass,
                WriteKind::RandomPass,
                WriteKind::ZeroPass,
            ]
        );

        let wipe_bytes: u64 = writes
            .iter()
            .filter(|w| w.0 != WriteKind::Content)
            .map(|w| w.1)
            .sum();
        assert!(wipe_bytes >= 4 * content.len() as u64);

        for (kind, _, snapshot) in writes.iter().skip(1) {
            assert_eq!(snapshot.len(), content.len());
            assert_ne!(snapshot, &content);
            if *kind == WriteKind::ZeroPass {
                assert!(snapshot.iter().all(|&b| b == 0));
            }
        }
    }

    #[test]
    fn test_drop_wipes_unwiped_handle() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = ScratchStore::new(dir.path(), 3)
            .unwrap()
            .with_observer(recorder.clone());
        let path = {
            let handle = store.create(b"left behind").unwrap();
            handle.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(recorder.writes.lock().len(), 5);
    }

    #[test]
    fn test_wipe_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path(), 3).unwrap();
        let handle = store.create(b"gone").unwrap();
        fs::remove_file(handle.path()).unwrap();
        assert!(store.wipe(handle).is_err());
    }

    #[test]
    fn test_failed_wipe_is_retried_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = ScratchStore::new(dir.path(), 2)
            .unwrap()
            .with_observer(recorder.clone());
        let mut handle = store.create(b"secret body").unwrap();
        let path = handle.path().to_path_buf();

        // A directory in its place makes the overwrite fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        assert!(handle.wipe_now().is_err());
        assert!(!handle.wiped);

        fs::remove_dir(&path).unwrap();
        fs::write(&path, b"secret body").unwrap();
        drop(handle);

        assert!(!path.exists());
        let kinds: Vec<WriteKind> = recorder.writes.lock().iter().map(|w| w.0).collect();
        assert_eq!(
            kinds,
            vec![
                WriteKind::Content,
                WriteKind::RandomPass,
                WriteKind::RandomPass,
                WriteKind::ZeroPass,
            ]
        );
    }

    #[test]
    fn test_file_is_locked_while_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path(), 1).unwrap();
        let handle = store.create(b"locked").unwrap();

        let holder = OpenOptions::new().write(true).open(handle.path()).unwrap();
        lock_exclusive(&holder).unwrap();
        let other = OpenOptions::new().write(true).open(handle.path()).unwrap();
        assert!(FileExt::try_lock_exclusive(&other).is_err());

        FileExt::unlock(&holder).unwrap();
        assert!(FileExt::try_lock_exclusive(&other).is_ok());
        drop(other);
        drop(holder);
        store.wipe(handle).unwrap();
    }

    #[test]
    fn test_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(dir.path(), 3).unwrap();
        let handle = store.create(b"").unwrap();
        assert!(handle.is_empty());
        let path = handle.path().to_path_buf();
        store.wipe(handle).unwrap();
        assert!(!path.exists());
    }
}
