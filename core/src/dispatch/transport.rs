//! Relay transport: the external mix client behind two operations
//!
//! `enqueue` hands a message file to the client's pool with a chain and copy
//! count; `flush` asks it to send the pool. Both report an exit status and
//! whatever the client printed. Proxy settings are passed per invocation
//! through the child's environment, never through our own.

use crate::config::{DispatchConfig, ProxyConfig};
use crate::dispatch::chain::ResolvedChain;
use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Missing executable, configuration, or proxy wrapper. Not retried.
    #[error("Relay transport unavailable: {0}")]
    Unavailable(String),
    #[error("Relay transport I/O error: {0}")]
    Io(#[from] io::Error),
    /// The client did not exit in time and was killed
    #[error("Relay transport timed out after {0:?}")]
    TimedOut(Duration),
}

/// How a relay invocation reaches the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRoute {
    Tor { host: String, port: u16 },
    Direct,
}

impl ProxyRoute {
    pub fn tor(proxy: &ProxyConfig) -> Self {
        ProxyRoute::Tor {
            host: proxy.host.clone(),
            port: proxy.port,
        }
    }

    pub fn is_proxied(&self) -> bool {
        matches!(self, ProxyRoute::Tor { .. })
    }
}

/// Exit status and captured output of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatus {
    pub code: i32,
    pub output: Option<String>,
}

impl TransportStatus {
    pub fn success() -> Self {
        Self {
            code: 0,
            output: None,
        }
    }

    pub fn failed(code: i32) -> Self {
        Self { code, output: None }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Fatal prerequisites; an error here means nothing else is attempted
    async fn preflight(&self, route: &ProxyRoute) -> Result<(), TransportError>;

    async fn enqueue(
        &self,
        chain: &ResolvedChain,
        copies: u8,
        message: &Path,
        route: &ProxyRoute,
    ) -> Result<TransportStatus, TransportError>;

    async fn flush(&self, route: &ProxyRoute) -> Result<TransportStatus, TransportError>;
}

/// YAMN client, optionally wrapped in torsocks
pub struct YamnTransport {
    yamn_path: PathBuf,
    yamn_config: PathBuf,
    torsocks_path: PathBuf,
    timeout: Duration,
}

impl YamnTransport {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            yamn_path: config.yamn_path.clone(),
            yamn_config: config.yamn_config.clone(),
            torsocks_path: config.torsocks_path.clone(),
            timeout: Duration::from_secs(config.relay_timeout_secs),
        }
    }

    fn command(&self, route: &ProxyRoute) -> Command {
        let mut cmd = match route {
            ProxyRoute::Tor { host, port } => {
                let mut cmd = Command::new(&self.torsocks_path);
                cmd.arg(&self.yamn_path)
                    .env("TORSOCKS_TOR_ADDRESS", host)
                    .env("TORSOCKS_TOR_PORT", port.to_string());
                cmd
            }
            ProxyRoute::Direct => Command::new(&self.yamn_path),
        };
        let mut config_arg = std::ffi::OsString::from("--config=");
        config_arg.push(&self.yamn_config);
        cmd.arg(config_arg)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<TransportStatus, TransportError> {
        // Dropping the output future on expiry kills the child
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| TransportError::TimedOut(self.timeout))??;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(TransportStatus {
            code: output.status.code().unwrap_or(-1),
            output: if text.trim().is_empty() { None } else { Some(text) },
        })
    }
}

#[async_trait]
impl RelayTransport for YamnTransport {
    async fn preflight(&self, route: &ProxyRoute) -> Result<(), TransportError> {
        if !is_executable(&self.yamn_path) {
            return Err(TransportError::Unavailable("relay executable not found".into()));
        }
        if !self.yamn_config.is_file() {
            return Err(TransportError::Unavailable(
                "relay configuration not found".into(),
            ));
        }
        if route.is_proxied() && locate_executable(&self.torsocks_path).is_none() {
            return Err(TransportError::Unavailable("proxy wrapper not found".into()));
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        chain: &ResolvedChain,
        copies: u8,
        message: &Path,
        route: &ProxyRoute,
    ) -> Result<TransportStatus, TransportError> {
        let mut cmd = self.command(route);
        cmd.arg("--mail")
            .arg(format!("--chain={}", chain.to_arg()))
            .arg(format!("--copies={}", copies))
            .stdin(Stdio::from(File::open(message)?));
        let status = self.run(cmd).await?;
        debug!("Enqueue exited with {}", status.code);
        Ok(status)
    }

    async fn flush(&self, route: &ProxyRoute) -> Result<TransportStatus, TransportError> {
        let mut cmd = self.command(route);
        cmd.arg("-S").stdin(Stdio::null());
        let status = self.run(cmd).await?;
        debug!("Flush exited with {}", status.code);
        Ok(status)
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolve a bare program name against `PATH`; paths are checked directly
pub fn locate_executable(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_executable(program).then(|| program.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn transport(dir: &Path, torsocks: &str) -> YamnTransport {
        YamnTransport::new(&DispatchConfig {
            yamn_path: dir.join("yamn"),
            yamn_config: dir.join("yamn.yml"),
            torsocks_path: PathBuf::from(torsocks),
            ..DispatchConfig::default()
        })
    }

    #[cfg(unix)]
    fn make_executable(path: &Path, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, script).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_preflight_missing_executable() {
        let dir = tempdir().unwrap();
        let err = transport(dir.path(), "torsocks")
            .preflight(&ProxyRoute::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));
        assert!(!err.to_string().contains(dir.path().to_str().unwrap()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_preflight_missing_config() {
        let dir = tempdir().unwrap();
        make_executable(&dir.path().join("yamn"), "#!/bin/sh\nexit 0\n");
        let err = transport(dir.path(), "torsocks")
            .preflight(&ProxyRoute::Direct)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("configuration"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_preflight_requires_wrapper_only_when_proxied() {
        let dir = tempdir().unwrap();
        make_executable(&dir.path().join("yamn"), "#!/bin/sh\nexit 0\n");
        fs::write(dir.path().join("yamn.yml"), "").unwrap();
        let t = transport(dir.path(), "/nonexistent/torsocks");

        assert!(t.preflight(&ProxyRoute::Direct).await.is_ok());
        let tor = ProxyRoute::tor(&ProxyConfig::default());
        assert!(matches!(
            t.preflight(&tor).await,
            Err(TransportError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_enqueue_passes_chain_and_stdin() {
        let dir = tempdir().unwrap();
        let seen = dir.path().join("seen");
        make_executable(
            &dir.path().join("yamn"),
            &format!(
                "#!/bin/sh\necho \"$@\" > {}\ncat >> {}\nexit 0\n",
                seen.display(),
                seen.display()
            ),
        );
        fs::write(dir.path().join("yamn.yml"), "").unwrap();
        let message = dir.path().join("msg");
        fs::write(&message, "hello pool").unwrap();

        let pool = crate::registry::RemailerPool::from_entries(
            ["alpha 0 :10 + 99.0%", "bravo 0 :10 + 99.0% D", "charlie 0 :10 + 99.0%"]
                .iter()
                .filter_map(|l| crate::registry::RemailerEntry::parse_line(l)),
        );
        let chain = crate::dispatch::chain::ChainSpec::parse("alpha,bravo,charlie")
            .unwrap()
            .resolve(&pool)
            .unwrap();

        let status = transport(dir.path(), "torsocks")
            .enqueue(&chain, 2, &message, &ProxyRoute::Direct)
            .await
            .unwrap();
        assert!(status.is_success());

        let recorded = fs::read_to_string(&seen).unwrap();
        assert!(recorded.contains("--mail"));
        assert!(recorded.contains("--chain=alpha,bravo,charlie"));
        assert!(recorded.contains("--copies=2"));
        assert!(recorded.contains("hello pool"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_flush_reports_exit_code() {
        let dir = tempdir().unwrap();
        make_executable(&dir.path().join("yamn"), "#!/bin/sh\necho pool error >&2\nexit 3\n");
        fs::write(dir.path().join("yamn.yml"), "").unwrap();

        let status = transport(dir.path(), "torsocks")
            .flush(&ProxyRoute::Direct)
            .await
            .unwrap();
        assert_eq!(status.code, 3);
        assert!(!status.is_success());
        assert_eq!(status.output.as_deref().map(str::trim), Some("pool error"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_client_times_out() {
        let dir = tempdir().unwrap();
        make_executable(&dir.path().join("yamn"), "#!/bin/sh\nsleep 30\nexit 0\n");
        fs::write(dir.path().join("yamn.yml"), "").unwrap();
        let t = YamnTransport::new(&DispatchConfig {
            yamn_path: dir.path().join("yamn"),
            yamn_config: dir.path().join("yamn.yml"),
            relay_timeout_secs: 1,
            ..DispatchConfig::default()
        });

        let started = std::time::Instant::now();
        let err = t.flush(&ProxyRoute::Direct).await.unwrap_err();
        assert!(matches!(err, TransportError::TimedOut(d) if d == Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_locate_executable_on_path() {
        assert!(locate_executable(Path::new("definitely-not-a-real-binary-xyz")).is_none());
        #[cfg(unix)]
        assert!(locate_executable(Path::new("sh")).is_some());
    }
}
