//! Tor control port client, limited to requesting fresh circuits
//!
//! Speaks just enough of the control protocol to authenticate (null or
//! password auth) and send `SIGNAL NEWNYM`. Every reply must start with 250.

use crate::config::ProxyConfig;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;
use zeroize::Zeroizing;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control port unreachable: {0}")]
    Connect(#[source] std::io::Error),
    #[error("Control port I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Control port rejected {step}: {reply}")]
    Rejected { step: &'static str, reply: String },
    #[error("Control port did not answer in time")]
    TimedOut,
}

pub struct TorControl {
    endpoint: String,
    password: Option<String>,
    timeout: Duration,
}

impl TorControl {
    pub fn new(proxy: &ProxyConfig) -> Self {
        Self {
            endpoint: proxy.control_endpoint(),
            password: proxy.control_password.clone(),
            timeout: CONTROL_TIMEOUT,
        }
    }

    /// Ask the daemon to build new circuits for subsequent connections
    pub async fn new_identity(&self) -> Result<(), ControlError> {
        tokio::time::timeout(self.timeout, self.signal_newnym())
            .await
            .map_err(|_| ControlError::TimedOut)?
    }

    async fn signal_newnym(&self) -> Result<(), ControlError> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(ControlError::Connect)?;
        let (read, mut write) = stream.into_split();
        let mut replies = BufReader::new(read);

        let auth = Zeroizing::new(match &self.password {
            Some(password) => format!("AUTHENTICATE {}\r\n", quote(password)),
            None => "AUTHENTICATE\r\n".to_string(),
        });
        write.write_all(auth.as_bytes()).await?;
        expect_ok(&mut replies, "authentication").await?;

        write.write_all(b"SIGNAL NEWNYM\r\n").await?;
        expect_ok(&mut replies, "NEWNYM").await?;

        // Best effort; the daemon closes the connection either way
        if write.write_all(b"QUIT\r\n").await.is_ok() {
            let _ = expect_ok(&mut replies, "QUIT").await;
        }
        debug!("Requested new Tor circuits");
        Ok(())
    }
}

async fn expect_ok(
    replies: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    step: &'static str,
) -> Result<(), ControlError> {
    let mut line = String::new();
    replies.read_line(&mut line).await?;
    if line.starts_with("250") {
        Ok(())
    } else {
        Err(ControlError::Rejected {
            step,
            reply: line.trim_end().to_string(),
        })
    }
}

/// Control protocol QuotedString
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
