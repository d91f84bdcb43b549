//! Anonymity Gate: is the proxy alive and actually routing through Tor?
//!
//! A listening SOCKS port is not enough: the gate makes a full round-trip to
//! the verification endpoint and requires an explicit `"IsTor": true`.
//! Nothing is cached; the proxy daemon can die between two submissions.

use crate::anonymity::client::ProxiedHttp;
use crate::config::ProxyConfig;
use crate::dispatch::locate_executable;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

const SOCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_VERIFY_BODY: u64 = 64 * 1024;

#[async_trait]
pub trait AnonymityGate: Send + Sync {
    /// Live check, performed on every call
    async fn is_proxy_functional(&self) -> bool;
}

#[derive(Deserialize)]
struct TorCheckResponse {
    #[serde(rename = "IsTor")]
    is_tor: bool,
}

/// True only for a JSON body whose `IsTor` field is boolean `true`
pub fn response_asserts_tor(body: &[u8]) -> bool {
    serde_json::from_slice::<TorCheckResponse>(body)
        .map(|r| r.is_tor)
        .unwrap_or(false)
}

/// Result of each connectivity check, for operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityReport {
    /// The SOCKS port accepts TCP connections
    pub socks_reachable: bool,
    /// The verification endpoint reported `IsTor: true` through the proxy
    pub tor_routed: bool,
    /// The wrapper that routes the relay client through the proxy is installed
    pub wrapper_installed: bool,
}

impl ConnectivityReport {
    pub fn is_available(&self) -> bool {
        self.socks_reachable && self.tor_routed && self.wrapper_installed
    }
}

/// Gate backed by a local SOCKS proxy and a Tor check endpoint
pub struct TorCheckGate {
    proxy: ProxyConfig,
}

impl TorCheckGate {
    pub fn new(proxy: ProxyConfig) -> Self {
        Self { proxy }
    }

    async fn socket_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(SOCKET_PROBE_TIMEOUT, TcpStream::connect(self.proxy.endpoint()))
                .await,
            Ok(Ok(_))
        )
    }

    async fn routed_through_tor(&self) -> bool {
        let proxy = self.proxy.clone();
        tokio::task::spawn_blocking(move || verify_through_proxy(&proxy))
            .await
            .unwrap_or(false)
    }

    /// Run every check independently. The round-trip is skipped when the
    /// SOCKS port is closed.
    pub async fn connectivity(&self, wrapper: &Path) -> ConnectivityReport {
        let socks_reachable = self.socket_reachable().await;
        let tor_routed = socks_reachable && self.routed_through_tor().await;
        ConnectivityReport {
            socks_reachable,
            tor_routed,
            wrapper_installed: locate_executable(wrapper).is_some(),
        }
    }
}

fn verify_through_proxy(proxy: &ProxyConfig) -> bool {
    let timeout = Duration::from_secs(proxy.probe_timeout_secs);
    let client = match ProxiedHttp::new(proxy, timeout, timeout, MAX_VERIFY_BODY) {
        Ok(client) => client,
        Err(e) => {
            warn!("Tor check client could not be built: {}", e);
            return false;
        }
    };
    match client.get(&proxy.verify_url) {
        Ok(body) => response_asserts_tor(&body),
        Err(e) => {
            debug!("Tor check round-trip failed: {}", e);
            false
        }
    }
}

#[async_trait]
impl AnonymityGate for TorCheckGate {
    async fn is_proxy_functional(&self) -> bool {
        if !self.socket_reachable().await {
            warn!("Anonymity proxy is not accepting connections");
            return false;
        }

        let routed = self.routed_through_tor().await;
        if routed {
            debug!("Tor routing verified");
        } else {
            warn!("Anonymity proxy reachable but traffic is not routed through Tor");
        }
        routed
    }
}
