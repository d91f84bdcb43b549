//! HTTP client bound to the anonymity proxy
//!
//! Every outbound request the gateway makes goes through an agent built here:
//! SOCKS5 with proxy-side name resolution, TLS verification on, no redirects,
//! and a browser-like header set so list fetches blend in.

use crate::config::ProxyConfig;
use rand::seq::SliceRandom;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:109.0) Gecko/20100101 Firefox/115.0",
];

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid proxy configuration: {0}")]
    Proxy(String),
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Response body exceeds {0} bytes")]
    TooLarge(u64),
    #[error("Failed to read response body: {0}")]
    Body(#[from] std::io::Error),
}

/// Blocking HTTP agent that can only talk through the proxy
#[derive(Clone)]
pub struct ProxiedHttp {
    agent: ureq::Agent,
    max_body_bytes: u64,
}

impl ProxiedHttp {
    pub fn new(
        proxy: &ProxyConfig,
        connect_timeout: Duration,
        timeout: Duration,
        max_body_bytes: u64,
    ) -> Result<Self, HttpError> {
        let socks = ureq::Proxy::new(proxy.socks_url()).map_err(|e| HttpError::Proxy(e.to_string()))?;
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        let agent = ureq::AgentBuilder::new()
            .proxy(socks)
            .timeout_connect(connect_timeout)
            .timeout(timeout)
            .redirects(0)
            .user_agent(user_agent)
            .build();

        Ok(Self {
            agent,
            max_body_bytes,
        })
    }

    /// GET `url`, requiring HTTP 200, returning at most `max_body_bytes`
    pub fn get(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        let response = self
            .agent
            .get(url)
            .set("Accept", "text/plain,*/*")
            .set("Accept-Language", "en-US,en;q=0.9")
            .set("DNT", "1")
            .set("Connection", "close")
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(code, _) => HttpError::Status(code),
                ureq::Error::Transport(t) => HttpError::Transport(t.to_string()),
            })?;

        if response.status() != 200 {
            return Err(HttpError::Status(response.status()));
        }

        let mut body = Vec::new();
        response
            .into_reader()
            .take(self.max_body_bytes + 1)
            .read_to_end(&mut body)?;
        if body.len() as u64 > self.max_body_bytes {
            return Err(HttpError::TooLarge(self.max_body_bytes));
        }
        Ok(body)
    }
}
