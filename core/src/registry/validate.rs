//! Shape heuristics for downloaded lists
//!
//! Content is never parsed for meaning here, only checked to look like what a
//! pinger publishes. Anything that fails never replaces the accepted copy.

use regex::bytes::RegexSet;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

pub const MIN_STATS_BYTES: usize = 100;
pub const MIN_KEYRING_BYTES: usize = 1000;
/// Stats markers that must be present
pub const MIN_STATS_MARKERS: usize = 2;
/// Below this many key blocks the keyring is accepted with a warning
pub const EXPECTED_MIN_KEYS: usize = 3;

const KEY_MARKERS: &[&[u8]] = &[b"remailer-key", b"BEGIN PGP", b"-----BEGIN"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("content too small: {0} bytes")]
    TooSmall(usize),
    #[error("only {0} remailer list markers found")]
    MissingMarkers(usize),
    #[error("no key markers found and content is not binary")]
    NoKeyMarkers,
}

/// What was learned about an accepted keyring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyringReport {
    pub bytes: usize,
    pub key_blocks: usize,
    pub binary: bool,
}

fn stats_markers() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"(?i)mixmaster",
            r"(?i)history",
            r"(?i)latency",
            r"(?i)uptime",
            r"\*{3,}",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

fn armored_markers() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([r"(?i)BEGIN PGP", r"(?i)-----BEGIN", r"(?i)remailer-key"])
            .unwrap_or_else(|_| RegexSet::empty())
    })
}

/// Remailer stats list: minimum size plus at least two list markers
pub fn validate_stats(content: &[u8]) -> Result<(), ContentError> {
    if content.len() < MIN_STATS_BYTES {
        return Err(ContentError::TooSmall(content.len()));
    }
    let found = stats_markers().matches(content).iter().count();
    if found < MIN_STATS_MARKERS {
        return Err(ContentError::MissingMarkers(found));
    }
    Ok(())
}

/// Public keyring: minimum size plus key markers, or an opaque binary blob
pub fn validate_keyring(content: &[u8]) -> Result<KeyringReport, ContentError> {
    if content.len() < MIN_KEYRING_BYTES {
        return Err(ContentError::TooSmall(content.len()));
    }

    let binary = looks_binary(content);
    let has_markers = armored_markers().is_match(content);
    if !has_markers && !binary {
        return Err(ContentError::NoKeyMarkers);
    }

    let key_blocks: usize = KEY_MARKERS
        .iter()
        .map(|marker| count_occurrences(content, marker))
        .sum();
    if key_blocks > 0 && key_blocks < EXPECTED_MIN_KEYS {
        warn!("Keyring has only {} key blocks", key_blocks);
    }

    Ok(KeyringReport {
        bytes: content.len(),
        key_blocks,
        binary,
    })
}

/// Anything outside printable ASCII and common whitespace
fn looks_binary(content: &[u8]) -> bool {
    content
        .iter()
        .any(|&b| b >= 0x80 || (b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t')))
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    if needle.is_empty() || haystack.len() < needle.len() {
        return 0;
    }
    haystack.windows(needle.len()).filter(|w| w == &needle).count()
}
