// Remailer list parsing and the entry/exit vs middle partition
//
// Only the data region of a stats list is read: everything up to the first
// line of ten or more hyphens is header, and the region ends at the first
// blank line or legend heading after it.

use std::collections::{BTreeMap, BTreeSet};

/// Capability flag marking a middleman (middle-position only) remailer
pub const MIDDLEMAN_FLAG: char = 'D';

const DELIMITER_MIN_HYPHENS: usize = 10;

/// Coarse latency bucket derived from the latency column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LatencyClass {
    /// Up to 15 minutes
    Fast,
    /// Up to an hour
    Moderate,
    Slow,
    Unknown,
}

impl LatencyClass {
    fn from_minutes(minutes: Option<u32>) -> Self {
        match minutes {
            Some(m) if m <= 15 => LatencyClass::Fast,
            Some(m) if m <= 60 => LatencyClass::Moderate,
            Some(_) => LatencyClass::Slow,
            None => LatencyClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemailerEntry {
    pub name: String,
    pub latency: LatencyClass,
    pub latency_minutes: Option<u32>,
    pub uptime_percent: Option<f32>,
    /// Number of reliability stars, 0 when the column is absent
    pub stars: u8,
    pub capabilities: BTreeSet<char>,
}

impl RemailerEntry {
    pub fn is_middleman(&self) -> bool {
        self.capabilities.contains(&MIDDLEMAN_FLAG)
    }

    /// Parse one data line. Lines that don't start with a valid name, or
    /// whose latency column is garbage, are `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next()?.to_ascii_lowercase();
        if !is_valid_name(&name) {
            return None;
        }

        let mut latency_minutes = None;
        let mut uptime_percent = None;
        let mut stars = 0u8;
        let mut capabilities = BTreeSet::new();

        for token in tokens {
            if let Some(pct) = token.strip_suffix('%') {
                uptime_percent = pct.parse::<f32>().ok();
            } else if token.contains(':') && latency_minutes.is_none() {
                latency_minutes = parse_latency(token)?;
            } else if !token.is_empty() && token.chars().all(|c| c == '*') {
                stars = token.len().min(u8::MAX as usize) as u8;
            } else if uptime_percent.is_some() && token.chars().all(|c| c.is_ascii_uppercase()) {
                capabilities.extend(token.chars());
            }
        }

        Some(Self {
            name,
            latency: LatencyClass::from_minutes(latency_minutes),
            latency_minutes,
            uptime_percent,
            stars,
            capabilities,
        })
    }
}

/// `^[a-z0-9-]+$`, with a little more to keep table headings out
pub fn is_valid_name(name: &str) -> bool {
    name.len() > 2
        && name != "mixmaster"
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// `h:mm`, `:mm` or `h:mm:ss`. `Some(None)` is an unknown (`?`) latency,
/// `None` a token that is not a latency at all or does not fit in minutes.
fn parse_latency(token: &str) -> Option<Option<u32>> {
    if token.contains('?') {
        return Some(None);
    }
    let parts: Vec<&str> = token.split(':').collect();
    let num = |s: &str| -> Option<u32> {
        if s.is_empty() {
            Some(0)
        } else {
            s.parse().ok()
        }
    };
    match parts.as_slice() {
        [h, m] | [h, m, _] => num(h)?.checked_mul(60)?.checked_add(num(m)?).map(Some),
        _ => None,
    }
}

fn is_delimiter(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= DELIMITER_MIN_HYPHENS && trimmed.chars().all(|c| c == '-')
}

fn is_legend(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .map(|t| t.ends_with(':'))
        .unwrap_or(false)
}

/// Entries of a stats list, in document order, first occurrence of a name wins
pub fn parse_remailer_list(content: &[u8]) -> Vec<RemailerEntry> {
    let text = String::from_utf8_lossy(content);
    let mut lines = text.lines();

    if !lines.by_ref().any(is_delimiter) {
        return Vec::new();
    }

    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    for line in lines {
        if line.trim().is_empty() || is_legend(line) {
            break;
        }
        if let Some(entry) = RemailerEntry::parse_line(line) {
            if seen.insert(entry.name.clone()) {
                entries.push(entry);
            }
        }
    }
    entries
}

/// Remailers split into the two disjoint position pools
#[derive(Debug, Clone, Default)]
pub struct RemailerPool {
    entry_exit: BTreeMap<String, RemailerEntry>,
    middle: BTreeMap<String, RemailerEntry>,
}

impl RemailerPool {
    pub fn from_entries(entries: impl IntoIterator<Item = RemailerEntry>) -> Self {
        let mut pool = Self::default();
        for entry in entries {
            if pool.contains(&entry.name) {
                continue;
            }
            if entry.is_middleman() {
                pool.middle.insert(entry.name.clone(), entry);
            } else {
                pool.entry_exit.insert(entry.name.clone(), entry);
            }
        }
        pool
    }

    pub fn parse(content: &[u8]) -> Self {
        Self::from_entries(parse_remailer_list(content))
    }

    /// Sorted names eligible for entry and exit
    pub fn entry_exit_names(&self) -> Vec<&str> {
        self.entry_exit.keys().map(String::as_str).collect()
    }

    /// Sorted names eligible for the middle hop
    pub fn middle_names(&self) -> Vec<&str> {
        self.middle.keys().map(String::as_str).collect()
    }

    pub fn is_entry_exit(&self, name: &str) -> bool {
        self.entry_exit.contains_key(name)
    }

    pub fn is_middle(&self, name: &str) -> bool {
        self.middle.contains_key(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.is_entry_exit(name) || self.is_middle(name)
    }

    pub fn get(&self, name: &str) -> Option<&RemailerEntry> {
        self.entry_exit.get(name).or_else(|| self.middle.get(name))
    }

    pub fn len(&self) -> usize {
        self.entry_exit.len() + self.middle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries sorted by name
    pub fn entries(&self) -> Vec<&RemailerEntry> {
        let mut all: Vec<&RemailerEntry> =
            self.entry_exit.values().chain(self.middle.values()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
