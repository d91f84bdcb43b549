// Submission fields, their validation, and message assembly
//
// This is the boundary with the caller. Error strings returned from here are
// fixed and name only the field, never its value.

use crate::dispatch::{ChainSpec, MAX_COPIES, MIN_COPIES};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use zeroize::{Zeroize, Zeroizing};

pub const DEFAULT_COPIES: u32 = 1;

/// Raw field values as handed over by the caller
#[derive(Clone, Default, Serialize, Deserialize, Zeroize)]
#[serde(default)]
pub struct SubmissionFields {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub entry_remailer: String,
    pub middle_remailer: String,
    pub exit_remailer: String,
    pub reply_to: Option<String>,
    pub newsgroups: Option<String>,
    pub references: Option<String>,
    pub body: String,
    pub copies: Option<u32>,
}

impl fmt::Debug for SubmissionFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionFields")
            .field("body_len", &self.body.len())
            .field("copies", &self.copies)
            .finish_non_exhaustive()
    }
}

/// What validation yields besides "no errors"
#[derive(Debug, Clone)]
pub struct ValidatedSubmission {
    pub chain: ChainSpec,
    pub copies: u8,
}

fn email_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$").ok()
    })
    .as_ref()
}

pub fn is_valid_email(addr: &str) -> bool {
    addr.len() <= 254 && email_pattern().map_or(false, |re| re.is_match(addr))
}

fn has_line_break(value: &str) -> bool {
    value.contains('\r') || value.contains('\n')
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl SubmissionFields {
    pub fn copies(&self) -> u32 {
        self.copies.unwrap_or(DEFAULT_COPIES)
    }

    /// Check every field, collecting all problems
    pub fn validate(&self) -> Result<ValidatedSubmission, Vec<String>> {
        let mut errors = Vec::new();

        let required = [
            ("To", &self.to),
            ("From", &self.from),
            ("Subject", &self.subject),
            ("Entry remailer", &self.entry_remailer),
            ("Middle remailer", &self.middle_remailer),
            ("Exit remailer", &self.exit_remailer),
        ];
        for (label, value) in required {
            if value.trim().is_empty() {
                errors.push(format!("{} is required", label));
            }
        }

        let copies = self.copies();
        if !(MIN_COPIES as u32..=MAX_COPIES as u32).contains(&copies) {
            errors.push("Number of copies must be between 1 and 3".to_string());
        }

        if !self.to.trim().is_empty() && !is_valid_email(self.to.trim()) {
            errors.push("Invalid recipient email address".to_string());
        }
        if !self.from.trim().is_empty() && !is_valid_email(self.from.trim()) {
            errors.push("Invalid sender email address".to_string());
        }
        if let Some(reply_to) = non_empty(&self.reply_to) {
            if !is_valid_email(reply_to) {
                errors.push("Invalid reply-to email address".to_string());
            }
        }

        let headers = [
            Some(self.to.as_str()),
            Some(self.from.as_str()),
            Some(self.subject.as_str()),
            self.reply_to.as_deref(),
            self.newsgroups.as_deref(),
            self.references.as_deref(),
        ];
        if headers.into_iter().flatten().any(has_line_break) {
            errors.push("Header fields must not contain line breaks".to_string());
        }

        let chain = ChainSpec::from_hops(
            &self.entry_remailer,
            &self.middle_remailer,
            &self.exit_remailer,
        );
        let hops_present = required[3..].iter().all(|(_, v)| !v.trim().is_empty());
        if hops_present && chain.is_err() {
            errors.push("Invalid remailer chain".to_string());
        }

        match chain {
            Ok(chain) if errors.is_empty() => Ok(ValidatedSubmission {
                chain,
                copies: copies as u8,
            }),
            _ => Err(errors),
        }
    }
}

/// Plain-text message handed to the relay client. No client-identifying
/// headers are added.
pub fn build_message(fields: &SubmissionFields) -> Zeroizing<Vec<u8>> {
    let mut msg = String::with_capacity(256 + fields.body.len());
    msg.push_str("Content-Type: text/plain; charset=utf-8\n");
    msg.push_str("Content-Transfer-Encoding: 8bit\n");
    msg.push_str("MIME-Version: 1.0\n");
    if let Some(references) = non_empty(&fields.references) {
        msg.push_str(&format!("References: {}\n", references));
    }
    msg.push_str(&format!("From: {}\n", fields.from.trim()));
    if let Some(reply_to) = non_empty(&fields.reply_to) {
        msg.push_str(&format!("Reply-To: {}\n", reply_to));
    }
    msg.push_str(&format!("To: {}\n", fields.to.trim()));
    msg.push_str(&format!("Subject: {}\n", fields.subject.trim()));
    if let Some(newsgroups) = non_empty(&fields.newsgroups) {
        msg.push_str(&format!("Newsgroups: {}\n", newsgroups));
    }
    msg.push('\n');
    msg.push_str(&fields.body);

    let bytes = Zeroizing::new(msg.as_bytes().to_vec());
    msg.zeroize();
    bytes
}
