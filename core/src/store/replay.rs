// Replay Guard: TTL-bounded record of sent message fingerprints
//
// A fingerprint is reserved atomically when a submission is admitted and only
// becomes a durable "sent" record once the dispatch is confirmed. A failed
// dispatch releases the reservation so the same message can be retried.
//
// If the store cannot be consulted the guard admits the submission: the
// anonymous channel staying usable outranks replay protection.

use crate::config::ReplayConfig;
use crate::store::backend::{SledStorage, StorageBackend, UnavailableStorage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// Bytes of the body that take part in the fingerprint
pub const FINGERPRINT_BODY_PREFIX: usize = 100;

const KEY_PREFIX: &[u8] = b"fp:";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Replay store error: {0}")]
    Storage(String),
}

/// Deterministic digest identifying one logical message
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageFingerprint([u8; 32]);

impl MessageFingerprint {
    /// SHA-256 over recipient, sender, subject and the start of the body.
    ///
    /// Anything past the first `FINGERPRINT_BODY_PREFIX` bytes of the body,
    /// and surrounding whitespace on the header fields, does not change it.
    pub fn compute(recipient: &str, sender: &str, subject: &str, body: &[u8]) -> Self {
        let prefix = &body[..body.len().min(FINGERPRINT_BODY_PREFIX)];

        let mut hasher = Sha256::new();
        hasher.update(recipient.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(sender.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(subject.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(prefix);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn storage_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(KEY_PREFIX.len() + 32);
        key.extend_from_slice(KEY_PREFIX);
        key.extend_from_slice(&self.0);
        key
    }
}

// Never print the digest itself
impl fmt::Debug for MessageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MessageFingerprint(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum RecordState {
    /// Admitted, dispatch in flight
    Pending,
    /// Dispatch confirmed
    Sent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplayRecord {
    recorded_at: u64,
    state: RecordState,
}

/// Proof that a submission was admitted. Hand it back through
/// [`ReplayGuard::confirm`] or [`ReplayGuard::release`].
#[must_use]
#[derive(Debug)]
pub struct Reservation {
    fingerprint: MessageFingerprint,
    /// Admitted without consulting the store
    degraded: bool,
}

impl Reservation {
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

#[derive(Debug)]
pub enum ReplayCheck {
    Fresh(Reservation),
    Replay,
}

impl ReplayCheck {
    pub fn is_fresh(&self) -> bool {
        matches!(self, ReplayCheck::Fresh(_))
    }
}

pub struct ReplayGuard {
    storage: Arc<dyn StorageBackend>,
    ttl_secs: u64,
    lease_secs: u64,
}

impl ReplayGuard {
    pub fn new(storage: Arc<dyn StorageBackend>, ttl_secs: u64, lease_secs: u64) -> Self {
        Self {
            storage,
            ttl_secs,
            lease_secs,
        }
    }

    /// Open the sled-backed guard. An unopenable store yields a guard that
    /// admits everything.
    pub fn open(config: &ReplayConfig) -> Self {
        let storage: Arc<dyn StorageBackend> = match SledStorage::open(&config.db_path) {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                warn!("Replay cache could not be opened, running without it: {}", e);
                Arc::new(UnavailableStorage::new(e))
            }
        };
        Self::new(storage, config.ttl_secs, config.reservation_lease_secs)
    }

    pub fn check_and_reserve(&self, fingerprint: MessageFingerprint) -> ReplayCheck {
        self.check_and_reserve_at(fingerprint, now_secs())
    }

    /// Purge expired records, then atomically reserve the fingerprint.
    ///
    /// A second caller with the same fingerprint sees `Replay` until the
    /// reservation is released or expires.
    pub fn check_and_reserve_at(&self, fingerprint: MessageFingerprint, now: u64) -> ReplayCheck {
        if let Err(e) = self.purge_expired(now) {
            debug!("Replay purge skipped: {}", e);
        }

        let record = ReplayRecord {
            recorded_at: now,
            state: RecordState::Pending,
        };
        let value = match bincode::serialize(&record) {
            Ok(value) => value,
            Err(_) => return ReplayCheck::Fresh(Self::degraded(fingerprint)),
        };

        match self
            .storage
            .insert_if_absent(&fingerprint.storage_key(), &value)
        {
            Ok(true) => ReplayCheck::Fresh(Reservation {
                fingerprint,
                degraded: false,
            }),
            Ok(false) => ReplayCheck::Replay,
            Err(e) => {
                warn!("Replay cache unavailable, admitting submission: {}", e);
                ReplayCheck::Fresh(Self::degraded(fingerprint))
            }
        }
    }

    pub fn confirm(&self, reservation: Reservation) {
        self.confirm_at(reservation, now_secs())
    }

    /// Record the fingerprint as sent at `now`
    pub fn confirm_at(&self, reservation: Reservation, now: u64) {
        let record = ReplayRecord {
            recorded_at: now,
            state: RecordState::Sent,
        };
        let result = bincode::serialize(&record)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                self.storage
                    .put(&reservation.fingerprint.storage_key(), &value)
            })
            .and_then(|_| self.storage.flush());

        if let Err(e) = result {
            warn!("Replay cache write failed: {}", e);
        }
    }

    /// Drop a reservation after a failed dispatch so the message stays retryable
    pub fn release(&self, reservation: Reservation) {
        if reservation.degraded {
            return;
        }
        if let Err(e) = self.storage.remove(&reservation.fingerprint.storage_key()) {
            warn!("Replay reservation release failed: {}", e);
        }
    }

    /// Remove sent records older than the TTL and reservations older than the lease
    pub fn purge_expired(&self, now: u64) -> Result<usize, ReplayError> {
        let entries = self
            .storage
            .scan_prefix(KEY_PREFIX)
            .map_err(ReplayError::Storage)?;

        let mut removed = 0;
        for (key, value) in entries {
            let expired = match bincode::deserialize::<ReplayRecord>(&value) {
                Ok(record) => {
                    let age = now.saturating_sub(record.recorded_at);
                    match record.state {
                        RecordState::Sent => age >= self.ttl_secs,
                        RecordState::Pending => age >= self.lease_secs,
                    }
                }
                Err(_) => true,
            };
            if expired {
                self.storage.remove(&key).map_err(ReplayError::Storage)?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Purged {} replay records", removed);
        }
        Ok(removed)
    }

    fn degraded(fingerprint: MessageFingerprint) -> Reservation {
        Reservation {
            fingerprint,
            degraded: true,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
