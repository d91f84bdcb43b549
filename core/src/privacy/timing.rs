// Timing Jitter: Resistance to timing correlation attacks
//
// Inserts uniformly random pauses around every externally visible step
// (list fetches, pool enqueue, pool flush) so that the moment a submission
// reaches the network cannot be linked to the moment it was made.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum JitterError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Inclusive range a random delay is drawn from, in milliseconds.
///
/// A `0..=0` range disables the delay entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn from_secs(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_ms: min_secs * 1000,
            max_ms: max_secs * 1000,
        }
    }

    pub const fn none() -> Self {
        Self { min_ms: 0, max_ms: 0 }
    }

    pub fn validate(&self) -> Result<(), JitterError> {
        if self.min_ms > self.max_ms {
            return Err(JitterError::InvalidConfig(
                "min_ms must not exceed max_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_disabled(&self) -> bool {
        self.max_ms == 0
    }

    /// Draw a delay uniformly from the range
    pub fn sample(&self) -> Duration {
        if self.min_ms >= self.max_ms {
            return Duration::from_millis(self.min_ms);
        }
        let ms = rand::thread_rng().gen_range(self.min_ms..=self.max_ms);
        Duration::from_millis(ms)
    }

    /// Sleep for a freshly sampled delay.
    ///
    /// Only the calling task is parked; other submissions keep running.
    pub async fn sleep(&self) {
        if self.is_disabled() {
            return;
        }
        tokio::time::sleep(self.sample()).await;
    }
}

/// The three pauses around a single dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchDelays {
    /// Before the message enters the local pool
    pub pre_submit: DelayRange,
    /// Between pool enqueue and pool flush
    pub inter_step: DelayRange,
    /// After the flush, before the caller learns the outcome
    pub post_send: DelayRange,
}

impl DispatchDelays {
    pub const fn none() -> Self {
        Self {
            pre_submit: DelayRange::none(),
            inter_step: DelayRange::none(),
            post_send: DelayRange::none(),
        }
    }

    pub fn validate(&self) -> Result<(), JitterError> {
        self.pre_submit.validate()?;
        self.inter_step.validate()?;
        self.post_send.validate()
    }
}

impl Default for DispatchDelays {
    fn default() -> Self {
        Self {
            pre_submit: DelayRange::from_secs(5, 30),
            inter_step: DelayRange::from_secs(3, 15),
            post_send: DelayRange::from_secs(2, 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_valid() {
        let delays = DispatchDelays::default();
        assert!(delays.validate().is_ok());
        assert_eq!(delays.pre_submit.min_ms, 5_000);
        assert_eq!(delays.pre_submit.max_ms, 30_000);
        assert_eq!(delays.post_send, DelayRange::from_secs(2, 10));
    }

    #[test]
    fn test_validate_invalid_order() {
        let range = DelayRange {
            min_ms: 100,
            max_ms: 10,
        };
        assert!(range.validate().is_err());

        let delays = DispatchDelays {
            inter_step: range,
            ..DispatchDelays::none()
        };
        assert!(delays.validate().is_err());
    }

    #[test]
    fn test_sample_within_bounds() {
        let range = DelayRange {
            min_ms: 100,
            max_ms: 200,
        };
        for _ in 0..100 {
            let millis = range.sample().as_millis() as u64;
            assert!((100..=200).contains(&millis));
        }
    }

    #[test]
    fn test_sample_equal_bounds() {
        let range = DelayRange {
            min_ms: 75,
            max_ms: 75,
        };
        assert_eq!(range.sample(), Duration::from_millis(75));
    }

    #[test]
    fn test_sample_is_not_constant() {
        let range = DelayRange::from_secs(0, 60);
        let first = range.sample();
        assert!((0..50).any(|_| range.sample() != first));
    }

    #[test]
    fn test_none_is_disabled() {
        assert!(DelayRange::none().is_disabled());
        assert!(!DelayRange::from_secs(1, 2).is_disabled());
        assert_eq!(DelayRange::none().sample(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_disabled_sleep_returns_immediately() {
        let start = std::time::Instant::now();
        DelayRange::none().sleep().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_delay_range_serialization() {
        let range = DelayRange::from_secs(3, 20);
        let json = serde_json::to_string(&range).unwrap();
        let back: DelayRange = serde_json::from_str(&json).unwrap();
        assert_eq!(range, back);
    }
}
