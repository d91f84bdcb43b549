// Message Padding: Traffic analysis resistance via bucketed message sizes
//
// Pads outgoing messages up to one of a fixed ladder of sizes so that an
// observer of the mix network only ever sees a handful of distinct lengths.

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

/// Default bucket ladder (bytes)
pub const DEFAULT_BUCKETS: &[usize] = &[512, 1024, 2048, 4096, 8192, 16384, 32768];

/// Visible marker placed between the message and its filler
pub const PADDING_SEPARATOR: &[u8] = b"\n\n--- Padding ---\n";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaddingError {
    #[error("Padding bucket list is empty")]
    EmptyBuckets,
    #[error("Padding bucket sizes must be non-zero")]
    ZeroBucket,
    #[error("Padding bucket sizes must be strictly ascending")]
    UnorderedBuckets,
}

/// Validate a bucket ladder
pub fn validate_buckets(buckets: &[usize]) -> Result<(), PaddingError> {
    if buckets.is_empty() {
        return Err(PaddingError::EmptyBuckets);
    }
    if buckets.contains(&0) {
        return Err(PaddingError::ZeroBucket);
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(PaddingError::UnorderedBuckets);
    }
    Ok(())
}

/// Size normalizer for outgoing messages
#[derive(Debug, Clone)]
pub struct PaddingEngine {
    buckets: Vec<usize>,
}

impl PaddingEngine {
    /// Create an engine over an ascending bucket ladder
    pub fn new(buckets: Vec<usize>) -> Result<Self, PaddingError> {
        validate_buckets(&buckets)?;
        Ok(Self { buckets })
    }

    pub fn buckets(&self) -> &[usize] {
        &self.buckets
    }

    /// Length a message of `len` bytes is padded to.
    ///
    /// The smallest bucket that fits, or the next multiple of the largest
    /// bucket when the message outgrows the ladder.
    pub fn padded_len(&self, len: usize) -> usize {
        if let Some(&bucket) = self.buckets.iter().find(|&&size| size >= len) {
            return bucket;
        }
        let largest = self.buckets[self.buckets.len() - 1];
        len.div_ceil(largest) * largest
    }

    /// Pad a message to its bucket.
    ///
    /// Padding format: `[message][separator][random alphanumeric filler]`.
    /// The filler differs on every call; the output length never does.
    pub fn pad(&self, message: &[u8]) -> Vec<u8> {
        let target = self.padded_len(message.len());
        let gap = target - message.len();

        let mut padded = Vec::with_capacity(target);
        padded.extend_from_slice(message);
        if gap == 0 {
            return padded;
        }

        // Gaps shorter than the separator get a truncated marker
        let marker_len = gap.min(PADDING_SEPARATOR.len());
        padded.extend_from_slice(&PADDING_SEPARATOR[..marker_len]);
        padded.extend(random_filler(gap - marker_len));

        debug_assert_eq!(padded.len(), target);
        padded
    }
}

impl Default for PaddingEngine {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS.to_vec(),
        }
    }
}

/// Printable filler drawn from the OS CSPRNG
fn random_filler(len: usize) -> impl Iterator<Item = u8> {
    rand::rngs::OsRng.sample_iter(Alphanumeric).take(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_message_goes_to_first_bucket() {
        let engine = PaddingEngine::default();
        let padded = engine.pad(b"hello");
        assert_eq!(padded.len(), 512);
        assert!(padded.starts_with(b"hello"));
        assert_eq!(&padded[5..5 + PADDING_SEPARATOR.len()], PADDING_SEPARATOR);
    }

    #[test]
    fn test_exact_bucket_is_not_grown() {
        let engine = PaddingEngine::default();
        let msg = vec![b'a'; 1024];
        assert_eq!(engine.pad(&msg), msg);
    }

    #[test]
    fn test_round_up_to_next_bucket() {
        let engine = PaddingEngine::default();
        assert_eq!(engine.padded_len(513), 1024);
        assert_eq!(engine.padded_len(4097), 8192);
        assert_eq!(engine.padded_len(0), 512);
    }

    #[test]
    fn test_oversized_message_uses_multiple_of_largest() {
        let engine = PaddingEngine::default();
        assert_eq!(engine.padded_len(32769), 65536);
        assert_eq!(engine.padded_len(65536), 65536);
        assert_eq!(engine.padded_len(100_000), 131072);
        assert_eq!(engine.pad(&vec![b'x'; 40_000]).len(), 65536);
    }

    #[test]
    fn test_gap_smaller_than_separator() {
        let engine = PaddingEngine::new(vec![16]).unwrap();
        let padded = engine.pad(b"0123456789abc");
        assert_eq!(padded.len(), 16);
        assert_eq!(&padded[13..], &PADDING_SEPARATOR[..3]);
    }

    #[test]
    fn test_filler_is_printable() {
        let engine = PaddingEngine::default();
        let padded = engine.pad(b"body");
        let filler = &padded[4 + PADDING_SEPARATOR.len()..];
        assert!(!filler.is_empty());
        assert!(filler.iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_filler_varies_between_calls() {
        let engine = PaddingEngine::default();
        let a = engine.pad(b"same input");
        let b = engine.pad(b"same input");
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_bucket_lists() {
        assert_eq!(
            PaddingEngine::new(vec![]).unwrap_err(),
            PaddingError::EmptyBuckets
        );
        assert_eq!(
            PaddingEngine::new(vec![0, 512]).unwrap_err(),
            PaddingError::ZeroBucket
        );
        assert_eq!(
            PaddingEngine::new(vec![1024, 512]).unwrap_err(),
            PaddingError::UnorderedBuckets
        );
        assert_eq!(
            PaddingEngine::new(vec![512, 512]).unwrap_err(),
            PaddingError::UnorderedBuckets
        );
    }

    #[test]
    fn test_default_buckets_ascending() {
        assert!(validate_buckets(DEFAULT_BUCKETS).is_ok());
    }

    proptest! {
        #[test]
        fn prop_padded_length_depends_only_on_input_length(
            a in proptest::collection::vec(any::<u8>(), 0..70_000),
            fill in any::<u8>(),
        ) {
            let engine = PaddingEngine::default();
            let b = vec![fill; a.len()];
            let first = engine.pad(&a).len();
            prop_assert_eq!(first, engine.pad(&a).len());
            prop_assert_eq!(first, engine.pad(&b).len());
            prop_assert_eq!(first, engine.padded_len(a.len()));
            prop_assert!(first >= a.len());
        }
    }
}
