// Privacy: size and timing normalization
//
// Bucketed padding against size correlation, random pauses against
// timing correlation.

pub mod padding;
pub mod timing;

pub use padding::{PaddingEngine, PaddingError, DEFAULT_BUCKETS, PADDING_SEPARATOR};
pub use timing::{DelayRange, DispatchDelays, JitterError};
