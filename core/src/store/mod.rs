// Store module: replay cache and transient message files

pub mod backend;
pub mod replay;
pub mod scratch;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, UnavailableStorage};
pub use replay::{MessageFingerprint, ReplayCheck, ReplayError, ReplayGuard, Reservation};
pub use scratch::{ScratchError, ScratchHandle, ScratchStore, WriteKind, WriteObserver};
