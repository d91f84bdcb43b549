// Dispatch: chain resolution, relay transport, and the submission state machine

pub mod chain;
pub mod orchestrator;
pub mod transport;

pub use chain::{ChainError, ChainSpec, Hop, Position, ResolvedChain};
pub use orchestrator::{
    DispatchError, DispatchOrchestrator, DispatchReport, DispatchState, MAX_COPIES, MIN_COPIES,
};
pub use transport::{
    locate_executable, ProxyRoute, RelayTransport, TransportError, TransportStatus, YamnTransport,
};
