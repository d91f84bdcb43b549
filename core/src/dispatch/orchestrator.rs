// Dispatch Orchestrator: one submission, start to finish
//
// Validating -> GateChecking -> Enqueuing -> Sending -> Succeeded | Failed.
// Validation and gate failures go straight to Failed and the relay client is
// never started, so GateChecking only appears in a trace that got past the gate. Once enqueue has been invoked the run is not cancelled.

use crate::anonymity::AnonymityGate;
use crate::dispatch::chain::{ChainError, ChainSpec, ResolvedChain};
use crate::dispatch::transport::{ProxyRoute, RelayTransport, TransportError};
use crate::privacy::DispatchDelays;
use crate::registry::RemailerPool;
use crate::store::ScratchHandle;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const MIN_COPIES: u8 = 1;
pub const MAX_COPIES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Validating,
    GateChecking,
    Enqueuing,
    Sending,
    Succeeded,
    Failed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Copy count must be between 1 and 3, got {0}")]
    InvalidCopies(u8),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("Anonymity proxy unavailable")]
    ProxyUnavailable,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Relay {step} exited with status {code}")]
    Rejected { step: &'static str, code: i32 },
}

/// Everything a caller may learn about one dispatch
#[derive(Debug)]
pub struct DispatchReport {
    pub trace: Vec<DispatchState>,
    pub chain: Option<ResolvedChain>,
    pub result: Result<(), DispatchError>,
}

impl DispatchReport {
    pub fn final_state(&self) -> DispatchState {
        self.trace.last().copied().unwrap_or(DispatchState::Failed)
    }

    pub fn succeeded(&self) -> bool {
        self.final_state() == DispatchState::Succeeded
    }

    /// Whether the relay client was started at all
    pub fn reached_transport(&self) -> bool {
        self.trace.contains(&DispatchState::Enqueuing)
    }
}

pub struct DispatchOrchestrator {
    gate: Arc<dyn AnonymityGate>,
    transport: Arc<dyn RelayTransport>,
    delays: DispatchDelays,
    log_outcomes: bool,
}

impl DispatchOrchestrator {
    pub fn new(
        gate: Arc<dyn AnonymityGate>,
        transport: Arc<dyn RelayTransport>,
        delays: DispatchDelays,
        log_outcomes: bool,
    ) -> Self {
        Self {
            gate,
            transport,
            delays,
            log_outcomes,
        }
    }

    /// Run the state machine for one message already in the scratch store.
    /// The handle is only borrowed; wiping it is the caller's job.
    pub async fn dispatch(
        &self,
        chain: &ChainSpec,
        copies: u8,
        pool: &RemailerPool,
        message: &ScratchHandle,
        route: &ProxyRoute,
    ) -> DispatchReport {
        let mut trace = vec![DispatchState::Validating];
        let mut resolved = None;

        let result = self
            .run(chain, copies, pool, message, route, &mut trace, &mut resolved)
            .await;
        trace.push(if result.is_ok() {
            DispatchState::Succeeded
        } else {
            DispatchState::Failed
        });

        if let Err(e) = &result {
            warn!("Dispatch failed: {}", redact(e));
        }
        if self.log_outcomes {
            info!(
                target: "mixgate::outcome",
                success = result.is_ok(),
                chain = %chain.shape(),
                copies,
                timestamp = Utc::now().timestamp(),
                "dispatch outcome"
            );
        }

        DispatchReport {
            trace,
            chain: resolved,
            result,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        chain: &ChainSpec,
        copies: u8,
        pool: &RemailerPool,
        message: &ScratchHandle,
        route: &ProxyRoute,
        trace: &mut Vec<DispatchState>,
        resolved: &mut Option<ResolvedChain>,
    ) -> Result<(), DispatchError> {
        if !(MIN_COPIES..=MAX_COPIES).contains(&copies) {
            return Err(DispatchError::InvalidCopies(copies));
        }
        let concrete = chain.resolve(pool)?;
        self.transport.preflight(route).await?;

        if route.is_proxied() && !self.gate.is_proxy_functional().await {
            return Err(DispatchError::ProxyUnavailable);
        }
        // Recorded once the gate is cleared; a direct route clears it unasked
        trace.push(DispatchState::GateChecking);

        self.delays.pre_submit.sleep().await;

        trace.push(DispatchState::Enqueuing);
        let queued = self
            .transport
            .enqueue(&concrete, copies, message.path(), route)
            .await;
        *resolved = Some(concrete);
        let queued = queued?;
        if !queued.is_success() {
            return Err(DispatchError::Rejected {
                step: "enqueue",
                code: queued.code,
            });
        }

        self.delays.inter_step.sleep().await;

        trace.push(DispatchState::Sending);
        let sent = self.transport.flush(route).await?;
        if !sent.is_success() {
            return Err(DispatchError::Rejected {
                step: "flush",
                code: sent.code,
            });
        }

        self.delays.post_send.sleep().await;
        Ok(())
    }
}

/// Failure text safe for our own log: no names, paths, or client output
fn redact(err: &DispatchError) -> String {
    match err {
        DispatchError::InvalidCopies(_) => "invalid copy count".to_string(),
        DispatchError::Chain(_) => "invalid chain".to_string(),
        DispatchError::ProxyUnavailable => "proxy unavailable".to_string(),
        DispatchError::Transport(TransportError::Unavailable(_)) => {
            "relay transport unavailable".to_string()
        }
        DispatchError::Transport(TransportError::Io(_)) => "relay transport I/O".to_string(),
        DispatchError::Transport(TransportError::TimedOut(_)) => {
            "relay transport timed out".to_string()
        }
        DispatchError::Rejected { step, code } => format!("{} exited with {}", step, code),
    }
}
