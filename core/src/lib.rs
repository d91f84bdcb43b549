// Mixgate Core: anonymous remailer submission pipeline
//
// Fields in, minimal result out. Between the two: validation, replay check,
// padding, a scratch file that is always wiped, and a relay client that only
// runs behind a verified anonymity proxy.

pub mod anonymity;
pub mod config;
pub mod dispatch;
pub mod privacy;
pub mod registry;
pub mod store;
pub mod submission;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub use anonymity::{AnonymityGate, ConnectivityReport, TorCheckGate, TorControl};
pub use config::{ConfigError, GatewayConfig, TorPolicy};
pub use dispatch::{
    ChainSpec, DispatchError, DispatchOrchestrator, DispatchReport, DispatchState, ProxyRoute,
    RelayTransport, TransportError, TransportStatus, YamnTransport,
};
pub use privacy::PaddingEngine;
pub use registry::{ListKind, ProxiedFetcher, RegistryError, SourceFetcher, SourceRegistry};
pub use store::{MessageFingerprint, ReplayCheck, ReplayGuard, ScratchStore, WriteObserver};
pub use submission::{build_message, SubmissionFields};

use config::ProxyConfig;
use dispatch::ChainError;
use privacy::PaddingError;
use store::ScratchError;
use submission::ValidatedSubmission;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Caller-facing failure taxonomy. Display text is for our own logs;
/// [`GatewayError::public_message`] is what a caller may see.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Anonymity proxy unavailable")]
    ProxyUnavailable,
    #[error("All list sources failed")]
    SourceExhausted,
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Replay detected")]
    ReplayDetected,
    #[error("Scratch storage failure")]
    ScratchIOError,
    #[error("Relay transport failure")]
    TransportFailure,
    #[error("Relay transport unavailable")]
    TransportUnavailable,
}

impl GatewayError {
    /// Fixed text with no paths, command lines, exit codes, or OS errors
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::ProxyUnavailable => "Tor is required but not available".to_string(),
            GatewayError::SourceExhausted => "Remailer list is currently unavailable".to_string(),
            GatewayError::ValidationError(msg) => msg.clone(),
            GatewayError::ReplayDetected => {
                "This message has already been sent recently".to_string()
            }
            GatewayError::ScratchIOError => "Failed to create secure message file".to_string(),
            GatewayError::TransportFailure => "Failed to send message".to_string(),
            GatewayError::TransportUnavailable => {
                "Message service is not available".to_string()
            }
        }
    }
}

impl From<&RegistryError> for GatewayError {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::ProxyUnavailable => GatewayError::ProxyUnavailable,
            RegistryError::SourceExhausted(_)
            | RegistryError::NotAvailable(_)
            | RegistryError::Io(_) => GatewayError::SourceExhausted,
        }
    }
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        GatewayError::from(&err)
    }
}

impl From<&ChainError> for GatewayError {
    fn from(err: &ChainError) -> Self {
        let msg = match err {
            ChainError::Syntax | ChainError::HopCount(_) | ChainError::EmptyHop(_) => {
                "Invalid remailer chain"
            }
            ChainError::WrongPosition { .. } | ChainError::UnknownRemailer(_) => {
                "Selected remailer is not available for that position"
            }
            ChainError::NoCandidates(_) => "No eligible remailers available",
        };
        GatewayError::ValidationError(msg.to_string())
    }
}

impl From<&DispatchError> for GatewayError {
    fn from(err: &DispatchError) -> Self {
        match err {
            DispatchError::InvalidCopies(_) => GatewayError::ValidationError(
                "Number of copies must be between 1 and 3".to_string(),
            ),
            DispatchError::Chain(e) => GatewayError::from(e),
            DispatchError::ProxyUnavailable => GatewayError::ProxyUnavailable,
            DispatchError::Transport(TransportError::Unavailable(_)) => {
                GatewayError::TransportUnavailable
            }
            DispatchError::Transport(TransportError::Io(_) | TransportError::TimedOut(_))
            | DispatchError::Rejected { .. } => GatewayError::TransportFailure,
        }
    }
}

impl From<ScratchError> for GatewayError {
    fn from(_err: ScratchError) -> Self {
        GatewayError::ScratchIOError
    }
}

/// Errors while assembling a [`Gateway`]
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Padding(#[from] PaddingError),
    #[error(transparent)]
    Scratch(#[from] ScratchError),
}

// ============================================================================
// DATA TYPES
// ============================================================================

/// The only thing a caller learns about a submission
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SubmitResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl SubmitResult {
    fn ok() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
        }
    }
}

/// Result plus internal detail, for the operator surface and tests
#[derive(Debug)]
pub struct SubmissionOutcome {
    pub result: SubmitResult,
    pub error: Option<GatewayError>,
    pub report: Option<DispatchReport>,
}

/// Swappable collaborators; production values come from [`Gateway::from_config`]
pub struct GatewayParts {
    pub gate: Arc<dyn AnonymityGate>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub transport: Arc<dyn RelayTransport>,
    pub replay: ReplayGuard,
    pub scratch_observer: Option<Arc<dyn WriteObserver>>,
}

// ============================================================================
// GATEWAY
// ============================================================================

pub struct Gateway {
    proxy: ProxyConfig,
    registry: SourceRegistry,
    replay: ReplayGuard,
    padding: PaddingEngine,
    scratch: ScratchStore,
    orchestrator: DispatchOrchestrator,
}

impl Gateway {
    /// Production wiring: Tor check gate, proxied fetcher, YAMN client, sled replay cache
    pub fn from_config(config: &GatewayConfig) -> Result<Self, InitError> {
        let gate: Arc<dyn AnonymityGate> = Arc::new(TorCheckGate::new(config.proxy.clone()));
        let parts = GatewayParts {
            gate,
            fetcher: Arc::new(ProxiedFetcher::new(&config.proxy, &config.registry)),
            transport: Arc::new(YamnTransport::new(&config.dispatch)),
            replay: ReplayGuard::open(&config.replay),
            scratch_observer: None,
        };
        Self::with_parts(config, parts)
    }

    pub fn with_parts(config: &GatewayConfig, parts: GatewayParts) -> Result<Self, InitError> {
        config.validate()?;

        let padding = PaddingEngine::new(config.padding.buckets.clone())?;
        let mut scratch = ScratchStore::from_config(&config.scratch)?;
        if let Some(observer) = parts.scratch_observer {
            scratch = scratch.with_observer(observer);
        }

        let registry = SourceRegistry::new(
            config.registry.clone(),
            parts.gate.clone(),
            parts.fetcher,
        );
        let orchestrator = DispatchOrchestrator::new(
            parts.gate,
            parts.transport,
            config.dispatch.delays,
            config.dispatch.log_outcomes,
        );

        Ok(Self {
            proxy: config.proxy.clone(),
            registry,
            replay: parts.replay,
            padding,
            scratch,
            orchestrator,
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Caller-facing entry point
    pub async fn submit(&self, fields: &SubmissionFields) -> SubmitResult {
        self.submit_detailed(fields).await.result
    }

    pub async fn submit_detailed(&self, fields: &SubmissionFields) -> SubmissionOutcome {
        let validated = match fields.validate() {
            Ok(validated) => validated,
            Err(errors) => {
                debug!("Submission rejected by field validation ({} errors)", errors.len());
                return SubmissionOutcome {
                    error: errors.first().cloned().map(GatewayError::ValidationError),
                    result: SubmitResult::failed(errors),
                    report: None,
                };
            }
        };

        let mut report = None;
        match self.admit_and_dispatch(fields, &validated, &mut report).await {
            Ok(()) => SubmissionOutcome {
                result: SubmitResult::ok(),
                error: None,
                report,
            },
            Err(e) => SubmissionOutcome {
                result: SubmitResult::failed(vec![e.public_message()]),
                error: Some(e),
                report,
            },
        }
    }

    async fn admit_and_dispatch(
        &self,
        fields: &SubmissionFields,
        validated: &ValidatedSubmission,
        report: &mut Option<DispatchReport>,
    ) -> Result<(), GatewayError> {
        let fingerprint = MessageFingerprint::compute(
            &fields.to,
            &fields.from,
            &fields.subject,
            fields.body.as_bytes(),
        );
        let reservation = match self.replay.check_and_reserve(fingerprint) {
            ReplayCheck::Fresh(reservation) => reservation,
            ReplayCheck::Replay => return Err(GatewayError::ReplayDetected),
        };

        let result = self.dispatch(fields, validated, report).await;
        match result {
            Ok(()) => self.replay.confirm(reservation),
            Err(_) => self.replay.release(reservation),
        }
        result
    }

    async fn dispatch(
        &self,
        fields: &SubmissionFields,
        validated: &ValidatedSubmission,
        report: &mut Option<DispatchReport>,
    ) -> Result<(), GatewayError> {
        let pool = self.registry.remailer_pool().await?;
        let route = if self.proxy.policy.requires_proxy_for(&fields.to) {
            ProxyRoute::tor(&self.proxy)
        } else {
            ProxyRoute::Direct
        };

        let handle = {
            let message = build_message(fields);
            let padded = Zeroizing::new(self.padding.pad(&message));
            self.scratch.create(&padded)?
        };

        let outcome = self
            .orchestrator
            .dispatch(&validated.chain, validated.copies, &pool, &handle, &route)
            .await;

        if let Err(e) = self.scratch.wipe(handle) {
            warn!("Scratch wipe reported an error: {}", e);
        }

        let result = outcome.result.as_ref().map_err(GatewayError::from).map(|_| ());
        *report = Some(outcome);
        result
    }
}
