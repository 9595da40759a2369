//! Error types shared by the HTTP client, scanner and orchestrator.
//!
//! Messages never include passwords; callers that need to mention a user
//! render it through [`crate::auth::sanitize_credential`].

use crate::deploy::DeployStage;

/// Wire-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionRefused,
    Unreachable,
    /// Certificate pin mismatch under the enforcing policy.
    PinRejected,
    Other,
}

/// Failure to get any HTTP response back from a device.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Network-level failures that are worth another attempt.
    pub fn is_network(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout
                | TransportErrorKind::ConnectionRefused
                | TransportErrorKind::Unreachable
        )
    }
}

/// Outcome of a logical device request that did not produce a usable response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    /// Unreachable or timed out after the retry budget was spent.
    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// Credentials rejected by every authentication method.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed challenge or unparseable device reply. Carries raw context.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request could not be built (bad URL, unserializable body).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Why a provisioning stage failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageFailure {
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The stage's side effect could not be confirmed on the device.
    #[error("verification failed")]
    Verification,

    /// A collaborator off the device failed (release manifest, license signer).
    #[error("external dependency failed")]
    External,
}

/// A fatal failure of one deployment job, labelled with the stage it hit.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} failed: {detail}", stage.label())]
pub struct StageError {
    pub stage: DeployStage,
    pub kind: StageFailure,
    pub detail: String,
}

impl StageError {
    pub fn verification(stage: DeployStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind: StageFailure::Verification,
            detail: detail.into(),
        }
    }

    pub fn external(stage: DeployStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind: StageFailure::External,
            detail: detail.into(),
        }
    }

    pub fn device(stage: DeployStage, err: DeviceError) -> Self {
        Self {
            stage,
            detail: err.to_string(),
            kind: StageFailure::Device(err),
        }
    }
}

/// Errors returned before a scan starts. Per-address failures are never surfaced.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("only IPv4 ranges can be scanned: {0}")]
    Unsupported(String),
}
