//! Error types for the controller and its transport seam.

use thiserror::Error;
use verigate_core::config::ConfigError;
use verigate_core::types::{Uid, UserId, VerificationId};

/// Failures surfaced to the remote verifier's inbound calls.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no verifier is bound for user {user_id}")]
    VerifierDisconnected { user_id: UserId },

    #[error("calling uid {calling_uid} is not the current verifier")]
    CallerNotVerifier { calling_uid: Uid },

    #[error("verification session {verification_id} doesn't exist or has finished")]
    SessionNotFound { verification_id: VerificationId },

    #[error("verification {verification_id}: invalid incomplete reason {code}")]
    InvalidIncompleteReason {
        verification_id: VerificationId,
        code: i32,
    },

    #[error("verification {verification_id}: invalid bypass reason {code}")]
    InvalidBypassReason {
        verification_id: VerificationId,
        code: i32,
    },

    #[error("config rejected: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("controller has shut down")]
    ShutDown,
}

impl ControllerError {
    /// The caller failed the identity check. Never swallow these.
    pub fn is_identity_failure(&self) -> bool {
        matches!(
            self,
            Self::VerifierDisconnected { .. } | Self::CallerNotVerifier { .. }
        )
    }

    /// The verifier sent a malformed report.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidIncompleteReason { .. } | Self::InvalidBypassReason { .. }
        )
    }
}

/// Failure delivering one outbound call to the verifier.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("verifier is not connected")]
    NotConnected,

    #[error("verifier connection was unbound")]
    Unbound,

    #[error("verifier rejected {method}: {message}")]
    Remote { method: String, message: String },

    #[error("verifier io error: {0}")]
    Io(#[from] std::io::Error),
}
