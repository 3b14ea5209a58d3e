use crate::types::{
    BypassReason, ExtensionBundle, IncompleteReason, VerificationPolicy, VerificationStatus,
};

/// Installation-pipeline side of a verification.
///
/// The controller calls these from its event loop, so implementations must
/// return promptly and must not call back into the controller synchronously.
/// Exactly one terminal method (`on_connection_failed`, `on_connection_infeasible`,
/// `on_verification_*_received`, `on_timeout`) is delivered per session.
pub trait VerifierCallback: Send + Sync {
    /// The verifier process is bound and reachable.
    fn on_connection_established(&self);

    /// Bind or dispatch failed, or the verifier went away mid-session.
    fn on_connection_failed(&self);

    /// No verifier can ever serve this request (experiments only).
    fn on_connection_infeasible(&self);

    /// The verifier asked for more time. Sent whether or not the full amount was granted.
    fn on_timeout_extension_requested(&self);

    /// The verifier wants a different policy. Returns `true` to accept it.
    fn on_verification_policy_overridden(&self, policy: VerificationPolicy) -> bool;

    fn on_verification_incomplete_received(&self, reason: IncompleteReason);

    fn on_verification_complete_received(
        &self,
        status: &VerificationStatus,
        extension_response: Option<&ExtensionBundle>,
    );

    fn on_verification_bypassed_received(&self, reason: BypassReason);

    /// The verification deadline passed without a report.
    fn on_timeout(&self);
}
