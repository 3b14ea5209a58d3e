//! The verifier's handle on one verification request.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use verigate_core::types::{
    BypassReason, ExtensionBundle, IncompleteReason, Uid, VerificationId, VerificationPolicy,
    VerificationRequest, VerificationStatus,
};

use crate::controller::VerifierController;
use crate::error::ControllerError;

/// Every call goes through the controller's inbound API under the verifier's
/// `calling_uid`, so the identity check and session lookup apply as usual.
pub struct VerificationSession {
    controller: VerifierController,
    calling_uid: Uid,
    request: VerificationRequest,
    policy: Mutex<VerificationPolicy>,
}

impl VerificationSession {
    pub fn new(controller: VerifierController, calling_uid: Uid, request: VerificationRequest) -> Self {
        let policy = Mutex::new(request.policy);
        Self {
            controller,
            calling_uid,
            request,
            policy,
        }
    }

    pub fn id(&self) -> VerificationId {
        self.request.verification_id
    }

    pub fn install_session_id(&self) -> i32 {
        self.request.install_session_id
    }

    pub fn package_name(&self) -> &str {
        &self.request.package_name
    }

    pub fn staged_package_uri(&self) -> &str {
        &self.request.staged_package_uri
    }

    pub fn extension_params(&self) -> &ExtensionBundle {
        &self.request.extension_params
    }

    pub fn request(&self) -> &VerificationRequest {
        &self.request
    }

    /// Policy as last accepted by the installer.
    pub fn policy(&self) -> VerificationPolicy {
        *self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the installer to switch policy. Asking for the current one is a no-op.
    pub async fn set_policy(&self, policy: VerificationPolicy) -> Result<bool, ControllerError> {
        if self.policy() == policy {
            return Ok(true);
        }
        let accepted = self
            .controller
            .set_verification_policy(self.calling_uid, self.id(), policy)
            .await?;
        if accepted {
            *self.policy.lock().unwrap_or_else(PoisonError::into_inner) = policy;
        }
        Ok(accepted)
    }

    /// Deadline, epoch ms.
    pub async fn timeout_time(&self) -> Result<u64, ControllerError> {
        self.controller
            .get_timeout_time_millis(self.calling_uid, self.id())
            .await
    }

    /// Returns how much time was actually granted.
    pub async fn extend_timeout(&self, additional: Duration) -> Result<Duration, ControllerError> {
        let extension = self
            .controller
            .extend_timeout_millis(self.calling_uid, self.id(), additional.as_millis() as u64)
            .await?;
        Ok(Duration::from_millis(extension.granted_ms))
    }

    pub async fn report_incomplete(&self, reason: IncompleteReason) -> Result<(), ControllerError> {
        self.controller
            .report_verification_incomplete(self.calling_uid, self.id(), reason.code())
            .await
    }

    pub async fn report_complete(
        &self,
        status: VerificationStatus,
        extension_response: Option<ExtensionBundle>,
    ) -> Result<(), ControllerError> {
        self.controller
            .report_verification_complete(self.calling_uid, self.id(), status, extension_response)
            .await
    }

    pub async fn report_bypassed(&self, reason: BypassReason) -> Result<(), ControllerError> {
        self.controller
            .report_verification_bypassed(self.calling_uid, self.id(), reason.0)
            .await
    }
}
