//! Transport seam between the controller and a verifier process.
//!
//! The controller never talks to a socket or a child process directly. It asks
//! a [`ServiceBinder`] for a [`RemoteVerifier`] per user and hears back about
//! connection state through the [`LifecycleSink`] it handed over.

use crate::error::ServiceError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use verigate_core::types::{Uid, UserId, VerifierComponent, VerifierRequest};

// ─── Lifecycle ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected,
    BinderDied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LifecycleNotice {
    pub user_id: UserId,
    pub generation: u64,
    pub event: LifecycleEvent,
}

/// Handed to [`ServiceBinder::bind`]. Tagged with the bind generation so the
/// controller can ignore events from connections it already tore down.
#[derive(Debug, Clone)]
pub struct LifecycleSink {
    user_id: UserId,
    generation: u64,
    tx: mpsc::UnboundedSender<LifecycleNotice>,
}

impl LifecycleSink {
    pub(crate) fn new(
        user_id: UserId,
        generation: u64,
        tx: mpsc::UnboundedSender<LifecycleNotice>,
    ) -> Self {
        Self {
            user_id,
            generation,
            tx,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn notify(&self, event: LifecycleEvent) {
        let notice = LifecycleNotice {
            user_id: self.user_id,
            generation: self.generation,
            event,
        };
        if self.tx.send(notice).is_err() {
            debug!(user_id = %self.user_id, ?event, "lifecycle: controller gone, dropping event");
        }
    }

    pub fn connected(&self) {
        self.notify(LifecycleEvent::Connected);
    }

    pub fn disconnected(&self) {
        self.notify(LifecycleEvent::Disconnected);
    }

    pub fn binder_died(&self) {
        self.notify(LifecycleEvent::BinderDied);
    }
}

// ─── Seams ────────────────────────────────────────────────────────

/// One bound connection to the verifier for one user.
pub trait RemoteVerifier: Send + Sync {
    /// Start connecting. Idempotent; the outcome arrives via the lifecycle sink.
    fn connect(&self);

    /// Send one call. The receiver resolves when the verifier acknowledges it.
    fn post(&self, request: VerifierRequest) -> oneshot::Receiver<Result<(), ServiceError>>;

    /// Drop the connection. No lifecycle event is expected afterwards.
    fn unbind(&self);
}

/// Creates connections to the verifier service.
pub trait ServiceBinder: Send + Sync {
    fn bind(
        &self,
        component: &VerifierComponent,
        user_id: UserId,
        uid: Uid,
        sink: LifecycleSink,
    ) -> Box<dyn RemoteVerifier>;
}

/// Looks up installed packages.
pub trait PackageResolver: Send + Sync {
    /// UID of `package` for `user_id`, or `None` if it is not installed for that user.
    fn package_uid(&self, package: &str, user_id: UserId) -> Option<Uid>;
}

/// Send an advisory call and discard the result. Failures are logged once the
/// verifier answers (or the call is dropped).
pub fn post_and_forget(remote: &dyn RemoteVerifier, user_id: UserId, request: VerifierRequest) {
    let method = request.method();
    let rx = remote.post(request);
    tokio::spawn(async move {
        match rx.await {
            Ok(Ok(())) => debug!(user_id = %user_id, method, "verifier: advisory call delivered"),
            Ok(Err(e)) => {
                warn!(user_id = %user_id, method, error = %e, "verifier: advisory call failed")
            }
            Err(_) => warn!(user_id = %user_id, method, "verifier: advisory call dropped"),
        }
    });
}
