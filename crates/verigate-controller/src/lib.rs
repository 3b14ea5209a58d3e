//! verigate-controller: the verifier session controller actor and the
//! transport seam it binds verifiers through.

pub mod binder;
pub mod clock;
pub mod controller;
pub mod error;
pub mod session;

pub use binder::{
    LifecycleEvent, LifecycleSink, PackageResolver, RemoteVerifier, ServiceBinder,
    post_and_forget,
};
pub use clock::TokioClock;
pub use controller::{ControllerSnapshot, HandleInfo, SessionInfo, VerifierController};
pub use error::{ControllerError, ServiceError};
pub use session::VerificationSession;
