//! verigate-core: data model and pure state machines for the verifier
//! session controller. Request/status types, reason codes, per-request
//! deadline tracking, and the local experiment provider.
//!
//! No async, no transport. Everything here is driven by the controller.

pub mod callback;
pub mod clock;
pub mod config;
pub mod experiment;
pub mod tracker;
pub mod types;

pub use callback::VerifierCallback;
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, ControllerConfig};
pub use experiment::{ExperimentOutcome, ExperimentProvider};
pub use tracker::{Extension, SessionStatusTracker};
