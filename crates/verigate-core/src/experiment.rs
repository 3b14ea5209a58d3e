//! Local stand-in for a live verifier.
//!
//! An experiment is a per-package queue of canned outcomes plus the policy
//! to apply before each one. `run_next_experiment` pops one outcome and
//! delivers it to the installer's callback exactly as a real verifier report
//! would arrive. Expiry is scheduled by the owner; see `expire`.

use crate::callback::VerifierCallback;
use crate::types::{IncompleteReason, VerificationPolicy, VerificationStatus};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

// ─── Outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentOutcome {
    Pass,
    Reject,
    IncompleteUnknown,
    IncompleteNetworkUnavailable,
    Timeout,
    ConnectionFailed,
    Infeasible,
}

impl ExperimentOutcome {
    pub fn code(self) -> i32 {
        match self {
            Self::Pass => 1,
            Self::Reject => 2,
            Self::IncompleteUnknown => 3,
            Self::IncompleteNetworkUnavailable => 4,
            Self::Timeout => 5,
            Self::ConnectionFailed => 6,
            Self::Infeasible => 7,
        }
    }

    /// `None` for 0 (unknown) and anything past the last known code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Pass),
            2 => Some(Self::Reject),
            3 => Some(Self::IncompleteUnknown),
            4 => Some(Self::IncompleteNetworkUnavailable),
            5 => Some(Self::Timeout),
            6 => Some(Self::ConnectionFailed),
            7 => Some(Self::Infeasible),
            _ => None,
        }
    }

    /// Keep the valid codes in order, dropping (and logging) the rest.
    pub fn parse_codes(codes: &[i32]) -> Vec<Self> {
        codes
            .iter()
            .filter_map(|&code| {
                let outcome = Self::from_code(code);
                if outcome.is_none() {
                    warn!(code, "experiment: ignoring invalid outcome code");
                }
                outcome
            })
            .collect()
    }

    fn deliver(self, callback: &dyn VerifierCallback) {
        match self {
            Self::Pass => callback.on_verification_complete_received(&VerificationStatus::passed(), None),
            Self::Reject => callback.on_verification_complete_received(
                &VerificationStatus::rejected("rejected by local experiment"),
                None,
            ),
            Self::IncompleteUnknown => {
                callback.on_verification_incomplete_received(IncompleteReason::Unknown)
            }
            Self::IncompleteNetworkUnavailable => {
                callback.on_verification_incomplete_received(IncompleteReason::NetworkUnavailable)
            }
            Self::Timeout => callback.on_timeout(),
            Self::ConnectionFailed => callback.on_connection_failed(),
            Self::Infeasible => callback.on_connection_infeasible(),
        }
    }
}

// ─── Provider ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Experiment {
    policy: VerificationPolicy,
    outcomes: VecDeque<ExperimentOutcome>,
}

#[derive(Debug, Default)]
pub struct ExperimentProvider {
    experiments: HashMap<String, Experiment>,
}

impl ExperimentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any experiment for `package`. Returns `false` (and stores
    /// nothing) when `outcomes` is empty.
    pub fn add_experiment(
        &mut self,
        package: &str,
        policy: VerificationPolicy,
        outcomes: Vec<ExperimentOutcome>,
    ) -> bool {
        if outcomes.is_empty() {
            self.experiments.remove(package);
            debug!(package, "experiment: no valid outcomes, nothing stored");
            return false;
        }
        debug!(package, %policy, count = outcomes.len(), "experiment: added");
        self.experiments.insert(
            package.to_owned(),
            Experiment {
                policy,
                outcomes: outcomes.into(),
            },
        );
        true
    }

    pub fn has_experiments(&self, package: &str) -> bool {
        self.experiments
            .get(package)
            .is_some_and(|e| !e.outcomes.is_empty())
    }

    /// Pop the next outcome for `package` and deliver it. Returns `false`
    /// when there is nothing queued.
    pub fn run_next_experiment(&mut self, package: &str, callback: &dyn VerifierCallback) -> bool {
        let Some(experiment) = self.experiments.get_mut(package) else {
            return false;
        };
        let Some(outcome) = experiment.outcomes.pop_front() else {
            self.experiments.remove(package);
            return false;
        };
        let policy = experiment.policy;
        if experiment.outcomes.is_empty() {
            self.experiments.remove(package);
        }

        let accepted = callback.on_verification_policy_overridden(policy);
        debug!(package, %policy, accepted, ?outcome, "experiment: running");
        outcome.deliver(callback);
        true
    }

    /// Drop the experiment for `package`. Returns whether one existed.
    pub fn expire(&mut self, package: &str) -> bool {
        let existed = self.experiments.remove(package).is_some();
        if existed {
            debug!(package, "experiment: expired");
        }
        existed
    }

    pub fn packages(&self) -> impl Iterator<Item = &str> {
        self.experiments.keys().map(String::as_str)
    }
}
