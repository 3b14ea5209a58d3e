use crate::types::VerifierComponent;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Controller tunables. Every field has a default so a partial `[controller]`
/// table (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// The device's verifier. `None` means verification is not available.
    pub verifier: Option<VerifierComponent>,
    pub verification_request_timeout_ms: u64,
    pub max_verification_request_extended_timeout_ms: u64,
    pub verifier_connection_timeout_ms: u64,
    pub auto_disconnect_timeout_ms: u64,
    pub experiment_ttl_ms: u64,
}

pub const DEFAULT_VERIFICATION_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_MAX_EXTENDED_TIMEOUT_MS: u64 = 10 * 60_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_AUTO_DISCONNECT_TIMEOUT_MS: u64 = 10 * 60_000;
pub const DEFAULT_EXPERIMENT_TTL_MS: u64 = 10 * 60_000;

/// Upper bound for any configured duration (one year). Timer wheels reject
/// much longer delays.
pub const MAX_TIMEOUT_MS: u64 = 365 * 24 * 60 * 60_000;

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            verifier: None,
            verification_request_timeout_ms: DEFAULT_VERIFICATION_REQUEST_TIMEOUT_MS,
            max_verification_request_extended_timeout_ms: DEFAULT_MAX_EXTENDED_TIMEOUT_MS,
            verifier_connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            auto_disconnect_timeout_ms: DEFAULT_AUTO_DISCONNECT_TIMEOUT_MS,
            experiment_ttl_ms: DEFAULT_EXPERIMENT_TTL_MS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    controller: ControllerConfig,
}

impl ControllerConfig {
    /// Parse the `[controller]` table out of a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s)?;
        file.controller.validate()?;
        Ok(file.controller)
    }

    /// Every duration must be in `1..=MAX_TIMEOUT_MS`, and the extension cap
    /// may not be shorter than the default request timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("verification_request_timeout_ms", self.verification_request_timeout_ms),
            (
                "max_verification_request_extended_timeout_ms",
                self.max_verification_request_extended_timeout_ms,
            ),
            ("verifier_connection_timeout_ms", self.verifier_connection_timeout_ms),
            ("auto_disconnect_timeout_ms", self.auto_disconnect_timeout_ms),
            ("experiment_ttl_ms", self.experiment_ttl_ms),
        ];
        for (field, ms) in durations {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
            if ms > MAX_TIMEOUT_MS {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{ms} exceeds the maximum of {MAX_TIMEOUT_MS}"),
                });
            }
        }
        if self.max_verification_request_extended_timeout_ms < self.verification_request_timeout_ms {
            return Err(ConfigError::Invalid {
                field: "max_verification_request_extended_timeout_ms",
                reason: format!(
                    "{} is shorter than verification_request_timeout_ms ({})",
                    self.max_verification_request_extended_timeout_ms,
                    self.verification_request_timeout_ms
                ),
            });
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: VerifierComponent) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.verifier_connection_timeout_ms)
    }

    pub fn auto_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_disconnect_timeout_ms)
    }

    pub fn experiment_ttl(&self) -> Duration {
        Duration::from_millis(self.experiment_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = ControllerConfig::from_toml("").expect("parse");
        assert_eq!(cfg, ControllerConfig::default());
        assert_eq!(cfg.verification_request_timeout_ms, 60_000);
        assert_eq!(cfg.max_verification_request_extended_timeout_ms, 600_000);
        assert_eq!(cfg.verifier_connection_timeout_ms, 10_000);
        assert_eq!(cfg.auto_disconnect_timeout_ms, 600_000);
        assert!(cfg.verifier.is_none());
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let cfg = ControllerConfig::from_toml(
            r#"
            [controller]
            verification_request_timeout_ms = 5000

            [controller.verifier]
            package_name = "com.example.verifier"
            service_name = "VerifierService"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.verification_request_timeout_ms, 5_000);
        assert_eq!(cfg.verifier_connection_timeout_ms, 10_000);
        let verifier = cfg.verifier.expect("verifier");
        assert_eq!(verifier.package_name, "com.example.verifier");
        assert_eq!(verifier.to_string(), "com.example.verifier/VerifierService");
    }

    #[test]
    fn unrelated_tables_are_ignored() {
        let cfg = ControllerConfig::from_toml("[verifier]\ncommand = [\"/bin/true\"]\n")
            .expect("parse");
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn bad_type_is_parse_error() {
        let err = ControllerConfig::from_toml("[controller]\nexperiment_ttl_ms = \"soon\"\n")
            .expect_err("should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let huge = ControllerConfig::from_toml(
            "[controller]\nverification_request_timeout_ms = 100000000000\nmax_verification_request_extended_timeout_ms = 100000000000\n",
        )
        .expect_err("too long");
        assert!(matches!(
            huge,
            ConfigError::Invalid { field: "verification_request_timeout_ms", .. }
        ));

        let zero = ControllerConfig::from_toml("[controller]\nverifier_connection_timeout_ms = 0\n")
            .expect_err("zero");
        assert!(matches!(
            zero,
            ConfigError::Invalid { field: "verifier_connection_timeout_ms", .. }
        ));
    }

    #[test]
    fn extension_cap_below_request_timeout_is_rejected() {
        let cfg = ControllerConfig {
            verification_request_timeout_ms: 60_000,
            max_verification_request_extended_timeout_ms: 30_000,
            ..ControllerConfig::default()
        };
        let err = cfg.validate().expect_err("cap too short");
        assert!(err.to_string().contains("shorter than verification_request_timeout_ms"));
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[controller]\nauto_disconnect_timeout_ms = 1000").expect("write");
        let cfg = ControllerConfig::load(file.path()).expect("load");
        assert_eq!(cfg.auto_disconnect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ControllerConfig::load(&dir.path().join("nope.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
