//! Daemon config file: controller tunables, how to launch the verifier, and
//! the installed-package table backing UID lookups.
//!
//! ```toml
//! [controller]
//! verification_request_timeout_ms = 60000
//!
//! [controller.verifier]
//! package_name = "com.example.verifier"
//! service_name = "VerifierService"
//!
//! [verifier]
//! command = ["/usr/libexec/example-verifier", "--stdio"]
//!
//! [[installed]]
//! package_name = "com.example.verifier"
//! user_id = 0
//! uid = 1000
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use verigate_controller::PackageResolver;
use verigate_core::config::{ConfigError, ControllerConfig};
use verigate_core::types::{Uid, UserId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub verifier: VerifierProcessConfig,
    #[serde(default)]
    pub installed: Vec<InstalledPackage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VerifierProcessConfig {
    /// Program and arguments. Empty means the verifier cannot be launched.
    pub command: Vec<String>,
    pub handshake_timeout_ms: u64,
}

impl Default for VerifierProcessConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            handshake_timeout_ms: 10_000,
        }
    }
}

impl VerifierProcessConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstalledPackage {
    pub package_name: String,
    pub user_id: UserId,
    pub uid: Uid,
}

impl RuntimeConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(s)?;
        cfg.controller.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

// ─── Package resolver ─────────────────────────────────────────────

/// [`PackageResolver`] over the `[[installed]]` table. Swappable on reload.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    installed: Arc<RwLock<HashMap<(String, UserId), Uid>>>,
}

impl ConfigResolver {
    pub fn new(installed: &[InstalledPackage]) -> Self {
        let resolver = Self::default();
        resolver.replace(installed);
        resolver
    }

    pub fn replace(&self, installed: &[InstalledPackage]) {
        let table = installed
            .iter()
            .map(|p| ((p.package_name.clone(), p.user_id), p.uid))
            .collect();
        *self
            .installed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = table;
    }
}

impl PackageResolver for ConfigResolver {
    fn package_uid(&self, package: &str, user_id: UserId) -> Option<Uid> {
        self.installed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(package.to_string(), user_id))
            .copied()
    }
}
