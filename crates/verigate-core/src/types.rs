use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ─── Identity ─────────────────────────────────────────────────────

/// Number of UIDs reserved per user. A UID encodes its user as `uid / PER_USER_RANGE`.
pub const PER_USER_RANGE: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u32);

impl Uid {
    /// Build the UID of `app_id` running as `user`.
    pub fn of(user: UserId, app_id: u32) -> Self {
        Self(user.0 * PER_USER_RANGE + app_id % PER_USER_RANGE)
    }

    /// The user this UID belongs to.
    pub fn user_id(self) -> UserId {
        UserId(self.0 / PER_USER_RANGE)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one verification attempt. Equal to the installation session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationId(pub i32);

impl fmt::Display for VerificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    /// Verification is not performed.
    None,
    /// Failures are logged, installation proceeds.
    Open,
    /// Failures warn the user, installation proceeds on confirmation.
    Warn,
    /// Rejection blocks; an incomplete verification lets the install through.
    BlockFailOpen,
    /// Rejection and incomplete verification both block.
    BlockFailClosed,
}

impl VerificationPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Open => "open",
            Self::Warn => "warn",
            Self::BlockFailOpen => "block_fail_open",
            Self::BlockFailClosed => "block_fail_closed",
        }
    }
}

impl fmt::Display for VerificationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Self::None),
            "open" => Ok(Self::Open),
            "warn" => Ok(Self::Warn),
            "block_fail_open" => Ok(Self::BlockFailOpen),
            "block_fail_closed" => Ok(Self::BlockFailClosed),
            _ => Err(format!("unknown verification policy: {s}")),
        }
    }
}

// ─── Reason codes ─────────────────────────────────────────────────

/// Why a verifier could not finish a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    Unknown,
    NetworkUnavailable,
}

impl IncompleteReason {
    pub fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::NetworkUnavailable => 1,
        }
    }

    /// Map a wire code to a reason. `None` for codes outside the known range.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::NetworkUnavailable),
            _ => None,
        }
    }
}

/// Why a verifier bypassed a verification.
///
/// Open-ended: any code above [`BypassReason::UNSPECIFIED`] is accepted and
/// forwarded to the installer untouched, so newer verifiers can report
/// reasons this side does not know by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BypassReason(pub i32);

impl BypassReason {
    /// Reserved. Never a valid report.
    pub const UNSPECIFIED: Self = Self(0);
    /// Installation was initiated over the debug bridge.
    pub const ADB: Self = Self(1);
    /// Verifier unresponsive; only critical packages may use this.
    pub const EMERGENCY: Self = Self(2);
    /// Test environment.
    pub const TEST: Self = Self(3);

    pub fn is_valid(self) -> bool {
        self.0 > Self::UNSPECIFIED.0
    }
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSPECIFIED => f.write_str("unspecified"),
            Self::ADB => f.write_str("adb"),
            Self::EMERGENCY => f.write_str("emergency"),
            Self::TEST => f.write_str("test"),
            Self(code) => write!(f, "code {code}"),
        }
    }
}

// ─── Request / result payloads ────────────────────────────────────

/// Free-form key/value payload passed between installer and verifier.
pub type ExtensionBundle = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInfo {
    /// Hex-encoded SHA-256 digests of the signing certificates, in signer order.
    #[serde(default)]
    pub certificate_digests: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLibrary {
    pub name: String,
    pub version: i64,
    pub declaring_package: String,
}

/// Everything the verifier needs to judge one installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub verification_id: VerificationId,
    pub install_session_id: i32,
    pub package_name: String,
    pub staged_package_uri: String,
    #[serde(default)]
    pub signing_info: SigningInfo,
    #[serde(default)]
    pub declared_libraries: Vec<SharedLibrary>,
    #[serde(default)]
    pub extension_params: ExtensionBundle,
    pub policy: VerificationPolicy,
}

/// Final verdict reported by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStatus {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl VerificationStatus {
    pub fn passed() -> Self {
        Self {
            verified: true,
            failure_message: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            verified: false,
            failure_message: Some(message.into()),
        }
    }
}

// ─── Verifier identity ────────────────────────────────────────────

/// The verifier service configured for the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerifierComponent {
    pub package_name: String,
    pub service_name: String,
}

impl fmt::Display for VerifierComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package_name, self.service_name)
    }
}

// ─── Outbound contract ────────────────────────────────────────────

/// A call from the controller to the remote verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum VerifierRequest {
    #[serde(rename = "on_package_name_available")]
    PackageNameAvailable { package_name: String },
    #[serde(rename = "on_verification_cancelled")]
    VerificationCancelled { package_name: String },
    #[serde(rename = "on_verification_required")]
    VerificationRequired(VerificationRequest),
    #[serde(rename = "on_verification_retry")]
    VerificationRetry(VerificationRequest),
    #[serde(rename = "on_verification_timeout")]
    VerificationTimeout { verification_id: VerificationId },
}

impl VerifierRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::PackageNameAvailable { .. } => "on_package_name_available",
            Self::VerificationCancelled { .. } => "on_verification_cancelled",
            Self::VerificationRequired(_) => "on_verification_required",
            Self::VerificationRetry(_) => "on_verification_retry",
            Self::VerificationTimeout { .. } => "on_verification_timeout",
        }
    }
}
