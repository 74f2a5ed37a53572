use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Why a page automation step gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomationFailure {
    CategoryNotFound,
    ConditionNotFound,
    ContinuationNotFound,
    PageGone,
    Other(String),
}

impl AutomationFailure {
    /// The reason string written to the store.
    pub fn reason(&self) -> &str {
        match self {
            AutomationFailure::CategoryNotFound => "CategoryNotFound",
            AutomationFailure::ConditionNotFound => "ConditionNotFound",
            AutomationFailure::ContinuationNotFound => "ContinuationNotFound",
            AutomationFailure::PageGone => "PageGone",
            AutomationFailure::Other(message) => message.as_str(),
        }
    }
}

impl std::fmt::Display for AutomationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Request failed: {message}")]
    Request {
        message: String,
        needs_subscription: bool,
    },

    #[error("Automation error: {0}")]
    Automation(AutomationFailure),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Store quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },

    #[error("No handler for callback: {0}")]
    Routing(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Write the failure to the store and optionally close the page.
    RecordAndClose,
    /// Hand the error back to whoever initiated the call, verbatim.
    SurfaceToCaller,
    /// Fail the operation in progress; progress state must not be lost silently.
    AbortOperation,
    Ignore,
    RetryWithBackoff,
    ReloadConfig,
}

impl RelayError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            RelayError::Automation(_) => RecoveryStrategy::RecordAndClose,
            RelayError::Request { .. } => RecoveryStrategy::SurfaceToCaller,
            RelayError::Encoding(_) => RecoveryStrategy::AbortOperation,
            RelayError::QuotaExceeded { .. } => RecoveryStrategy::AbortOperation,
            RelayError::Storage(_) => RecoveryStrategy::AbortOperation,
            RelayError::Routing(_) => RecoveryStrategy::Ignore,
            RelayError::Browser(_) => RecoveryStrategy::RecordAndClose,
            RelayError::Network(_) => RecoveryStrategy::RetryWithBackoff,
            RelayError::Config(_) => RecoveryStrategy::ReloadConfig,
        }
    }

    pub fn automation(failure: AutomationFailure) -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(RelayError::Automation(failure))
    }
}

/// Store failures abort the operation in progress and are never recorded as page failures.
pub fn is_store_failure(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    matches!(
        err.downcast_ref::<RelayError>().map(RelayError::recovery_strategy),
        Some(RecoveryStrategy::AbortOperation)
    )
}

// Conversion implementations for common error types
impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Encoding(err.to_string())
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Network(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for RelayError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        RelayError::Browser(err.to_string())
    }
}
