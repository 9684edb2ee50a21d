//! Common error types for the contact gate.

use thiserror::Error;

/// Errors shared across gate components
#[derive(Debug, Error)]
pub enum GateError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit persistence unreachable or failing
    #[error("Rate limit store unavailable: {0}")]
    StoreUnavailable(String),

    /// Visitor session storage error
    #[error("Session error: {0}")]
    Session(String),

    /// External score verification transport/config failure
    #[error("CAPTCHA service error: {0}")]
    CaptchaService(String),

    /// Email delivery failure
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::StoreUnavailable(_) => 503,
            Self::Session(_) => 503,
            Self::CaptchaService(_) => 502,
            Self::Delivery(_) => 503,
            Self::Timeout(_) => 504,
            Self::InvalidInput(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Session(_) | Self::Delivery(_) | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}
