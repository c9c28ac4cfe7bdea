use thiserror::Error;

use crate::rewrap::retry::TimeoutAware;

#[derive(Debug, Error)]
pub enum HsmError {
    #[error("unknown key {0}")]
    UnknownKey(String),

    #[error("unwrap failed for key {kid}: {reason}")]
    Unwrap { kid: String, reason: String },

    #[error("wrap failed for key {kid}: {reason}")]
    Wrap { kid: String, reason: String },

    #[error("public key unavailable for key {kid}: {reason}")]
    PublicKey { kid: String, reason: String },

    #[error("HSM call timed out")]
    Timeout,

    #[error("HSM backend error: {0}")]
    Backend(String),

    #[error("HSM configuration error: {0}")]
    Configuration(String),
}

impl TimeoutAware for HsmError {
    fn is_timeout(&self) -> bool {
        matches!(self, HsmError::Timeout)
    }
}
