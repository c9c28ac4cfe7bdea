use thiserror::Error;

use crate::rewrap::retry::TimeoutAware;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy engine timed out")]
    Timeout,

    #[error("policy engine transport error: {0}")]
    Transport(String),

    #[error("policy engine returned HTTP {0}")]
    Status(u16),

    #[error("policy engine returned an unreadable decision: {0}")]
    InvalidResponse(String),
}

impl TimeoutAware for PolicyError {
    fn is_timeout(&self) -> bool {
        matches!(self, PolicyError::Timeout)
    }
}

impl From<reqwest::Error> for PolicyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PolicyError::Timeout
        } else if e.is_decode() {
            PolicyError::InvalidResponse(e.to_string())
        } else {
            PolicyError::Transport(e.to_string())
        }
    }
}
