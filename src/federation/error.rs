use thiserror::Error;

use crate::hsm::HsmError;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("no registered KAS for {url}")]
    UnknownPeer { url: String },

    #[error("circuit open for {endpoint}")]
    CircuitOpen { endpoint: String },

    #[error("{endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("transport error talking to {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("{endpoint} denied the request")]
    Denied { endpoint: String },

    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("local key unwrap failed: {0}")]
    Hsm(#[from] HsmError),

    #[error("could not sign peer request: {0}")]
    Signing(String),

    #[error("local HSM timed out")]
    HsmTimeout,

    #[error("all {attempts} alternatives failed, last error: {last}")]
    AllAlternativesFailed { attempts: usize, last: String },

    #[error("share task failed: {0}")]
    TaskFailed(String),

    #[error("federation registry error: {0}")]
    Registry(String),
}

impl FederationError {
    /// Whether the error reflects the health of the remote endpoint and
    /// should count against its breaker.
    pub fn counts_as_endpoint_failure(&self) -> bool {
        matches!(
            self,
            FederationError::Timeout { .. }
                | FederationError::Transport { .. }
                | FederationError::InvalidResponse { .. }
        ) || matches!(self, FederationError::Status { status, .. } if *status >= 500)
    }
}
