//! Request-level error taxonomy.
//!
//! Subsystem errors are folded into [`RewrapError`] at the orchestrator
//! boundary. Only [`RewrapError::code`] and [`RewrapError::public_message`]
//! ever reach a caller; the `Display` text is for logs and audit.

use thiserror::Error;

use crate::federation::FederationError;
use crate::modules::crypto::CryptoError;
use crate::modules::dpop::DpopError;
use crate::modules::token::TokenError;
use crate::policy::PolicyError;
use crate::rewrap::combiner::CombineError;

#[derive(Debug, Error)]
pub enum RewrapError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request body of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("policy binding mismatch for key access object {kao_id}")]
    PolicyBindingMismatch { kao_id: String },

    #[error("invalid signature on key access object {kao_id}: {reason}")]
    SignatureInvalid { kao_id: String, reason: String },

    #[error("authorization denied: {reason}")]
    AuthorizationDenied { reason: String },

    #[error("key recovery failed: {0}")]
    KeyRecoveryFailure(String),

    #[error("split reconstruction failed: {0}")]
    SplitReconstructionFailure(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("internal error: {0}")]
    InternalError(String),
}

impl RewrapError {
    /// Stable error code returned to callers.
    pub fn code(&self) -> &'static str {
        match self {
            RewrapError::MalformedRequest(_) | RewrapError::PayloadTooLarge { .. } => {
                "MalformedRequest"
            }
            RewrapError::AuthenticationFailure(_) => "AuthenticationFailure",
            RewrapError::PolicyBindingMismatch { .. } => "PolicyBindingMismatch",
            RewrapError::SignatureInvalid { .. } => "SignatureInvalid",
            RewrapError::AuthorizationDenied { .. } => "AuthorizationDenied",
            RewrapError::KeyRecoveryFailure(_) => "KeyRecoveryFailure",
            RewrapError::SplitReconstructionFailure(_) => "SplitReconstructionFailure",
            RewrapError::UpstreamTimeout(_) => "UpstreamTimeout",
            RewrapError::RateLimited { .. } => "RateLimited",
            RewrapError::InternalError(_) => "InternalError",
        }
    }

    /// Caller-facing message. Never carries key material, policy-engine
    /// reasoning or upstream detail.
    pub fn public_message(&self) -> String {
        match self {
            RewrapError::MalformedRequest(detail) => format!("Malformed request: {}", detail),
            RewrapError::PayloadTooLarge { max, .. } => {
                format!("Request body exceeds the {} byte limit", max)
            }
            RewrapError::AuthenticationFailure(_) => {
                "Bearer token or DPoP proof is invalid".to_string()
            }
            RewrapError::PolicyBindingMismatch { kao_id } => format!(
                "Policy binding does not match the supplied policy (key access object {})",
                kao_id
            ),
            RewrapError::SignatureInvalid { kao_id, .. } => {
                format!("Signature verification failed for key access object {}", kao_id)
            }
            RewrapError::AuthorizationDenied { .. } => "Access denied by policy".to_string(),
            RewrapError::KeyRecoveryFailure(_) => "Unable to recover the key".to_string(),
            RewrapError::SplitReconstructionFailure(_) => {
                "Unable to reconstruct the split key".to_string()
            }
            RewrapError::UpstreamTimeout(_) => "An upstream service timed out".to_string(),
            RewrapError::RateLimited { retry_after } => {
                format!("Too many requests, retry after {} seconds", retry_after)
            }
            RewrapError::InternalError(_) => "Internal server error".to_string(),
        }
    }

    /// Whether the client may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RewrapError::UpstreamTimeout(_))
    }
}

impl From<TokenError> for RewrapError {
    fn from(e: TokenError) -> Self {
        RewrapError::AuthenticationFailure(e.to_string())
    }
}

impl From<DpopError> for RewrapError {
    fn from(e: DpopError) -> Self {
        RewrapError::AuthenticationFailure(e.to_string())
    }
}

impl From<CombineError> for RewrapError {
    fn from(e: CombineError) -> Self {
        RewrapError::SplitReconstructionFailure(e.to_string())
    }
}

/// A failing policy engine is an upstream failure and answers 502 through
/// `KeyRecoveryFailure`, the only 502 code in the protocol.
impl From<PolicyError> for RewrapError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Timeout => {
                RewrapError::UpstreamTimeout("policy engine did not answer in time".to_string())
            }
            other => RewrapError::KeyRecoveryFailure(format!("policy engine: {}", other)),
        }
    }
}

impl From<FederationError> for RewrapError {
    fn from(e: FederationError) -> Self {
        match e {
            FederationError::HsmTimeout => {
                RewrapError::UpstreamTimeout("HSM did not answer in time".to_string())
            }
            FederationError::Denied { endpoint } => RewrapError::AuthorizationDenied {
                reason: format!("remote KAS {} denied access", endpoint),
            },
            other => RewrapError::KeyRecoveryFailure(other.to_string()),
        }
    }
}

impl From<CryptoError> for RewrapError {
    fn from(e: CryptoError) -> Self {
        RewrapError::InternalError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            RewrapError::PayloadTooLarge { size: 2, max: 1 }.code(),
            "MalformedRequest"
        );
        assert_eq!(
            RewrapError::PolicyBindingMismatch {
                kao_id: "k".to_string()
            }
            .code(),
            "PolicyBindingMismatch"
        );
        assert_eq!(RewrapError::RateLimited { retry_after: 3 }.code(), "RateLimited");
    }

    #[test]
    fn test_denial_message_hides_reason() {
        let err = RewrapError::AuthorizationDenied {
            reason: "clearance SECRET below TOP_SECRET".to_string(),
        };
        assert!(!err.public_message().contains("clearance"));
        assert!(err.to_string().contains("clearance"));
    }

    #[test]
    fn test_policy_engine_errors_map_to_upstream_codes() {
        assert!(matches!(
            RewrapError::from(PolicyError::Timeout),
            RewrapError::UpstreamTimeout(_)
        ));
        for error in [
            PolicyError::Transport("connection refused".to_string()),
            PolicyError::Status(503),
            PolicyError::InvalidResponse("not json".to_string()),
        ] {
            match RewrapError::from(error) {
                RewrapError::KeyRecoveryFailure(msg) => assert!(msg.starts_with("policy engine")),
                other => panic!("expected upstream failure, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_only_timeouts_are_retryable() {
        assert!(RewrapError::UpstreamTimeout("x".to_string()).is_retryable());
        assert!(!RewrapError::KeyRecoveryFailure("x".to_string()).is_retryable());
        assert!(!RewrapError::SignatureInvalid {
            kao_id: "k".to_string(),
            reason: "r".to_string()
        }
        .is_retryable());
    }
}
