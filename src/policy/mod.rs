//! Authorization against an external policy engine.

mod error;
mod opa;
mod types;

use async_trait::async_trait;

pub use error::PolicyError;
pub use opa::OpaPolicyEngine;
pub use types::{
    AuthorizationGrant, AuthorizationQuery, PolicyDecision, QueryEnvironment, RequestContext,
    ResourceAttributes, SubjectAttributes,
};

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn decide(&self, query: &AuthorizationQuery) -> Result<PolicyDecision, PolicyError>;
}
