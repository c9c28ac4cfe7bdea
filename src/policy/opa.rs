use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::policy::error::PolicyError;
use crate::policy::types::{AuthorizationQuery, PolicyDecision};
use crate::policy::PolicyEngine;

#[derive(Serialize)]
struct OpaRequest<'a> {
    input: &'a AuthorizationQuery,
}

#[derive(Deserialize)]
struct OpaResponse {
    #[serde(default)]
    result: Option<PolicyDecision>,
}

/// Policy engine backed by an Open Policy Agent decision endpoint, e.g.
/// `http://opa:8181/v1/data/kas/authorization/decision`.
pub struct OpaPolicyEngine {
    client: reqwest::Client,
    decision_url: String,
}

impl OpaPolicyEngine {
    pub fn new(decision_url: impl Into<String>, timeout: Duration) -> Result<Self, PolicyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PolicyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            decision_url: decision_url.into(),
        })
    }

    pub fn decision_url(&self) -> &str {
        &self.decision_url
    }
}

/// An undefined rule comes back as `{}`; that is a denial.
fn decision_from_response(response: OpaResponse) -> PolicyDecision {
    response
        .result
        .unwrap_or_else(|| PolicyDecision::deny("policy decision undefined"))
}

#[async_trait]
impl PolicyEngine for OpaPolicyEngine {
    async fn decide(&self, query: &AuthorizationQuery) -> Result<PolicyDecision, PolicyError> {
        let response = self
            .client
            .post(&self.decision_url)
            .json(&OpaRequest { input: query })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!("OPA returned HTTP {} for request {}", status, query.context.request_id);
            return Err(PolicyError::Status(status.as_u16()));
        }

        let body: OpaResponse = response.json().await?;
        let decision = decision_from_response(body);
        debug!(
            "OPA decision for request {}: allow={}",
            query.context.request_id, decision.allow
        );
        Ok(decision)
    }
}
