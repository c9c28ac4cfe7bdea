use serde::{Deserialize, Serialize};

use crate::modules::token::AuthContext;
use crate::rewrap::types::{Classification, Policy};

/// Number of distinct authentication methods that counts as multi-factor.
const MFA_MIN_METHODS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAttributes {
    pub identity: String,
    pub clearance: Option<String>,
    pub country: Option<String>,
    #[serde(rename = "COI")]
    pub coi: Vec<String>,
    pub issuer: String,
    pub mfa_used: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAttributes {
    pub classification: Classification,
    pub releasability_to: Vec<String>,
    #[serde(rename = "COI")]
    pub coi: Vec<String>,
    pub creation_date: Option<String>,
}

/// Authentication context. `acr`, `amr` and `auth_time` are forwarded
/// exactly as they appeared in the verified token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub acr: Option<String>,
    pub amr: Vec<String>,
    #[serde(rename = "auth_time")]
    pub auth_time: Option<i64>,
    pub request_id: String,
    pub current_time: String,
    pub source_ip: String,
    pub tenant: String,
}

/// Input document sent to the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationQuery {
    pub subject: SubjectAttributes,
    pub resource: ResourceAttributes,
    pub context: RequestContext,
}

/// Per-request values that do not come from the token or the policy.
#[derive(Debug, Clone)]
pub struct QueryEnvironment<'a> {
    pub request_id: &'a str,
    pub source_ip: &'a str,
    pub tenant: &'a str,
    pub current_time: chrono::DateTime<chrono::Utc>,
}

impl AuthorizationQuery {
    /// Subject and authentication context come only from the verified
    /// token; nothing in the request body can override them.
    pub fn build(auth: &AuthContext, policy: &Policy, env: &QueryEnvironment<'_>) -> Self {
        let amr = auth.amr().to_vec();
        let mfa_used = amr.len() >= MFA_MIN_METHODS;

        Self {
            subject: SubjectAttributes {
                identity: auth.identity().to_string(),
                clearance: auth.clearance().map(str::to_string),
                country: auth.country().map(str::to_string),
                coi: auth.coi().to_vec(),
                issuer: auth.issuer().to_string(),
                mfa_used,
            },
            resource: ResourceAttributes {
                classification: policy.classification,
                releasability_to: policy.releasability_to.iter().cloned().collect(),
                coi: policy
                    .coi
                    .as_ref()
                    .map(|c| c.iter().cloned().collect())
                    .unwrap_or_default(),
                creation_date: policy.creation_date.clone(),
            },
            context: RequestContext {
                acr: auth.acr().map(str::to_string),
                amr,
                auth_time: auth.auth_time(),
                request_id: env.request_id.to_string(),
                current_time: env.current_time.to_rfc3339(),
                source_ip: env.source_ip.to_string(),
                tenant: env.tenant.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub obligations: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
            obligations: Vec::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
            obligations: Vec::new(),
        }
    }
}

/// Proof that the policy engine allowed the current request. Key recovery
/// entry points take one, so they cannot be reached before a decision.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationGrant {
    _issued: (),
}

impl AuthorizationGrant {
    pub(crate) fn issue(decision: &PolicyDecision) -> Option<Self> {
        decision.allow.then_some(Self { _issued: () })
    }
}
