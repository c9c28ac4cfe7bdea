//! Bearer token verification against the identity provider's JWKS.
//!
//! A verified token yields an [`AuthContext`]. Its fields are fixed at
//! construction and only readable afterwards; the policy query and the
//! audit record copy from it without transformation.

use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use log::{info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::PS256,
    Algorithm::ES256,
    Algorithm::ES384,
];
const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_LEEWAY_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token rejected: {0}")]
    Invalid(String),

    #[error("no signing key with kid {0}")]
    UnknownKey(String),

    #[error("JWKS unavailable: {0}")]
    JwksUnavailable(String),

    #[error("token is missing the {0} claim")]
    MissingClaim(&'static str),
}

/// Identity and authentication context taken from a verified token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthContext {
    subject: String,
    identity: String,
    issuer: String,
    clearance: Option<String>,
    country: Option<String>,
    coi: Vec<String>,
    acr: Option<String>,
    amr: Vec<String>,
    auth_time: Option<i64>,
    jkt: Option<String>,
}

impl AuthContext {
    /// Build from a verified claim set.
    ///
    /// `amr` and `acpCOI` are accepted as a JSON array, as a string holding
    /// a JSON array, or as a single string. A numeric `acr` is kept as its
    /// decimal string.
    pub fn from_claims(claims: &Value) -> Result<Self, TokenError> {
        let subject = string_claim(claims, "sub").ok_or(TokenError::MissingClaim("sub"))?;
        let issuer = string_claim(claims, "iss").ok_or(TokenError::MissingClaim("iss"))?;
        let identity = string_claim(claims, "uniqueID").unwrap_or_else(|| subject.clone());

        let acr = match claims.get("acr") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(Self {
            subject,
            identity,
            issuer,
            clearance: string_claim(claims, "clearance"),
            country: string_claim(claims, "countryOfAffiliation"),
            coi: claims.get("acpCOI").map(string_list).unwrap_or_default(),
            acr,
            amr: claims.get("amr").map(string_list).unwrap_or_default(),
            auth_time: claims.get("auth_time").and_then(Value::as_i64),
            jkt: claims
                .get("cnf")
                .and_then(|cnf| cnf.get("jkt"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn clearance(&self) -> Option<&str> {
        self.clearance.as_deref()
    }

    pub fn country(&self) -> Option<&str> {
        self.country.as_deref()
    }

    pub fn coi(&self) -> &[String] {
        &self.coi
    }

    pub fn acr(&self) -> Option<&str> {
        self.acr.as_deref()
    }

    pub fn amr(&self) -> &[String] {
        &self.amr
    }

    pub fn auth_time(&self) -> Option<i64> {
        self.auth_time
    }

    /// JWK thumbprint the token is bound to (`cnf.jkt`), if any.
    pub fn jkt(&self) -> Option<&str> {
        self.jkt.as_deref()
    }
}

fn string_claim(claims: &Value, name: &str) -> Option<String> {
    claims
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::String(s) => match serde_json::from_str::<Vec<String>>(s) {
            Ok(list) => list,
            Err(_) if s.is_empty() => Vec::new(),
            Err(_) => vec![s.clone()],
        },
        _ => Vec::new(),
    }
}

enum JwksSource {
    Remote { url: String, client: reqwest::Client },
    Static,
}

pub struct TokenVerifier {
    issuers: Vec<String>,
    audience: Option<String>,
    source: JwksSource,
    keys: RwLock<JwkSet>,
    last_refresh: Mutex<Option<Instant>>,
    leeway: u64,
}

impl TokenVerifier {
    /// Verifier that fetches signing keys from `jwks_url` and refreshes
    /// them when an unknown `kid` appears.
    pub fn remote(
        issuers: Vec<String>,
        audience: Option<String>,
        jwks_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TokenError::JwksUnavailable(e.to_string()))?;
        Ok(Self {
            issuers,
            audience,
            source: JwksSource::Remote {
                url: jwks_url.into(),
                client,
            },
            keys: RwLock::new(JwkSet { keys: Vec::new() }),
            last_refresh: Mutex::new(None),
            leeway: DEFAULT_LEEWAY_SECS,
        })
    }

    /// Verifier over a fixed key set.
    pub fn with_static_keys(issuers: Vec<String>, audience: Option<String>, keys: JwkSet) -> Self {
        Self {
            issuers,
            audience,
            source: JwksSource::Static,
            keys: RwLock::new(keys),
            last_refresh: Mutex::new(None),
            leeway: DEFAULT_LEEWAY_SECS,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<AuthContext, TokenError> {
        let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenError::Invalid(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| TokenError::Malformed("token header has no kid".to_string()))?;

        let jwk = self.find_key(&kid).await?;
        let decoding_key =
            DecodingKey::from_jwk(&jwk).map_err(|e| TokenError::Invalid(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway;
        validation.set_issuer(&self.issuers);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<Value>(token, &decoding_key, &validation).map_err(|e| {
            warn!("Bearer token rejected: {}", e);
            TokenError::Invalid(e.to_string())
        })?;

        AuthContext::from_claims(&data.claims)
    }

    async fn find_key(&self, kid: &str) -> Result<Jwk, TokenError> {
        if let Some(jwk) = self.keys.read().await.find(kid) {
            return Ok(jwk.clone());
        }

        if self.refresh().await? {
            if let Some(jwk) = self.keys.read().await.find(kid) {
                return Ok(jwk.clone());
            }
        }
        Err(TokenError::UnknownKey(kid.to_string()))
    }

    /// Reload the JWKS. Returns false when the source is static or a
    /// refresh happened too recently.
    async fn refresh(&self) -> Result<bool, TokenError> {
        let JwksSource::Remote { url, client } = &self.source else {
            return Ok(false);
        };

        let mut last = self.last_refresh.lock().await;
        if matches!(*last, Some(at) if at.elapsed() < JWKS_REFRESH_INTERVAL) {
            return Ok(false);
        }
        *last = Some(Instant::now());

        let set: JwkSet = client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TokenError::JwksUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| TokenError::JwksUnavailable(e.to_string()))?;

        info!("Loaded {} signing keys from {}", set.keys.len(), url);
        *self.keys.write().await = set;
        Ok(true)
    }
}
