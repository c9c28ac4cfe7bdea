//! DPoP (Demonstrating Proof-of-Possession) validation per RFC 9449
//! https://datatracker.ietf.org/doc/html/rfc9449
//!
//! A rewrap request carries a bearer token and a DPoP proof. The proof must
//! be signed by the key whose thumbprint the token binds in `cnf.jkt`, must
//! name the request's method and URI, must hash the presented access token
//! in `ath`, and its `jti` may be used only once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::CacheManager;
use crate::modules::crypto::{base64url_decode, base64url_encode, constant_time_eq};

/// Tolerated clock skew for proofs issued slightly in the future.
const MAX_FUTURE_SKEW_SECS: i64 = 5;

/// DPoP JWT header
#[derive(Debug, Serialize, Deserialize)]
pub struct DPoPHeader {
    pub typ: String,
    pub alg: String,
    pub jwk: JWK,
}

/// JSON Web Key (JWK) for ECDSA P-256
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JWK {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

/// DPoP JWT claims
#[derive(Debug, Serialize, Deserialize)]
pub struct DPoPClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

#[derive(Debug, Error)]
pub enum DpopError {
    #[error("DPoP proof is malformed: {0}")]
    MalformedProof(String),

    #[error("DPoP typ must be dpop+jwt")]
    InvalidType,

    #[error("DPoP algorithm must be ES256")]
    InvalidAlgorithm,

    #[error("DPoP signature is invalid")]
    InvalidSignature,

    #[error("DPoP method mismatch: expected {expected}, got {actual}")]
    MethodMismatch { expected: String, actual: String },

    #[error("DPoP URI mismatch: expected {expected}, got {actual}")]
    UriMismatch { expected: String, actual: String },

    #[error("DPoP proof is missing ath or it does not match the access token")]
    TokenHashMismatch,

    #[error("DPoP proof expired: iat={iat}, now={now}")]
    Expired { iat: i64, now: i64 },

    #[error("DPoP proof issued in the future: iat={iat}, now={now}")]
    IssuedInFuture { iat: i64, now: i64 },

    #[error("DPoP key does not match the token's cnf.jkt")]
    JwkMismatch,

    #[error("DPoP jti {0} was already used")]
    Replayed(String),
}

/// Accepted proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpopProof {
    pub jti: String,
    pub jwk_thumbprint: String,
}

/// Validates proofs and remembers their `jti` for the freshness window.
pub struct DpopValidator {
    max_age: Duration,
    seen: moka::future::Cache<String, ()>,
    shared: Option<Arc<CacheManager>>,
}

impl DpopValidator {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            // A jti older than max_age is rejected on iat anyway.
            seen: moka::future::Cache::builder()
                .max_capacity(100_000)
                .time_to_live(max_age * 2)
                .build(),
            shared: None,
        }
    }

    /// Also record `jti` values in the shared cache so replicas see each
    /// other's proofs. The local guard still applies if the cache is down.
    pub fn with_shared_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.shared = Some(cache);
        self
    }

    pub async fn validate(
        &self,
        dpop_proof: &str,
        http_method: &str,
        http_uri: &str,
        access_token: &str,
        expected_jkt: &str,
    ) -> Result<DpopProof, DpopError> {
        let proof = validate_dpop_proof(
            dpop_proof,
            http_method,
            http_uri,
            Some(access_token),
            self.max_age.as_secs() as i64,
        )?;

        // The proof must be signed by the key the token is bound to.
        if !constant_time_eq(expected_jkt.as_bytes(), proof.jwk_thumbprint.as_bytes()) {
            warn!("DPoP key thumbprint does not match token binding");
            return Err(DpopError::JwkMismatch);
        }

        let entry = self.seen.entry(proof.jti.clone()).or_insert(()).await;
        if !entry.is_fresh() {
            warn!("DPoP jti replay detected: {}", proof.jti);
            return Err(DpopError::Replayed(proof.jti));
        }

        if let Some(cache) = &self.shared {
            let key = format!("kas:dpop:jti:{}", proof.jti);
            if let Some(count) = cache.incr_counter(&key, self.max_age * 2).await {
                if count > 1 {
                    warn!("DPoP jti replay detected across replicas: {}", proof.jti);
                    return Err(DpopError::Replayed(proof.jti));
                }
            }
        }

        Ok(proof)
    }
}

/// Validate a DPoP proof's structure, signature, freshness and request
/// binding. Replay and `cnf.jkt` checks are left to [`DpopValidator`].
pub fn validate_dpop_proof(
    dpop_proof: &str,
    http_method: &str,
    http_uri: &str,
    access_token: Option<&str>,
    max_age_seconds: i64,
) -> Result<DpopProof, DpopError> {
    debug!("Validating DPoP proof for {} {}", http_method, http_uri);

    let header = jsonwebtoken::decode_header(dpop_proof)
        .map_err(|e| DpopError::MalformedProof(e.to_string()))?;

    match header.typ.as_deref() {
        Some("dpop+jwt") => {}
        other => {
            warn!("Invalid DPoP type: {:?}", other);
            return Err(DpopError::InvalidType);
        }
    }

    if header.alg != Algorithm::ES256 {
        warn!("Invalid DPoP algorithm: {:?}", header.alg);
        return Err(DpopError::InvalidAlgorithm);
    }

    let jwk = extract_jwk_from_jwt(dpop_proof)?;
    if jwk.kty != "EC" || jwk.crv != "P-256" {
        warn!("Invalid JWK: kty={}, crv={}", jwk.kty, jwk.crv);
        return Err(DpopError::MalformedProof("JWK must be EC P-256".to_string()));
    }
    check_coordinates(&jwk)?;

    let decoding_key = DecodingKey::from_ec_components(&jwk.x, &jwk.y)
        .map_err(|e| DpopError::MalformedProof(e.to_string()))?;
    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_exp = false; // DPoP doesn't use exp, we check iat manually
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["jti", "htm", "htu", "iat"]);

    let claims = match decode::<DPoPClaims>(dpop_proof, &decoding_key, &validation) {
        Ok(data) => data.claims,
        Err(e) => {
            warn!("Failed to decode DPoP proof: {}", e);
            return Err(DpopError::InvalidSignature);
        }
    };

    let now = Utc::now().timestamp();
    if now - claims.iat > max_age_seconds {
        warn!(
            "DPoP proof is too old: iat={}, now={}, age={}s",
            claims.iat,
            now,
            now - claims.iat
        );
        return Err(DpopError::Expired { iat: claims.iat, now });
    }
    if claims.iat - now > MAX_FUTURE_SKEW_SECS {
        return Err(DpopError::IssuedInFuture { iat: claims.iat, now });
    }

    if !claims.htm.eq_ignore_ascii_case(http_method) {
        warn!(
            "DPoP HTTP method mismatch: expected={}, actual={}",
            http_method, claims.htm
        );
        return Err(DpopError::MethodMismatch {
            expected: http_method.to_string(),
            actual: claims.htm,
        });
    }

    let normalized_uri = normalize_uri(http_uri);
    let normalized_htu = normalize_uri(&claims.htu);
    if normalized_uri != normalized_htu {
        warn!(
            "DPoP HTTP URI mismatch: expected={}, actual={}",
            normalized_uri, normalized_htu
        );
        return Err(DpopError::UriMismatch {
            expected: normalized_uri,
            actual: normalized_htu,
        });
    }

    // With an access token present, ath is mandatory (RFC 9449 section 4.3).
    if let Some(access_token) = access_token {
        let expected_hash = compute_access_token_hash(access_token);
        match &claims.ath {
            Some(ath) if constant_time_eq(ath.as_bytes(), expected_hash.as_bytes()) => {}
            _ => {
                warn!("DPoP access token hash mismatch");
                return Err(DpopError::TokenHashMismatch);
            }
        }
    }

    let jwk_thumbprint = calculate_jwk_thumbprint(&jwk);
    debug!(
        "DPoP proof valid: jti={}, thumbprint={}",
        claims.jti, jwk_thumbprint
    );

    Ok(DpopProof {
        jti: claims.jti,
        jwk_thumbprint,
    })
}

/// Extract JWK from JWT header by manually parsing the JWT
fn extract_jwk_from_jwt(dpop_proof: &str) -> Result<JWK, DpopError> {
    let parts: Vec<&str> = dpop_proof.split('.').collect();
    if parts.len() != 3 {
        return Err(DpopError::MalformedProof("Invalid JWT format".to_string()));
    }

    let header_bytes = base64url_decode(parts[0])
        .map_err(|e| DpopError::MalformedProof(e.to_string()))?;
    let header: DPoPHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| DpopError::MalformedProof(format!("header: {}", e)))?;
    Ok(header.jwk)
}

fn check_coordinates(jwk: &JWK) -> Result<(), DpopError> {
    let x = base64url_decode(&jwk.x).map_err(|e| DpopError::MalformedProof(e.to_string()))?;
    let y = base64url_decode(&jwk.y).map_err(|e| DpopError::MalformedProof(e.to_string()))?;
    if x.len() != 32 || y.len() != 32 {
        return Err(DpopError::MalformedProof(
            "Invalid coordinate length".to_string(),
        ));
    }
    Ok(())
}

/// Normalize URI by removing query and fragment
fn normalize_uri(uri: &str) -> String {
    let without_fragment = uri.split('#').next().unwrap_or(uri);
    without_fragment
        .split('?')
        .next()
        .unwrap_or(without_fragment)
        .to_string()
}

/// Compute SHA-256 hash of access token, base64url-encoded
pub fn compute_access_token_hash(access_token: &str) -> String {
    base64url_encode(&Sha256::digest(access_token.as_bytes()))
}

/// Calculate JWK thumbprint per RFC 7638
pub fn calculate_jwk_thumbprint(jwk: &JWK) -> String {
    // Canonical JSON representation (lexicographically sorted)
    let canonical = format!(
        r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
        jwk.crv, jwk.kty, jwk.x, jwk.y
    );
    base64url_encode(&Sha256::digest(canonical.as_bytes()))
}
