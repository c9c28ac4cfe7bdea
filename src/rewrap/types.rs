//! Wire types for the rewrap protocol.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::modules::crypto::{self, CryptoError, SignatureAlgorithm};
use crate::modules::secure_keys::SecureEcPrivateKey;

/// Ordered classification levels. Ordering follows sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Unclassified,
    Confidential,
    Secret,
    TopSecret,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Unclassified => "UNCLASSIFIED",
            Classification::Confidential => "CONFIDENTIAL",
            Classification::Secret => "SECRET",
            Classification::TopSecret => "TOP_SECRET",
        }
    }
}

/// Resource policy as presented by the client. Sets are held in sorted
/// collections so the canonical serialization is order independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub classification: Classification,
    pub releasability_to: BTreeSet<String>,
    #[serde(rename = "COI", default, skip_serializing_if = "Option::is_none")]
    pub coi: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SplitMode {
    AllOf,
    AnyOf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KaoSignature {
    pub alg: String,
    pub sig: String,
}

/// Key Access Object. Binary fields travel as standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAccessObject {
    pub id: String,
    pub url: String,
    pub kid: String,
    pub wrapped_key: String,
    pub policy_binding: String,
    pub signature: KaoSignature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_mode: Option<SplitMode>,
}

impl KeyAccessObject {
    /// Build a KAO the way a KAS issues one at wrap time: bind it to
    /// `policy` and sign `wrappedKey || policyBinding` with `signer`.
    pub fn issue(
        id: &str,
        url: &str,
        kid: &str,
        wrapped_key: &[u8],
        policy: &Policy,
        signer: &SecureEcPrivateKey,
    ) -> Result<Self, CryptoError> {
        let binding = crypto::policy_binding_hash(policy)?;
        let mut message = Vec::with_capacity(wrapped_key.len() + binding.len());
        message.extend_from_slice(wrapped_key);
        message.extend_from_slice(&binding);
        let signature = crypto::sign_es256(signer, &message)?;

        Ok(Self {
            id: id.to_string(),
            url: url.to_string(),
            kid: kid.to_string(),
            wrapped_key: crypto::base64_encode(wrapped_key),
            policy_binding: crypto::base64_encode(&binding),
            signature: KaoSignature {
                alg: SignatureAlgorithm::Es256.as_str().to_string(),
                sig: crypto::base64_encode(&signature),
            },
            split_id: None,
            split_mode: None,
        })
    }

    pub fn with_split(mut self, split_id: &str, mode: SplitMode) -> Self {
        self.split_id = Some(split_id.to_string());
        self.split_mode = Some(mode);
        self
    }
}

/// Minimal JWK accepted for the client's ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientPublicKey {
    Pem(String),
    Jwk(ClientJwk),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewrapRequest {
    pub client_public_key: ClientPublicKey,
    pub key_access_objects: Vec<KeyAccessObject>,
    pub policy: Policy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    pub kao_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewrapResponse {
    /// Standard base64 of the DEK sealed for the client key.
    pub encrypted_key: String,
    /// PEM of the ephemeral key used for EC clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_public_key: Option<String>,
    pub metadata: ResponseMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification_ordering() {
        assert!(Classification::TopSecret > Classification::Secret);
        assert!(Classification::Secret > Classification::Confidential);
        assert!(Classification::Confidential > Classification::Unclassified);
    }

    #[test]
    fn test_policy_wire_names() {
        let policy: Policy = serde_json::from_value(json!({
            "classification": "TOP_SECRET",
            "releasabilityTo": ["USA", "GBR"],
            "COI": ["FVEY"],
            "creationDate": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(policy.classification, Classification::TopSecret);
        assert!(policy.releasability_to.contains("GBR"));
        assert_eq!(policy.coi.as_ref().map(|c| c.len()), Some(1));

        let back = serde_json::to_value(&policy).unwrap();
        assert!(back.get("COI").is_some());
        assert!(back.get("releasabilityTo").is_some());
    }

    #[test]
    fn test_client_key_accepts_pem_or_jwk() {
        let pem: ClientPublicKey = serde_json::from_value(json!("-----BEGIN PUBLIC KEY-----")).unwrap();
        assert!(matches!(pem, ClientPublicKey::Pem(_)));

        let jwk: ClientPublicKey =
            serde_json::from_value(json!({"kty": "EC", "crv": "P-256", "x": "a", "y": "b"})).unwrap();
        assert!(matches!(jwk, ClientPublicKey::Jwk(ClientJwk { ref kty, .. }) if kty == "EC"));
    }

    #[test]
    fn test_split_mode_wire_names() {
        assert_eq!(serde_json::to_value(SplitMode::AllOf).unwrap(), json!("allOf"));
        assert_eq!(serde_json::to_value(SplitMode::AnyOf).unwrap(), json!("anyOf"));
    }
}
