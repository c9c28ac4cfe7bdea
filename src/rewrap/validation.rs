//! Shape checks run before any cryptography or network I/O.

use std::collections::{HashMap, HashSet};

use crate::federation::registry::normalize_kas_url;
use crate::modules::crypto::{self, ClientKey, SignatureAlgorithm};
use crate::rewrap::combiner::MIN_ALL_OF_SHARES;
use crate::rewrap::error::RewrapError;
use crate::rewrap::types::{KeyAccessObject, Policy, RewrapRequest, SplitMode};

pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;
pub const MAX_KEY_ACCESS_OBJECTS: usize = 10;

/// A KAO whose fields have been decoded and checked.
#[derive(Debug, Clone)]
pub struct ValidatedKao {
    pub id: String,
    /// Normalized KAS URL.
    pub url: String,
    pub kid: String,
    pub wrapped_key: Vec<u8>,
    pub policy_binding: Vec<u8>,
    pub signature_alg: SignatureAlgorithm,
    pub signature: Vec<u8>,
    pub split: Option<(String, SplitMode)>,
    pub is_local: bool,
    /// Wire form, forwarded unchanged to peers.
    pub raw: KeyAccessObject,
}

impl ValidatedKao {
    /// `wrappedKey || policyBinding`, the message covered by the KAO signature.
    pub fn signed_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(self.wrapped_key.len() + self.policy_binding.len());
        message.extend_from_slice(&self.wrapped_key);
        message.extend_from_slice(&self.policy_binding);
        message
    }
}

/// KAOs grouped for key recovery. Each `splitId` forms one group; a KAO
/// without one stands alone.
#[derive(Debug, Clone)]
pub enum KaoGroup {
    Single(ValidatedKao),
    Split {
        split_id: String,
        mode: SplitMode,
        members: Vec<ValidatedKao>,
    },
}

impl KaoGroup {
    pub fn members(&self) -> &[ValidatedKao] {
        match self {
            KaoGroup::Single(kao) => std::slice::from_ref(kao),
            KaoGroup::Split { members, .. } => members,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub client_key: ClientKey,
    pub policy: Policy,
    pub kaos: Vec<ValidatedKao>,
    pub groups: Vec<KaoGroup>,
    pub encrypted_metadata: Option<Vec<u8>>,
}

impl ValidatedRequest {
    pub fn kao_ids(&self) -> Vec<String> {
        self.kaos.iter().map(|k| k.id.clone()).collect()
    }
}

/// Enforce the size ceiling and parse the JSON body.
pub fn parse_request(body: &[u8]) -> Result<RewrapRequest, RewrapError> {
    check_size(body)?;
    serde_json::from_slice(body)
        .map_err(|e| RewrapError::MalformedRequest(format!("invalid JSON body: {}", e)))
}

pub fn check_size(body: &[u8]) -> Result<(), RewrapError> {
    if body.len() > MAX_REQUEST_BYTES {
        return Err(RewrapError::PayloadTooLarge {
            size: body.len(),
            max: MAX_REQUEST_BYTES,
        });
    }
    Ok(())
}

pub fn validate_request(
    request: &RewrapRequest,
    local_kas_url: &str,
) -> Result<ValidatedRequest, RewrapError> {
    let count = request.key_access_objects.len();
    if count == 0 {
        return Err(RewrapError::MalformedRequest(
            "at least one key access object is required".to_string(),
        ));
    }
    if count > MAX_KEY_ACCESS_OBJECTS {
        return Err(RewrapError::MalformedRequest(format!(
            "{} key access objects exceeds the limit of {}",
            count, MAX_KEY_ACCESS_OBJECTS
        )));
    }

    validate_policy(&request.policy)?;

    let client_key = ClientKey::parse(&request.client_public_key)
        .map_err(|e| RewrapError::MalformedRequest(format!("clientPublicKey: {}", e)))?;

    let mut seen = HashSet::new();
    let mut kaos = Vec::with_capacity(count);
    for raw in &request.key_access_objects {
        if !seen.insert(raw.id.as_str()) {
            return Err(RewrapError::MalformedRequest(format!(
                "duplicate key access object id {}",
                raw.id
            )));
        }
        kaos.push(validate_key_access_object(raw, local_kas_url)?);
    }

    let groups = group_key_access_objects(&kaos)?;

    let encrypted_metadata = match &request.encrypted_metadata {
        Some(encoded) => Some(
            crypto::base64_decode(encoded)
                .map_err(|_| RewrapError::MalformedRequest("encryptedMetadata is not base64".into()))?,
        ),
        None => None,
    };

    Ok(ValidatedRequest {
        client_key,
        policy: request.policy.clone(),
        kaos,
        groups,
        encrypted_metadata,
    })
}

pub fn validate_policy(policy: &Policy) -> Result<(), RewrapError> {
    if policy.releasability_to.is_empty() {
        return Err(RewrapError::MalformedRequest(
            "policy.releasabilityTo must not be empty".to_string(),
        ));
    }
    if let Some(code) = policy
        .releasability_to
        .iter()
        .find(|c| !is_country_code(c))
    {
        return Err(RewrapError::MalformedRequest(format!(
            "invalid country code {:?} in releasabilityTo",
            code
        )));
    }
    if let Some(coi) = &policy.coi {
        if coi.iter().any(|c| c.trim().is_empty()) {
            return Err(RewrapError::MalformedRequest(
                "policy.COI entries must not be blank".to_string(),
            ));
        }
    }
    Ok(())
}

fn is_country_code(code: &str) -> bool {
    (2..=3).contains(&code.len()) && code.bytes().all(|b| b.is_ascii_uppercase())
}

/// Decode and check a single KAO.
pub fn validate_key_access_object(
    raw: &KeyAccessObject,
    local_kas_url: &str,
) -> Result<ValidatedKao, RewrapError> {
    let malformed = |what: &str| {
        RewrapError::MalformedRequest(format!("key access object {}: {}", raw.id, what))
    };

    if raw.id.trim().is_empty() {
        return Err(RewrapError::MalformedRequest(
            "key access object id must not be empty".to_string(),
        ));
    }
    if raw.kid.trim().is_empty() {
        return Err(malformed("kid must not be empty"));
    }

    let url = normalize_kas_url(&raw.url).ok_or_else(|| malformed("url must be an absolute https URL"))?;
    let is_local = normalize_kas_url(local_kas_url).as_deref() == Some(url.as_str());
    // The local URL is never dialled, so only peers are held to this.
    if !is_local && is_loopback_url(&url) {
        return Err(malformed("url must not point at a loopback address"));
    }

    let wrapped_key = decode_field(&raw.wrapped_key).ok_or_else(|| malformed("wrappedKey is not base64"))?;
    let policy_binding =
        decode_field(&raw.policy_binding).ok_or_else(|| malformed("policyBinding is not base64"))?;
    let signature = decode_field(&raw.signature.sig).ok_or_else(|| malformed("signature is not base64"))?;
    let signature_alg = SignatureAlgorithm::parse(&raw.signature.alg)
        .map_err(|_| malformed("signature alg must be ES256 or ES384"))?;

    let split = match (&raw.split_id, raw.split_mode) {
        (Some(id), Some(mode)) if !id.trim().is_empty() => Some((id.clone(), mode)),
        (None, None) => None,
        (Some(_), Some(_)) => return Err(malformed("splitId must not be empty")),
        (Some(_), None) => return Err(malformed("splitId requires splitMode")),
        (None, Some(_)) => return Err(malformed("splitMode requires splitId")),
    };

    Ok(ValidatedKao {
        id: raw.id.clone(),
        url,
        kid: raw.kid.clone(),
        wrapped_key,
        policy_binding,
        signature_alg,
        signature,
        split,
        is_local,
        raw: raw.clone(),
    })
}

fn decode_field(value: &str) -> Option<Vec<u8>> {
    crypto::base64_decode(value).ok().filter(|bytes| !bytes.is_empty())
}

fn is_loopback_url(normalized: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(normalized) else {
        return true;
    };
    let Some(host) = parsed.host_str() else {
        return true;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost") {
        return true;
    }
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

/// Group KAOs by `splitId`, preserving first-appearance order. Members of
/// one group must agree on `splitMode`, and an allOf group needs at least
/// two members.
pub fn group_key_access_objects(kaos: &[ValidatedKao]) -> Result<Vec<KaoGroup>, RewrapError> {
    let mut groups: Vec<KaoGroup> = Vec::new();
    let mut index_by_split: HashMap<String, usize> = HashMap::new();

    for kao in kaos {
        let Some((split_id, mode)) = &kao.split else {
            groups.push(KaoGroup::Single(kao.clone()));
            continue;
        };
        match index_by_split.get(split_id) {
            Some(&index) => {
                if let KaoGroup::Split {
                    mode: group_mode,
                    members,
                    ..
                } = &mut groups[index]
                {
                    if *group_mode != *mode {
                        return Err(RewrapError::MalformedRequest(format!(
                            "split {} mixes allOf and anyOf members",
                            split_id
                        )));
                    }
                    members.push(kao.clone());
                }
            }
            None => {
                index_by_split.insert(split_id.clone(), groups.len());
                groups.push(KaoGroup::Split {
                    split_id: split_id.clone(),
                    mode: *mode,
                    members: vec![kao.clone()],
                });
            }
        }
    }

    for group in &groups {
        if let KaoGroup::Split {
            split_id,
            mode: SplitMode::AllOf,
            members,
        } = group
        {
            if members.len() < MIN_ALL_OF_SHARES {
                return Err(RewrapError::MalformedRequest(format!(
                    "allOf split {} has {} member(s), needs at least {}",
                    split_id,
                    members.len(),
                    MIN_ALL_OF_SHARES
                )));
            }
        }
    }
    Ok(groups)
}
