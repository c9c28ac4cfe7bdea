use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::modules::crypto::{self, ClientKey, CryptoError, SignatureAlgorithm, TrustedKey};
use crate::modules::secure_keys::SecureEcPrivateKey;
use crate::rewrap::types::{KaoSignature, KeyAccessObject, Policy};

const REQUEST_LABEL: &[u8] = b"kas-peer-unwrap-request-v1";
const RESPONSE_LABEL: &[u8] = b"kas-peer-unwrap-response-v1";

/// Body of `POST /federation/unwrap`.
///
/// Signed by the requesting KAS with the key listed for it in the
/// federation registry. The share comes back sealed to
/// `sessionPublicKey`, so it never crosses the wire in the clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerUnwrapRequest {
    pub request_id: String,
    /// Canonical URL of the requesting KAS.
    pub requester: String,
    pub kao: KeyAccessObject,
    pub policy: Policy,
    /// Requester's ephemeral P-256 key, SPKI PEM.
    pub session_public_key: String,
    /// ES256 over the length-prefixed request fields.
    pub signature: KaoSignature,
}

impl PeerUnwrapRequest {
    pub fn sign(
        request_id: &str,
        requester: &str,
        kao: &KeyAccessObject,
        policy: &Policy,
        session_public_key: &PublicKey,
        signer: &SecureEcPrivateKey,
    ) -> Result<Self, CryptoError> {
        let mut request = Self {
            request_id: request_id.to_string(),
            requester: requester.to_string(),
            kao: kao.clone(),
            policy: policy.clone(),
            session_public_key: crypto::public_key_to_pem(session_public_key)?,
            signature: KaoSignature {
                alg: SignatureAlgorithm::Es256.as_str().to_string(),
                sig: String::new(),
            },
        };
        let sig = crypto::sign_es256(signer, &request.signed_message()?)?;
        request.signature.sig = crypto::base64_encode(&sig);
        Ok(request)
    }

    /// Check the request was signed by `key`, the registry key of
    /// `requester`.
    pub fn verify(&self, key: &TrustedKey) -> Result<(), CryptoError> {
        let sig = crypto::base64_decode(&self.signature.sig)
            .map_err(|e| CryptoError::Serialization(format!("signature: {}", e)))?;
        let alg = SignatureAlgorithm::parse(&self.signature.alg)?;
        key.verify(alg, &self.signed_message()?, &sig)
    }

    /// Length-prefixed request id, requester, KAO identity and wrapped
    /// key, the hash of the policy and the session key.
    fn signed_message(&self) -> Result<Vec<u8>, CryptoError> {
        let policy_hash = crypto::policy_binding_hash(&self.policy)?;
        Ok(framed(
            REQUEST_LABEL,
            &[
                self.request_id.as_bytes(),
                self.requester.as_bytes(),
                self.kao.id.as_bytes(),
                self.kao.url.as_bytes(),
                self.kao.kid.as_bytes(),
                self.kao.wrapped_key.as_bytes(),
                self.kao.policy_binding.as_bytes(),
                &policy_hash,
                self.session_public_key.as_bytes(),
            ],
        ))
    }
}

/// Unwrap result returned by a peer KAS: the share sealed to the
/// requester's session key, signed by the responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerUnwrapResponse {
    pub kao_id: String,
    /// Standard base64 of `nonce || ciphertext`.
    pub encrypted_share: String,
    /// Responder's ephemeral P-256 key for the seal, SPKI PEM.
    pub session_public_key: String,
    pub policy_binding: String,
    /// ES256 over `kaoId`, the sealed share, the session key and the binding.
    pub signature: KaoSignature,
}

impl PeerUnwrapResponse {
    /// Seal `share` to the requester's session key and sign the result.
    pub fn seal(
        kao_id: &str,
        share: &[u8],
        policy_binding: &[u8],
        requester_session: &PublicKey,
        signer: &SecureEcPrivateKey,
    ) -> Result<Self, CryptoError> {
        let sealed = crypto::seal_for_client(share, &ClientKey::P256(*requester_session))?;
        let session_public_key = sealed
            .session_public_key
            .ok_or_else(|| CryptoError::Encryption("EC seal produced no session key".into()))?;
        let message = response_message(
            kao_id,
            &sealed.encrypted_key,
            &session_public_key,
            policy_binding,
        );
        let sig = crypto::sign_es256(signer, &message)?;
        Ok(Self {
            kao_id: kao_id.to_string(),
            encrypted_share: crypto::base64_encode(&sealed.encrypted_key),
            session_public_key,
            policy_binding: crypto::base64_encode(policy_binding),
            signature: KaoSignature {
                alg: SignatureAlgorithm::Es256.as_str().to_string(),
                sig: crypto::base64_encode(&sig),
            },
        })
    }

    /// Check the response belongs to `kao_id`, carries the expected policy
    /// binding and is signed by `key`, then open the share with the
    /// requester's session secret.
    pub fn open(
        &self,
        kao_id: &str,
        expected_binding: &[u8],
        key: &TrustedKey,
        session: &SecretKey,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if self.kao_id != kao_id {
            return Err(CryptoError::InvalidSignature(format!(
                "response is for {}, expected {}",
                self.kao_id, kao_id
            )));
        }
        let binding = crypto::base64_decode(&self.policy_binding)
            .map_err(|e| CryptoError::Serialization(format!("policyBinding: {}", e)))?;
        if !crypto::constant_time_eq(&binding, expected_binding) {
            return Err(CryptoError::InvalidSignature(
                "policy binding differs from the request".to_string(),
            ));
        }
        let encrypted = crypto::base64_decode(&self.encrypted_share)
            .map_err(|e| CryptoError::Serialization(format!("encryptedShare: {}", e)))?;
        let sig = crypto::base64_decode(&self.signature.sig)
            .map_err(|e| CryptoError::Serialization(format!("signature: {}", e)))?;
        let alg = SignatureAlgorithm::parse(&self.signature.alg)?;

        let message = response_message(kao_id, &encrypted, &self.session_public_key, &binding);
        key.verify(alg, &message, &sig)?;
        crypto::open_for_client(session, &self.session_public_key, &encrypted)
    }
}

fn response_message(
    kao_id: &str,
    encrypted_share: &[u8],
    session_public_key: &str,
    policy_binding: &[u8],
) -> Vec<u8> {
    framed(
        RESPONSE_LABEL,
        &[
            kao_id.as_bytes(),
            encrypted_share,
            session_public_key.as_bytes(),
            policy_binding,
        ],
    )
}

/// `label || (u32 BE length || field)*`
fn framed(label: &[u8], fields: &[&[u8]]) -> Vec<u8> {
    let size = label.len() + fields.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut message = Vec::with_capacity(size);
    message.extend_from_slice(label);
    for field in fields {
        message.extend_from_slice(&(field.len() as u32).to_be_bytes());
        message.extend_from_slice(field);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrap::types::Classification;
    use rand_core::OsRng;
    use std::collections::BTreeSet;

    fn policy() -> Policy {
        Policy {
            classification: Classification::Secret,
            releasability_to: BTreeSet::from(["USA".to_string()]),
            coi: None,
            creation_date: None,
        }
    }

    fn trusted(signer: &SecureEcPrivateKey) -> TrustedKey {
        TrustedKey::from_p256(&signer.public_key().unwrap())
    }

    fn signed_request(signer: &SecureEcPrivateKey, session: &SecretKey) -> PeerUnwrapRequest {
        let kao_signer = SecureEcPrivateKey::generate();
        let kao = KeyAccessObject::issue(
            "kao-1",
            "https://kas.gbr.example",
            "kid-1",
            b"wrapped",
            &policy(),
            &kao_signer,
        )
        .unwrap();
        PeerUnwrapRequest::sign(
            "req-1",
            "https://kas.usa.example",
            &kao,
            &policy(),
            &session.public_key(),
            signer,
        )
        .unwrap()
    }

    #[test]
    fn test_sealed_response_opens_with_session_key() {
        let signer = SecureEcPrivateKey::generate();
        let session = SecretKey::random(&mut OsRng);
        let response =
            PeerUnwrapResponse::seal("kao-1", b"share", b"binding", &session.public_key(), &signer)
                .unwrap();

        let encrypted = crypto::base64_decode(&response.encrypted_share).unwrap();
        assert!(!encrypted.windows(5).any(|w| w == b"share"));

        let share = response
            .open("kao-1", b"binding", &trusted(&signer), &session)
            .unwrap();
        assert_eq!(share.as_slice(), b"share");
    }

    #[test]
    fn test_tampered_response_rejected() {
        let signer = SecureEcPrivateKey::generate();
        let key = trusted(&signer);
        let session = SecretKey::random(&mut OsRng);
        let mut response =
            PeerUnwrapResponse::seal("kao-1", b"share", b"binding", &session.public_key(), &signer)
                .unwrap();

        assert!(response.open("kao-2", b"binding", &key, &session).is_err());
        assert!(response.open("kao-1", b"other", &key, &session).is_err());

        let mut encrypted = crypto::base64_decode(&response.encrypted_share).unwrap();
        encrypted[0] ^= 0x01;
        response.encrypted_share = crypto::base64_encode(&encrypted);
        assert!(response.open("kao-1", b"binding", &key, &session).is_err());
    }

    #[test]
    fn test_response_needs_matching_session_and_signer() {
        let signer = SecureEcPrivateKey::generate();
        let session = SecretKey::random(&mut OsRng);
        let response =
            PeerUnwrapResponse::seal("kao-1", b"share", b"binding", &session.public_key(), &signer)
                .unwrap();

        let other_signer = trusted(&SecureEcPrivateKey::generate());
        assert!(response.open("kao-1", b"binding", &other_signer, &session).is_err());

        let other_session = SecretKey::random(&mut OsRng);
        assert!(response
            .open("kao-1", b"binding", &trusted(&signer), &other_session)
            .is_err());
    }

    #[test]
    fn test_signed_request_verifies_only_for_its_signer() {
        let signer = SecureEcPrivateKey::generate();
        let session = SecretKey::random(&mut OsRng);
        let request = signed_request(&signer, &session);

        request.verify(&trusted(&signer)).unwrap();
        assert!(request.verify(&trusted(&SecureEcPrivateKey::generate())).is_err());
    }

    #[test]
    fn test_request_fields_are_covered_by_signature() {
        let signer = SecureEcPrivateKey::generate();
        let key = trusted(&signer);
        let session = SecretKey::random(&mut OsRng);

        let mut swapped_session = signed_request(&signer, &session);
        swapped_session.session_public_key =
            crypto::public_key_to_pem(&SecretKey::random(&mut OsRng).public_key()).unwrap();
        assert!(swapped_session.verify(&key).is_err());

        let mut other_requester = signed_request(&signer, &session);
        other_requester.requester = "https://kas.fra.example".to_string();
        assert!(other_requester.verify(&key).is_err());

        let mut widened = signed_request(&signer, &session);
        widened.policy.releasability_to.insert("FRA".to_string());
        assert!(widened.verify(&key).is_err());
    }
}
