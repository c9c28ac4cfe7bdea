use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, Key, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use ecdsa::signature::{Signer, Verifier};
use elliptic_curve::sec1::ToEncodedPoint;
use hkdf::Hkdf;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPublicKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::modules::secure_keys::SecureEcPrivateKey;
use crate::rewrap::types::{ClientJwk, ClientPublicKey, Policy};

/// Domain label hashed into the HKDF salt for client rewraps
pub const REWRAP_SALT_LABEL: &[u8] = b"KAS-REWRAP-V1";
/// HKDF info for the key sealed to the client
pub const REWRAP_INFO: &[u8] = b"kas-rewrap";
/// HKDF info for the encrypted-metadata envelope
pub const METADATA_INFO: &[u8] = b"kas-metadata";

pub const NONCE_LEN: usize = 12;
const COMPRESSED_POINT_LEN: usize = 33;
const MIN_RSA_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Signature algorithms accepted on KAOs and peer responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Es256,
    Es384,
}

impl SignatureAlgorithm {
    pub fn parse(alg: &str) -> Result<Self, CryptoError> {
        match alg {
            "ES256" => Ok(SignatureAlgorithm::Es256),
            "ES384" => Ok(SignatureAlgorithm::Es384),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Es256 => "ES256",
            SignatureAlgorithm::Es384 => "ES384",
        }
    }
}

/// Computes the HKDF salt used when sealing keys for clients.
/// salt = SHA256(REWRAP_SALT_LABEL)
pub fn compute_rewrap_salt() -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(REWRAP_SALT_LABEL);
    hasher.finalize().into()
}

// ==================== Policy Binding ====================

/// Serializes a JSON value with object keys in lexicographic order and no
/// insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical serialization of `policy`.
pub fn policy_binding_hash(policy: &Policy) -> Result<[u8; 32], CryptoError> {
    let value =
        serde_json::to_value(policy).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    Ok(Sha256::digest(canonical_json(&value).as_bytes()).into())
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

// ==================== Signatures ====================

/// A public key trusted to sign KAOs or peer responses.
#[derive(Debug, Clone)]
pub enum TrustedKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
}

impl TrustedKey {
    /// Parse an SPKI PEM holding either a P-256 or P-384 key.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(TrustedKey::P256(key));
        }
        p384::ecdsa::VerifyingKey::from_public_key_pem(pem)
            .map(TrustedKey::P384)
            .map_err(|e| CryptoError::InvalidKey(format!("expected P-256 or P-384 SPKI: {}", e)))
    }

    pub fn from_p256(public_key: &PublicKey) -> Self {
        TrustedKey::P256(p256::ecdsa::VerifyingKey::from(*public_key))
    }

    /// Verify `signature` over `message`. The signature may be raw `r||s`
    /// or DER encoded.
    pub fn verify(
        &self,
        alg: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        match (self, alg) {
            (TrustedKey::P256(key), SignatureAlgorithm::Es256) => {
                let sig = p256::ecdsa::Signature::from_slice(signature)
                    .or_else(|_| p256::ecdsa::Signature::from_der(signature))
                    .map_err(|e| CryptoError::InvalidSignature(format!("ES256 encoding: {}", e)))?;
                key.verify(message, &sig)
                    .map_err(|_| CryptoError::InvalidSignature("ES256 verification failed".into()))
            }
            (TrustedKey::P384(key), SignatureAlgorithm::Es384) => {
                let sig = p384::ecdsa::Signature::from_slice(signature)
                    .or_else(|_| p384::ecdsa::Signature::from_der(signature))
                    .map_err(|e| CryptoError::InvalidSignature(format!("ES384 encoding: {}", e)))?;
                key.verify(message, &sig)
                    .map_err(|_| CryptoError::InvalidSignature("ES384 verification failed".into()))
            }
            (_, alg) => Err(CryptoError::InvalidSignature(format!(
                "{} does not match the signer key curve",
                alg.as_str()
            ))),
        }
    }
}

/// ES256 signature as raw 64-byte `r||s`.
pub fn sign_es256(signer: &SecureEcPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let signing_key = signer
        .signing_key()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let signature: p256::ecdsa::Signature = signing_key.sign(message);
    Ok(signature.to_bytes().to_vec())
}

// ==================== Client Keys ====================

/// Ephemeral public key supplied by the client for the rewrapped DEK.
#[derive(Debug, Clone)]
pub enum ClientKey {
    P256(PublicKey),
    Rsa(RsaPublicKey),
}

impl ClientKey {
    pub fn parse(key: &ClientPublicKey) -> Result<Self, CryptoError> {
        match key {
            ClientPublicKey::Pem(pem) => Self::from_pem(pem),
            ClientPublicKey::Jwk(jwk) => Self::from_jwk(jwk),
        }
    }

    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        if let Ok(key) = PublicKey::from_public_key_pem(pem) {
            return Ok(ClientKey::P256(key));
        }
        let key = RsaPublicKey::from_public_key_pem(pem).map_err(|e| {
            CryptoError::InvalidKey(format!("expected P-256 or RSA SPKI PEM: {}", e))
        })?;
        Self::checked_rsa(key)
    }

    pub fn from_jwk(jwk: &ClientJwk) -> Result<Self, CryptoError> {
        match jwk.kty.as_str() {
            "EC" => {
                if jwk.crv.as_deref() != Some("P-256") {
                    return Err(CryptoError::InvalidKey("EC JWK must use P-256".into()));
                }
                let x = decode_coordinate(jwk.x.as_deref(), "x")?;
                let y = decode_coordinate(jwk.y.as_deref(), "y")?;

                // Uncompressed point: 0x04 || x || y
                let mut point = Vec::with_capacity(65);
                point.push(0x04);
                point.extend_from_slice(&x);
                point.extend_from_slice(&y);
                PublicKey::from_sec1_bytes(&point)
                    .map(ClientKey::P256)
                    .map_err(|_| CryptoError::InvalidKey("point is not on P-256".into()))
            }
            "RSA" => {
                let n = base64url_decode(jwk.n.as_deref().unwrap_or_default())
                    .map_err(|_| CryptoError::InvalidKey("RSA modulus is not base64url".into()))?;
                let e = base64url_decode(jwk.e.as_deref().unwrap_or_default())
                    .map_err(|_| CryptoError::InvalidKey("RSA exponent is not base64url".into()))?;
                let key = RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
                Self::checked_rsa(key)
            }
            other => Err(CryptoError::InvalidKey(format!("unsupported kty {}", other))),
        }
    }

    fn checked_rsa(key: RsaPublicKey) -> Result<Self, CryptoError> {
        if key.size() * 8 < MIN_RSA_BITS {
            return Err(CryptoError::InvalidKey(format!(
                "RSA key must be at least {} bits",
                MIN_RSA_BITS
            )));
        }
        Ok(ClientKey::Rsa(key))
    }
}

fn decode_coordinate(value: Option<&str>, name: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = value
        .ok_or_else(|| CryptoError::InvalidKey(format!("EC JWK missing {}", name)))
        .and_then(|v| {
            base64url_decode(v)
                .map_err(|_| CryptoError::InvalidKey(format!("{} is not base64url", name)))
        })?;
    if bytes.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "{} must be 32 bytes, got {}",
            name,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// DEK sealed for a client.
#[derive(Debug, Clone)]
pub struct SealedKey {
    pub encrypted_key: Vec<u8>,
    pub session_public_key: Option<String>,
}

/// Seal `dek` for the client key.
///
/// EC clients: ephemeral ECDH, HKDF-SHA256 with [`REWRAP_INFO`], then
/// AES-256-GCM; output is `nonce || ciphertext` plus the ephemeral public key.
/// RSA clients: RSA-OAEP with SHA-256.
pub fn seal_for_client(dek: &[u8], client: &ClientKey) -> Result<SealedKey, CryptoError> {
    match client {
        ClientKey::P256(client_public) => {
            let ephemeral = SecretKey::random(&mut OsRng);
            let shared = custom_ecdh(&ephemeral, client_public);
            let key = derive_aead_key(&shared, &compute_rewrap_salt(), REWRAP_INFO)?;
            let encrypted_key = aead_seal(&key, dek, &[])?;
            let session_public_key = public_key_to_pem(&ephemeral.public_key())?;
            Ok(SealedKey {
                encrypted_key,
                session_public_key: Some(session_public_key),
            })
        }
        ClientKey::Rsa(client_public) => {
            let encrypted_key = client_public
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), dek)
                .map_err(|e| CryptoError::Encryption(e.to_string()))?;
            Ok(SealedKey {
                encrypted_key,
                session_public_key: None,
            })
        }
    }
}

/// Client-side inverse of [`seal_for_client`] for EC keys.
pub fn open_for_client(
    client_secret: &SecretKey,
    session_public_pem: &str,
    encrypted_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let session_public = parse_pem_public_key(session_public_pem)?;
    let shared = custom_ecdh(client_secret, &session_public);
    let key = derive_aead_key(&shared, &compute_rewrap_salt(), REWRAP_INFO)?;
    aead_open(&key, encrypted_key, &[])
}

// ==================== Encrypted Metadata ====================

/// Seal metadata for a KAS. Layout: compressed ephemeral point (33 bytes)
/// || nonce (12 bytes) || AES-256-GCM ciphertext.
pub fn seal_metadata(kas_public: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let shared = custom_ecdh(&ephemeral, kas_public);
    let key = derive_aead_key(&shared, &compute_rewrap_salt(), METADATA_INFO)?;

    let ephemeral_point = ephemeral.public_key().to_encoded_point(true);
    let mut out = ephemeral_point.as_bytes().to_vec();
    out.extend_from_slice(&aead_seal(&key, plaintext, ephemeral_point.as_bytes())?);
    Ok(out)
}

pub fn open_metadata(
    kas_key: &SecureEcPrivateKey,
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if blob.len() < COMPRESSED_POINT_LEN + NONCE_LEN {
        return Err(CryptoError::Decryption("metadata envelope too short".into()));
    }
    let (point, sealed) = blob.split_at(COMPRESSED_POINT_LEN);
    let ephemeral = PublicKey::from_sec1_bytes(point)
        .map_err(|_| CryptoError::Decryption("metadata ephemeral key invalid".into()))?;
    let shared = kas_key
        .perform_ecdh(&ephemeral)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    let key = derive_aead_key(shared.as_slice(), &compute_rewrap_salt(), METADATA_INFO)?;
    aead_open(&key, sealed, point)
}

// ==================== Primitives ====================

/// Performs ECDH key agreement and returns the x-coordinate of the shared
/// point (32 bytes for P-256).
pub fn custom_ecdh(private_key: &SecretKey, public_key: &PublicKey) -> Zeroizing<Vec<u8>> {
    use elliptic_curve::point::AffineCoordinates;
    let scalar = private_key.to_nonzero_scalar();
    let shared_point = (public_key.to_projective() * *scalar).to_affine();
    Zeroizing::new(shared_point.x().to_vec())
}

fn derive_aead_key(
    shared_secret: &[u8],
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut derived = Zeroizing::new([0u8; 32]);
    hkdf.expand(info, &mut *derived)
        .map_err(|e| CryptoError::Encryption(format!("HKDF expansion failed: {}", e)))?;
    Ok(derived)
}

/// AES-256-GCM with a random nonce; returns `nonce || ciphertext+tag`.
pub fn aead_seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn aead_open(
    key: &[u8; 32],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Decryption("ciphertext shorter than nonce".into()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decryption("authentication tag mismatch".into()))
}

// ==================== Utility Functions ====================

/// Parse a PEM-formatted P-256 public key (SPKI)
pub fn parse_pem_public_key(pem: &str) -> Result<PublicKey, CryptoError> {
    PublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Convert a P-256 public key to SPKI PEM
pub fn public_key_to_pem(public_key: &PublicKey) -> Result<String, CryptoError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// Wrap DER bytes as a `PUBLIC KEY` PEM block
pub fn der_to_public_key_pem(der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("PUBLIC KEY", der.to_vec()))
}

/// Base64 encode data using standard encoding
pub fn base64_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(data)
}

/// Base64 decode data using standard encoding
pub fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.decode(data)
}

pub fn base64url_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.encode(data)
}

pub fn base64url_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.decode(data.trim_end_matches('='))
}
