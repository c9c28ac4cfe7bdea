//! Secure key handling with automatic zeroization.
//!
//! The KAS holds two long-lived P-256 keys: one signs KAOs and peer
//! responses, the other opens encrypted metadata. Both live behind
//! [`SecureEcPrivateKey`] so the scalar is zeroized on drop and never
//! printed.

use elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use rand_core::OsRng;
use secrecy::{ExposeSecret, Secret};
use std::fmt;
use zeroize::Zeroizing;

/// Error type for key operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key size: expected {expected}, got {got}")]
    InvalidKeySize { expected: usize, got: usize },

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),
}

/// Secure wrapper for a KAS EC private key (P-256).
///
/// The key material is automatically zeroized when dropped.
pub struct SecureEcPrivateKey {
    inner: Secret<[u8; 32]>,
}

impl SecureEcPrivateKey {
    /// Create from raw bytes.
    ///
    /// # Security
    /// The input bytes are copied and the original should be zeroized by the caller.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::InvalidKeySize {
                expected: 32,
                got: bytes.len(),
            });
        }
        // Reject zero and out-of-range scalars up front.
        SecretKey::from_slice(bytes).map_err(|e| KeyError::InvalidFormat(e.to_string()))?;

        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(bytes);

        Ok(Self {
            inner: Secret::new(key_array),
        })
    }

    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let bytes = Zeroizing::new(secret.to_bytes());
        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(bytes.as_slice());
        Self {
            inner: Secret::new(key_array),
        }
    }

    /// Create from a PEM block, either SEC1 (`EC PRIVATE KEY`) or PKCS#8
    /// (`PRIVATE KEY`).
    pub fn from_pem(pem_content: &str) -> Result<Self, KeyError> {
        let parsed = pem::parse(pem_content.as_bytes())
            .map_err(|e| KeyError::InvalidFormat(e.to_string()))?;

        let secret_key = match parsed.tag() {
            "EC PRIVATE KEY" => SecretKey::from_sec1_der(parsed.contents())
                .map_err(|e| KeyError::InvalidFormat(e.to_string()))?,
            "PRIVATE KEY" => SecretKey::from_pkcs8_der(parsed.contents())
                .map_err(|e| KeyError::InvalidFormat(e.to_string()))?,
            other => {
                return Err(KeyError::InvalidFormat(format!(
                    "Expected EC PRIVATE KEY or PRIVATE KEY, got {}",
                    other
                )))
            }
        };

        let bytes = Zeroizing::new(secret_key.to_bytes());
        Self::from_bytes(bytes.as_slice())
    }

    pub fn public_key(&self) -> Result<p256::PublicKey, KeyError> {
        Ok(self.as_secret_key()?.public_key())
    }

    /// Compressed SEC1 public key (33 bytes).
    pub fn public_key_compressed(&self) -> Result<Vec<u8>, KeyError> {
        let public_key = self.public_key()?;
        Ok(public_key.to_encoded_point(true).as_bytes().to_vec())
    }

    /// Perform ECDH key agreement.
    ///
    /// Returns the x-coordinate of the shared point (32 bytes).
    pub fn perform_ecdh(&self, peer_public: &p256::PublicKey) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        use elliptic_curve::point::AffineCoordinates;

        let secret_key = self.as_secret_key()?;
        let scalar = secret_key.to_nonzero_scalar();
        let shared_point = (peer_public.to_projective() * *scalar).to_affine();

        let mut result = Zeroizing::new([0u8; 32]);
        result.copy_from_slice(shared_point.x().as_slice());
        Ok(result)
    }

    pub fn signing_key(&self) -> Result<p256::ecdsa::SigningKey, KeyError> {
        Ok(p256::ecdsa::SigningKey::from(&self.as_secret_key()?))
    }

    /// Get the raw p256 SecretKey for low-level operations.
    ///
    /// # Security
    /// Use with caution - the returned key should not be stored or logged.
    pub fn as_secret_key(&self) -> Result<SecretKey, KeyError> {
        SecretKey::from_bytes(self.inner.expose_secret().into())
            .map_err(|e| KeyError::CryptoError(e.to_string()))
    }
}

impl fmt::Debug for SecureEcPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureEcPrivateKey([REDACTED])")
    }
}

impl Clone for SecureEcPrivateKey {
    fn clone(&self) -> Self {
        let mut new_bytes = [0u8; 32];
        new_bytes.copy_from_slice(self.inner.expose_secret());
        Self {
            inner: Secret::new(new_bytes),
        }
    }
}
