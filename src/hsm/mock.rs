//! Software HSM for development and tests.
//!
//! Each kid gets its own AES-256-GCM key and P-256 key pair, both derived
//! from a single master secret with HKDF. Wrapped keys are
//! `nonce || ciphertext+tag` with the kid as associated data.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use hkdf::Hkdf;
use log::debug;
use p256::SecretKey;
use rand_core::{OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::hsm::{HsmError, HsmProvider, KeyMaterial};
use crate::modules::crypto::{aead_open, aead_seal, public_key_to_pem};

const WRAP_INFO_PREFIX: &str = "mock-hsm:wrap:";
const EC_INFO_PREFIX: &str = "mock-hsm:ec:";

pub struct MockHsmProvider {
    master: Secret<[u8; 32]>,
    unwrap_calls: AtomicUsize,
    wrap_calls: AtomicUsize,
}

impl MockHsmProvider {
    pub fn new(master: [u8; 32]) -> Self {
        Self {
            master: Secret::new(master),
            unwrap_calls: AtomicUsize::new(0),
            wrap_calls: AtomicUsize::new(0),
        }
    }

    pub fn random() -> Self {
        let mut master = [0u8; 32];
        OsRng.fill_bytes(&mut master);
        Self::new(master)
    }

    /// Number of unwrap operations that reached this provider.
    pub fn unwrap_calls(&self) -> usize {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    pub fn wrap_calls(&self) -> usize {
        self.wrap_calls.load(Ordering::SeqCst)
    }

    fn derive(&self, prefix: &str, key_id: &str) -> Result<Zeroizing<[u8; 32]>, HsmError> {
        let hkdf = Hkdf::<Sha256>::new(None, self.master.expose_secret());
        let mut okm = Zeroizing::new([0u8; 32]);
        hkdf.expand(format!("{}{}", prefix, key_id).as_bytes(), &mut *okm)
            .map_err(|e| HsmError::Backend(format!("key derivation failed: {}", e)))?;
        Ok(okm)
    }

    fn ec_key(&self, key_id: &str) -> Result<SecretKey, HsmError> {
        let seed = self.derive(EC_INFO_PREFIX, key_id)?;
        SecretKey::from_slice(seed.as_slice()).map_err(|e| HsmError::PublicKey {
            kid: key_id.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl HsmProvider for MockHsmProvider {
    async fn unwrap(&self, wrapped_key: &[u8], key_id: &str) -> Result<KeyMaterial, HsmError> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        debug!("Mock HSM unwrap with key {}", key_id);
        let key = self.derive(WRAP_INFO_PREFIX, key_id)?;
        aead_open(&key, wrapped_key, key_id.as_bytes()).map_err(|e| HsmError::Unwrap {
            kid: key_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn wrap(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, HsmError> {
        self.wrap_calls.fetch_add(1, Ordering::SeqCst);
        let key = self.derive(WRAP_INFO_PREFIX, key_id)?;
        aead_seal(&key, plaintext, key_id.as_bytes()).map_err(|e| HsmError::Wrap {
            kid: key_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_public_key(&self, key_id: &str) -> Result<String, HsmError> {
        let secret = self.ec_key(key_id)?;
        public_key_to_pem(&secret.public_key()).map_err(|e| HsmError::PublicKey {
            kid: key_id.to_string(),
            reason: e.to_string(),
        })
    }
}
