//! Peer KAS registry: maps a normalised KAS URL to its identity and the
//! trust material used to authenticate it.

use std::collections::HashMap;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::federation::FederationError;
use crate::modules::crypto::TrustedKey;

/// Canonical form of a KAS URL: lowercase scheme and host, explicit port
/// only when non-default, path without trailing slash, no query or
/// fragment. Only `https` URLs are accepted.
pub fn normalize_kas_url(raw: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(raw.trim()).ok()?;
    if parsed.scheme() != "https" {
        return None;
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return None;
    }
    let host = parsed.host_str()?;

    let mut normalized = format!("https://{}", host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(parsed.path().trim_end_matches('/'));
    Some(normalized)
}

/// Registry entry as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerKas {
    pub kas_id: String,
    pub url: String,
    pub signing_public_key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate_pem: Option<String>,
}

/// Resolved peer with parsed trust material.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub kas_id: String,
    pub url: String,
    pub verifying_key: TrustedKey,
}

#[derive(Debug, Default)]
pub struct FederationRegistry {
    peers: HashMap<String, PeerRecord>,
    ca_certificates: Vec<String>,
}

impl FederationRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_peers(peers: Vec<PeerKas>) -> Result<Self, FederationError> {
        let mut registry = Self::default();
        for peer in peers {
            let url = normalize_kas_url(&peer.url).ok_or_else(|| {
                FederationError::Registry(format!("{}: url must be https", peer.kas_id))
            })?;
            let verifying_key = TrustedKey::from_pem(&peer.signing_public_key_pem).map_err(|e| {
                FederationError::Registry(format!("{}: signing key: {}", peer.kas_id, e))
            })?;
            if let Some(ca) = peer.ca_certificate_pem {
                registry.ca_certificates.push(ca);
            }
            let record = PeerRecord {
                kas_id: peer.kas_id,
                url: url.clone(),
                verifying_key,
            };
            if registry.peers.insert(url.clone(), record).is_some() {
                return Err(FederationError::Registry(format!(
                    "duplicate registry entry for {}",
                    url
                )));
            }
        }
        Ok(registry)
    }

    /// Load a JSON array of [`PeerKas`] entries.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FederationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FederationError::Registry(format!("failed to read {}: {}", path.display(), e))
        })?;
        let peers: Vec<PeerKas> = serde_json::from_str(&contents).map_err(|e| {
            FederationError::Registry(format!("failed to parse {}: {}", path.display(), e))
        })?;
        let registry = Self::from_peers(peers)?;
        info!(
            "Loaded federation registry from {} ({} peers)",
            path.display(),
            registry.len()
        );
        Ok(registry)
    }

    /// Look up a peer by any URL form; the argument is normalised first.
    pub fn lookup(&self, url: &str) -> Option<&PeerRecord> {
        normalize_kas_url(url).and_then(|normalized| self.peers.get(&normalized))
    }

    /// Extra CA certificates (PEM) peers may present.
    pub fn ca_certificates(&self) -> &[String] {
        &self.ca_certificates
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
