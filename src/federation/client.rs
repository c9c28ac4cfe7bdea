use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;

use crate::federation::registry::PeerRecord;
use crate::federation::types::{PeerUnwrapRequest, PeerUnwrapResponse};
use crate::federation::FederationError;

pub const PEER_UNWRAP_PATH: &str = "/federation/unwrap";

/// Transport to a peer KAS. The response is returned as received; the
/// router verifies its signature.
#[async_trait]
pub trait RemoteKasClient: Send + Sync {
    async fn unwrap_share(
        &self,
        peer: &PeerRecord,
        request: &PeerUnwrapRequest,
        bearer_token: &str,
    ) -> Result<PeerUnwrapResponse, FederationError>;
}

/// mTLS client identity as PEM certificate chain and PKCS#8 key.
pub struct ClientIdentity {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

pub struct HttpRemoteKasClient {
    http: reqwest::Client,
}

impl HttpRemoteKasClient {
    pub fn new(
        identity: Option<ClientIdentity>,
        extra_roots: &[String],
        timeout: Duration,
    ) -> Result<Self, FederationError> {
        let mut builder = reqwest::Client::builder()
            .https_only(true)
            .timeout(timeout)
            .connect_timeout(timeout);

        if let Some(identity) = identity {
            let identity = reqwest::Identity::from_pkcs8_pem(
                &identity.certificate_pem,
                &identity.private_key_pem,
            )
            .map_err(|e| FederationError::Registry(format!("client identity: {}", e)))?;
            builder = builder.identity(identity);
        } else {
            warn!("No federation client certificate configured; peers requiring mTLS will refuse calls");
        }

        for pem in extra_roots {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| FederationError::Registry(format!("peer CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|e| FederationError::Registry(format!("HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl RemoteKasClient for HttpRemoteKasClient {
    async fn unwrap_share(
        &self,
        peer: &PeerRecord,
        request: &PeerUnwrapRequest,
        bearer_token: &str,
    ) -> Result<PeerUnwrapResponse, FederationError> {
        let endpoint = peer.url.clone();
        let url = format!("{}{}", peer.url, PEER_UNWRAP_PATH);
        debug!(
            "Requesting share for KAO {} from {} ({})",
            request.kao.id, peer.kas_id, endpoint
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer_token)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FederationError::Timeout {
                        endpoint: endpoint.clone(),
                    }
                } else {
                    FederationError::Transport {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => return Err(FederationError::Denied { endpoint }),
            status => {
                return Err(FederationError::Status {
                    endpoint,
                    status: status.as_u16(),
                })
            }
        }

        response
            .json::<PeerUnwrapResponse>()
            .await
            .map_err(|e| FederationError::InvalidResponse {
                endpoint,
                reason: e.to_string(),
            })
    }
}
