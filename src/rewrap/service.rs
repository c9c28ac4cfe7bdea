//! Rewrap orchestration.
//!
//! Gate order is fixed: shape, token and DPoP, every policy binding, every
//! signature, encrypted metadata, policy decision, and only then key
//! recovery. Nothing past the decision is reachable without an
//! [`AuthorizationGrant`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::{AuditDecision, AuditRecord, AuditSink};
use crate::federation::{FederationContext, FederationRouter, PeerUnwrapRequest, PeerUnwrapResponse};
use crate::hsm::{HsmError, HsmProvider, KeyMaterial};
use crate::modules::crypto::{self, TrustedKey};
use crate::modules::dpop::DpopValidator;
use crate::modules::secure_keys::SecureEcPrivateKey;
use crate::modules::token::{AuthContext, TokenVerifier};
use crate::policy::{
    AuthorizationGrant, AuthorizationQuery, PolicyEngine, PolicyError, QueryEnvironment,
};
use crate::rewrap::combiner;
use crate::rewrap::error::RewrapError;
use crate::rewrap::retry::{call_with_retry, CallError};
use crate::rewrap::types::{Policy, ResponseMetadata, RewrapResponse, SplitMode};
use crate::rewrap::validation::{self, KaoGroup, ValidatedKao};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Canonical public URL of this KAS.
    pub kas_url: String,
    pub kas_id: String,
    pub tenant: String,
    pub policy_timeout: Duration,
    /// Bound on each HSM/KMS call made directly by the service.
    pub hsm_timeout: Duration,
    /// Server-side ceiling for a whole request.
    pub request_deadline: Duration,
    pub enable_timing_logs: bool,
}

/// Long-lived private keys of this KAS.
pub struct KasKeys {
    /// Signs issued KAOs and peer-unwrap responses; its public half
    /// verifies local KAO signatures.
    pub signing: SecureEcPrivateKey,
    /// Opens `encryptedMetadata`.
    pub metadata: SecureEcPrivateKey,
}

/// Collaborators injected at startup.
pub struct ServiceDeps {
    pub tokens: Arc<TokenVerifier>,
    pub dpop: DpopValidator,
    pub policy: Arc<dyn PolicyEngine>,
    pub router: Arc<FederationRouter>,
    pub hsm: Arc<dyn HsmProvider>,
    pub audit: Arc<dyn AuditSink>,
}

/// HTTP facts the protocol needs.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: String,
    /// Absolute URL the client addressed, used as DPoP `htu`.
    pub url: String,
    pub source_addr: String,
    /// Client-requested deadline, capped at the configured ceiling.
    pub deadline: Option<Duration>,
}

#[derive(Deserialize)]
struct MetadataAssertions {
    policy: Policy,
}

#[derive(Debug, Default)]
struct AuditTrail {
    subject: Option<String>,
    acr: Option<String>,
    amr: Vec<String>,
    kao_ids: Vec<String>,
    kas_contacted: Vec<String>,
}

impl AuditTrail {
    fn authenticated(&mut self, auth: &AuthContext) {
        self.subject = Some(auth.identity().to_string());
        self.acr = auth.acr().map(str::to_string);
        self.amr = auth.amr().to_vec();
    }

    fn contacted(&mut self, url: &str) {
        if !self.kas_contacted.iter().any(|u| u == url) {
            self.kas_contacted.push(url.to_string());
        }
    }
}

pub struct RewrapService {
    config: ServiceConfig,
    keys: KasKeys,
    local_verifier: TrustedKey,
    deps: ServiceDeps,
}

impl RewrapService {
    pub fn new(config: ServiceConfig, keys: KasKeys, deps: ServiceDeps) -> Result<Self, RewrapError> {
        let signing_public = keys
            .signing
            .public_key()
            .map_err(|e| RewrapError::InternalError(format!("signing key: {}", e)))?;
        Ok(Self {
            local_verifier: TrustedKey::from_p256(&signing_public),
            config,
            keys,
            deps,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Rewrap the DEK protected by the request's KAOs for the client key.
    pub async fn handle_rewrap(
        &self,
        body: &[u8],
        bearer_token: Option<&str>,
        dpop_proof: Option<&str>,
        meta: &RequestMeta,
    ) -> Result<RewrapResponse, RewrapError> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = self.effective_deadline(meta.deadline);
        let mut trail = AuditTrail::default();

        let result = match tokio::time::timeout(
            deadline,
            self.rewrap_inner(&request_id, body, bearer_token, dpop_proof, meta, &mut trail),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RewrapError::UpstreamTimeout(format!(
                "request deadline of {:?} exceeded",
                deadline
            ))),
        };

        let elapsed = started.elapsed();
        self.log_timing("total", elapsed);
        match &result {
            Ok(_) => info!("Rewrap {} succeeded in {:?}", request_id, elapsed),
            Err(e) => warn!("Rewrap {} rejected: {}", request_id, e),
        }
        self.audit("rewrap", &request_id, &meta.source_addr, trail, &result, elapsed)
            .await;
        result
    }

    async fn rewrap_inner(
        &self,
        request_id: &str,
        body: &[u8],
        bearer_token: Option<&str>,
        dpop_proof: Option<&str>,
        meta: &RequestMeta,
        trail: &mut AuditTrail,
    ) -> Result<RewrapResponse, RewrapError> {
        let phase = Instant::now();
        let request = validation::parse_request(body)?;
        let validated = validation::validate_request(&request, &self.config.kas_url)?;
        trail.kao_ids = validated.kao_ids();

        let token = bearer_token
            .ok_or_else(|| RewrapError::AuthenticationFailure("missing bearer token".to_string()))?;
        let auth = self.deps.tokens.verify(token).await?;
        trail.authenticated(&auth);
        let proof = dpop_proof
            .ok_or_else(|| RewrapError::AuthenticationFailure("missing DPoP proof".to_string()))?;
        let jkt = auth.jkt().ok_or_else(|| {
            RewrapError::AuthenticationFailure("access token is not bound to a DPoP key".to_string())
        })?;
        self.deps
            .dpop
            .validate(proof, &meta.method, &meta.url, token, jkt)
            .await?;

        self.verify_bindings(&validated.policy, &validated.kaos)?;
        for kao in &validated.kaos {
            self.verify_signature(kao)?;
        }
        if let Some(blob) = &validated.encrypted_metadata {
            self.verify_metadata(blob, &validated.policy)?;
        }
        self.log_timing("verify", phase.elapsed());

        let phase = Instant::now();
        let grant = self
            .authorize(&auth, &validated.policy, request_id, &meta.source_addr)
            .await?;
        self.log_timing("authorize", phase.elapsed());

        let phase = Instant::now();
        let ctx = Arc::new(FederationContext {
            request_id: request_id.to_string(),
            policy: validated.policy.clone(),
            bearer_token: token.to_string(),
        });
        let mut group_keys = Vec::with_capacity(validated.groups.len());
        for group in &validated.groups {
            group_keys.push(self.resolve_group(&grant, group, &ctx, trail).await?);
        }
        let dek = match group_keys.len() {
            1 => group_keys.pop().ok_or_else(|| {
                RewrapError::InternalError("group result vanished".to_string())
            })?,
            _ => {
                let views: Vec<&[u8]> = group_keys.iter().map(|k| k.as_slice()).collect();
                combiner::combine_all_of(&views)?
            }
        };
        self.log_timing("unwrap", phase.elapsed());

        let sealed = crypto::seal_for_client(&dek, &validated.client_key)?;
        drop(dek);

        Ok(RewrapResponse {
            encrypted_key: crypto::base64_encode(&sealed.encrypted_key),
            session_public_key: sealed.session_public_key,
            metadata: ResponseMetadata {
                request_id: request_id.to_string(),
                kao_ids: trail.kao_ids.clone(),
            },
        })
    }

    /// Serve one share to a peer KAS on behalf of the forwarded user. The
    /// caller must be a registered peer that signed the request, and the
    /// share leaves sealed to its session key.
    pub async fn handle_peer_unwrap(
        &self,
        body: &[u8],
        bearer_token: Option<&str>,
        meta: &RequestMeta,
    ) -> Result<PeerUnwrapResponse, RewrapError> {
        let started = Instant::now();
        let mut trail = AuditTrail::default();
        let mut request_id = Uuid::new_v4().to_string();

        let result = match tokio::time::timeout(
            self.effective_deadline(meta.deadline),
            self.peer_unwrap_inner(body, bearer_token, meta, &mut trail, &mut request_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RewrapError::UpstreamTimeout(
                "peer unwrap deadline exceeded".to_string(),
            )),
        };

        if let Err(e) = &result {
            warn!("Peer unwrap {} rejected: {}", request_id, e);
        }
        self.audit(
            "peer-unwrap",
            &request_id,
            &meta.source_addr,
            trail,
            &result,
            started.elapsed(),
        )
        .await;
        result
    }

    async fn peer_unwrap_inner(
        &self,
        body: &[u8],
        bearer_token: Option<&str>,
        meta: &RequestMeta,
        trail: &mut AuditTrail,
        request_id: &mut String,
    ) -> Result<PeerUnwrapResponse, RewrapError> {
        validation::check_size(body)?;
        let request: PeerUnwrapRequest = serde_json::from_slice(body)
            .map_err(|e| RewrapError::MalformedRequest(format!("invalid JSON body: {}", e)))?;
        if !request.request_id.trim().is_empty() {
            *request_id = request.request_id.clone();
        }

        validation::validate_policy(&request.policy)?;
        let kao = validation::validate_key_access_object(&request.kao, &self.config.kas_url)?;
        trail.kao_ids = vec![kao.id.clone()];
        if !kao.is_local {
            return Err(RewrapError::MalformedRequest(format!(
                "key access object {} is not held by this KAS",
                kao.id
            )));
        }
        let session = crypto::parse_pem_public_key(&request.session_public_key).map_err(|e| {
            RewrapError::MalformedRequest(format!("sessionPublicKey must be P-256 SPKI PEM: {}", e))
        })?;

        // Only registered peers may ask for shares, and only over a request
        // signed with their registry key.
        let caller = self
            .deps
            .router
            .registry()
            .lookup(&request.requester)
            .ok_or_else(|| {
                RewrapError::AuthenticationFailure(format!(
                    "{} is not a registered peer",
                    request.requester
                ))
            })?;
        request.verify(&caller.verifying_key).map_err(|e| {
            RewrapError::AuthenticationFailure(format!(
                "request from {} failed signature check: {}",
                caller.kas_id, e
            ))
        })?;
        debug!("Peer unwrap {} requested by {}", request_id, caller.kas_id);

        let token = bearer_token
            .ok_or_else(|| RewrapError::AuthenticationFailure("missing bearer token".to_string()))?;
        let auth = self.deps.tokens.verify(token).await?;
        trail.authenticated(&auth);

        self.verify_bindings(&request.policy, std::slice::from_ref(&kao))?;
        self.verify_signature(&kao)?;

        let grant = self
            .authorize(&auth, &request.policy, request_id.as_str(), &meta.source_addr)
            .await?;

        trail.contacted(&kao.url);
        let share = self.deps.router.unwrap_local(&grant, &kao).await?;
        let response = PeerUnwrapResponse::seal(
            &kao.id,
            &share,
            &kao.policy_binding,
            &session,
            &self.keys.signing,
        )?;
        Ok(response)
    }

    /// PEM public key for `kid`, through the cache.
    pub async fn public_key(&self, kid: &str) -> Result<String, RewrapError> {
        if kid.trim().is_empty() {
            return Err(RewrapError::MalformedRequest("kid must not be empty".to_string()));
        }
        let hsm = &self.deps.hsm;
        call_with_retry("HSM public key", self.config.hsm_timeout, || {
            hsm.get_public_key(kid)
        })
        .await
        .map_err(|e| match e {
            CallError::TimedOut => {
                RewrapError::UpstreamTimeout("HSM did not answer in time".to_string())
            }
            CallError::Failed(HsmError::UnknownKey(kid)) => {
                RewrapError::MalformedRequest(format!("unknown kid {}", kid))
            }
            CallError::Failed(other) => RewrapError::KeyRecoveryFailure(other.to_string()),
        })
    }

    fn effective_deadline(&self, requested: Option<Duration>) -> Duration {
        requested
            .map(|d| d.min(self.config.request_deadline))
            .unwrap_or(self.config.request_deadline)
    }

    /// Every binding is checked before any signature or decision.
    fn verify_bindings(&self, policy: &Policy, kaos: &[ValidatedKao]) -> Result<(), RewrapError> {
        let expected = crypto::policy_binding_hash(policy)?;
        for kao in kaos {
            if !crypto::constant_time_eq(&kao.policy_binding, &expected) {
                warn!("Policy binding mismatch on KAO {}", kao.id);
                return Err(RewrapError::PolicyBindingMismatch {
                    kao_id: kao.id.clone(),
                });
            }
        }
        Ok(())
    }

    fn verify_signature(&self, kao: &ValidatedKao) -> Result<(), RewrapError> {
        let key = if kao.is_local {
            &self.local_verifier
        } else {
            &self
                .deps
                .router
                .registry()
                .lookup(&kao.url)
                .ok_or_else(|| RewrapError::SignatureInvalid {
                    kao_id: kao.id.clone(),
                    reason: format!("no trusted key for {}", kao.url),
                })?
                .verifying_key
        };
        key.verify(kao.signature_alg, &kao.signed_message(), &kao.signature)
            .map_err(|e| RewrapError::SignatureInvalid {
                kao_id: kao.id.clone(),
                reason: e.to_string(),
            })
    }

    fn verify_metadata(&self, blob: &[u8], policy: &Policy) -> Result<(), RewrapError> {
        let plaintext = crypto::open_metadata(&self.keys.metadata, blob).map_err(|e| {
            RewrapError::MalformedRequest(format!("encryptedMetadata could not be opened: {}", e))
        })?;
        let assertions: MetadataAssertions = serde_json::from_slice(&plaintext).map_err(|e| {
            RewrapError::MalformedRequest(format!("encryptedMetadata is not valid JSON: {}", e))
        })?;
        let asserted = crypto::policy_binding_hash(&assertions.policy)?;
        let declared = crypto::policy_binding_hash(policy)?;
        if !crypto::constant_time_eq(&asserted, &declared) {
            warn!("Encrypted metadata policy does not match the request policy");
            return Err(RewrapError::PolicyBindingMismatch {
                kao_id: "encryptedMetadata".to_string(),
            });
        }
        Ok(())
    }

    async fn authorize(
        &self,
        auth: &AuthContext,
        policy: &Policy,
        request_id: &str,
        source_addr: &str,
    ) -> Result<AuthorizationGrant, RewrapError> {
        let query = AuthorizationQuery::build(
            auth,
            policy,
            &QueryEnvironment {
                request_id,
                source_ip: source_addr,
                tenant: &self.config.tenant,
                current_time: Utc::now(),
            },
        );

        let engine = &self.deps.policy;
        let decision = call_with_retry("policy decision", self.config.policy_timeout, || {
            engine.decide(&query)
        })
        .await
        .map_err(|e| match e {
            CallError::TimedOut => RewrapError::from(PolicyError::Timeout),
            CallError::Failed(inner) => RewrapError::from(inner),
        })?;

        match AuthorizationGrant::issue(&decision) {
            Some(grant) => {
                debug!("Policy engine allowed request {}", request_id);
                Ok(grant)
            }
            None => Err(RewrapError::AuthorizationDenied {
                reason: decision
                    .reason
                    .unwrap_or_else(|| "policy engine denied the request".to_string()),
            }),
        }
    }

    async fn resolve_group(
        &self,
        grant: &AuthorizationGrant,
        group: &KaoGroup,
        ctx: &Arc<FederationContext>,
        trail: &mut AuditTrail,
    ) -> Result<KeyMaterial, RewrapError> {
        for kao in group.members() {
            trail.contacted(&kao.url);
        }
        let router = &self.deps.router;
        match group {
            KaoGroup::Single(kao) => Ok(router.fetch_share(grant, kao, ctx).await?),
            KaoGroup::Split {
                mode: SplitMode::AllOf,
                members,
                ..
            } => {
                let shares = router.fetch_all_of(grant, members, Arc::clone(ctx)).await?;
                let views: Vec<&[u8]> = shares.iter().map(|s| s.as_slice()).collect();
                Ok(combiner::combine_all_of(&views)?)
            }
            KaoGroup::Split {
                mode: SplitMode::AnyOf,
                members,
                ..
            } => {
                let slots = router.fetch_any_of(grant, members, Arc::clone(ctx)).await?;
                Ok(combiner::select_any_of(slots)?)
            }
        }
    }

    async fn audit<T>(
        &self,
        operation: &str,
        request_id: &str,
        source_addr: &str,
        trail: AuditTrail,
        result: &Result<T, RewrapError>,
        elapsed: Duration,
    ) {
        let (decision, error_code, reason) = match result {
            Ok(_) => (AuditDecision::Permit, None, None),
            Err(e @ RewrapError::AuthorizationDenied { .. }) => {
                (AuditDecision::Deny, Some(e.code().to_string()), Some(e.to_string()))
            }
            Err(e) => (AuditDecision::Error, Some(e.code().to_string()), Some(e.to_string())),
        };

        self.deps
            .audit
            .record(AuditRecord {
                request_id: request_id.to_string(),
                timestamp: Utc::now(),
                kas_id: self.config.kas_id.clone(),
                operation: operation.to_string(),
                subject: trail.subject,
                decision,
                error_code,
                reason,
                kao_ids: trail.kao_ids,
                kas_contacted: trail.kas_contacted,
                acr: trail.acr,
                amr: trail.amr,
                source_ip: Some(source_addr.to_string()).filter(|s| !s.is_empty()),
                duration_ms: elapsed.as_millis() as u64,
            })
            .await;
    }

    fn log_timing(&self, phase: &str, duration: Duration) {
        if self.config.enable_timing_logs {
            info!("Time to {}: {:?}", phase, duration);
        }
    }
}
