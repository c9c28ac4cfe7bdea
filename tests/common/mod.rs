#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use elliptic_curve::sec1::ToEncodedPoint;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use p256::pkcs8::{EncodePrivateKey, LineEnding};
use p256::SecretKey;
use rand_core::OsRng;
use serde_json::{json, Value};

use kas::audit::MemoryAuditSink;
use kas::cache::{CacheBackend, CacheError, CacheManager, CacheTtls, MemoryBackend};
use kas::federation::{
    BreakerConfig, BreakerTable, FederationError, FederationRegistry, FederationRouter, PeerKas,
    PeerRecord, PeerUnwrapRequest, PeerUnwrapResponse, RemoteKasClient, RequesterIdentity,
};
use kas::hsm::{CachedHsm, HsmError, HsmProvider, KeyMaterial, MockHsmProvider};
use kas::modules::crypto::{self, base64url_encode, public_key_to_pem, TrustedKey};
use kas::modules::dpop::{calculate_jwk_thumbprint, compute_access_token_hash, DPoPClaims, DpopValidator, JWK};
use kas::modules::secure_keys::SecureEcPrivateKey;
use kas::modules::token::TokenVerifier;
use kas::policy::{AuthorizationQuery, PolicyDecision, PolicyEngine, PolicyError};
use kas::rewrap::{
    Classification, ClientPublicKey, KasKeys, KeyAccessObject, Policy, RequestMeta, RewrapRequest,
    RewrapService, ServiceConfig, ServiceDeps,
};

pub const LOCAL_KAS: &str = "https://kas.usa.example";
pub const ISSUER: &str = "https://idp.example/realms/usa";
pub const IDP_KID: &str = "idp-key-1";
pub const KID: &str = "kid-1";

// ==================== Collaborator doubles ====================

/// Policy engine that answers from a switch and records every query.
pub struct ScriptedPolicy {
    allow: Mutex<bool>,
    queries: Mutex<Vec<AuthorizationQuery>>,
}

impl ScriptedPolicy {
    pub fn new(allow: bool) -> Self {
        Self {
            allow: Mutex::new(allow),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn set_allow(&self, allow: bool) {
        *self.allow.lock().unwrap() = allow;
    }

    pub fn queries(&self) -> Vec<AuthorizationQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl PolicyEngine for ScriptedPolicy {
    async fn decide(&self, query: &AuthorizationQuery) -> Result<PolicyDecision, PolicyError> {
        self.queries.lock().unwrap().push(query.clone());
        if *self.allow.lock().unwrap() {
            Ok(PolicyDecision::allow())
        } else {
            Ok(PolicyDecision::deny("clearance below classification"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerBehavior {
    Healthy,
    Down,
    Slow,
}

pub struct ScriptedPeer {
    pub url: &'static str,
    pub signer: SecureEcPrivateKey,
    pub behavior: PeerBehavior,
}

impl ScriptedPeer {
    pub fn new(url: &'static str, behavior: PeerBehavior) -> Self {
        Self {
            url,
            signer: SecureEcPrivateKey::generate(),
            behavior,
        }
    }
}

/// Peer KAS stand-in. A healthy peer checks the request came from this
/// KAS, then "unwraps" by sealing the wrapped bytes unchanged to the
/// requester's session key, signed with its registry key.
pub struct ScriptedRemote {
    requester: TrustedKey,
    peers: HashMap<String, Arc<ScriptedPeer>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
    bearer_tokens: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn forwarded_tokens(&self) -> Vec<String> {
        self.bearer_tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteKasClient for ScriptedRemote {
    async fn unwrap_share(
        &self,
        peer: &PeerRecord,
        request: &PeerUnwrapRequest,
        bearer_token: &str,
    ) -> Result<PeerUnwrapResponse, FederationError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(peer.url.clone()).or_insert(0) += 1;
        self.bearer_tokens.lock().unwrap().push(bearer_token.to_string());

        let scripted = self.peers.get(&peer.url).cloned().ok_or_else(|| FederationError::UnknownPeer {
            url: peer.url.clone(),
        })?;
        match scripted.behavior {
            PeerBehavior::Healthy => {
                if request.requester != LOCAL_KAS || request.verify(&self.requester).is_err() {
                    return Err(FederationError::Denied {
                        endpoint: peer.url.clone(),
                    });
                }
                let share = crypto::base64_decode(&request.kao.wrapped_key).unwrap();
                let binding = crypto::base64_decode(&request.kao.policy_binding).unwrap();
                let session = crypto::parse_pem_public_key(&request.session_public_key).unwrap();
                Ok(PeerUnwrapResponse::seal(&request.kao.id, &share, &binding, &session, &scripted.signer).unwrap())
            }
            PeerBehavior::Down => Err(FederationError::Transport {
                endpoint: peer.url.clone(),
                reason: "connection refused".to_string(),
            }),
            PeerBehavior::Slow => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Cache backend whose every call fails, as if Redis were unreachable.
pub struct UnreachableCache;

#[async_trait]
impl CacheBackend for UnreachableCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn delete_matching(&self, _pattern: &str) -> Result<u64, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn incr(&self, _key: &str, _window: Duration) -> Result<u64, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }
}

/// Provider whose public-key lookups never answer, as if KMS stalled.
/// Unwrap and wrap pass through.
pub struct StalledPublicKeys(pub Arc<dyn HsmProvider>);

#[async_trait]
impl HsmProvider for StalledPublicKeys {
    async fn unwrap(&self, wrapped_key: &[u8], key_id: &str) -> Result<KeyMaterial, HsmError> {
        self.0.unwrap(wrapped_key, key_id).await
    }

    async fn wrap(&self, plaintext: &[u8], key_id: &str) -> Result<Vec<u8>, HsmError> {
        self.0.wrap(plaintext, key_id).await
    }

    async fn get_public_key(&self, _key_id: &str) -> Result<String, HsmError> {
        std::future::pending().await
    }
}

// ==================== Harness ====================

pub struct Harness {
    pub service: Arc<RewrapService>,
    pub hsm: Arc<MockHsmProvider>,
    pub policy: Arc<ScriptedPolicy>,
    pub remote: Arc<ScriptedRemote>,
    pub audit: Arc<MemoryAuditSink>,
    pub peers: Vec<Arc<ScriptedPeer>>,
    pub kas_signing: SecureEcPrivateKey,
    pub kas_metadata: SecureEcPrivateKey,
    pub idp_key: SecretKey,
    pub client_key: SecretKey,
}

pub struct HarnessOptions {
    pub cache: Arc<dyn CacheBackend>,
    pub peers: Vec<ScriptedPeer>,
    pub allow: bool,
    /// Serve public keys from a provider that never answers.
    pub stall_public_keys: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            cache: Arc::new(MemoryBackend::default()),
            peers: Vec::new(),
            allow: true,
            stall_public_keys: false,
        }
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let cache = Arc::new(CacheManager::new(options.cache, CacheTtls::default()));
        let hsm = Arc::new(MockHsmProvider::random());
        let cached_hsm: Arc<dyn HsmProvider> = Arc::new(CachedHsm::new(hsm.clone(), cache));

        let peers: Vec<Arc<ScriptedPeer>> = options.peers.into_iter().map(Arc::new).collect();
        let registry = FederationRegistry::from_peers(
            peers
                .iter()
                .map(|p| PeerKas {
                    kas_id: p.url.trim_start_matches("https://").to_string(),
                    url: p.url.to_string(),
                    signing_public_key_pem: public_key_to_pem(&p.signer.public_key().unwrap()).unwrap(),
                    ca_certificate_pem: None,
                })
                .collect(),
        )
        .unwrap();
        let kas_signing = SecureEcPrivateKey::generate();
        let kas_metadata = SecureEcPrivateKey::generate();
        let remote = Arc::new(ScriptedRemote {
            requester: TrustedKey::from_p256(&kas_signing.public_key().unwrap()),
            peers: peers.iter().map(|p| (p.url.to_string(), p.clone())).collect(),
            calls: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
            bearer_tokens: Mutex::new(Vec::new()),
        });

        let router = Arc::new(FederationRouter::new(
            RequesterIdentity {
                kas_url: LOCAL_KAS.to_string(),
                signing: kas_signing.clone(),
            },
            cached_hsm.clone(),
            Duration::from_secs(2),
            Arc::new(registry),
            remote.clone(),
            Arc::new(BreakerTable::new(BreakerConfig::default())),
            Duration::from_secs(2),
        ));

        let idp_key = SecretKey::random(&mut OsRng);
        let tokens = Arc::new(TokenVerifier::with_static_keys(
            vec![ISSUER.to_string()],
            None,
            idp_key_set(&idp_key),
        ));
        let policy = Arc::new(ScriptedPolicy::new(options.allow));
        let audit = Arc::new(MemoryAuditSink::new());
        let service_hsm: Arc<dyn HsmProvider> = if options.stall_public_keys {
            Arc::new(StalledPublicKeys(cached_hsm))
        } else {
            cached_hsm
        };

        let service = Arc::new(RewrapService::new(
            ServiceConfig {
                kas_url: LOCAL_KAS.to_string(),
                kas_id: "kas-usa".to_string(),
                tenant: "usa".to_string(),
                policy_timeout: Duration::from_secs(1),
                hsm_timeout: Duration::from_secs(2),
                request_deadline: Duration::from_secs(5),
                enable_timing_logs: false,
            },
            KasKeys {
                signing: kas_signing.clone(),
                metadata: kas_metadata.clone(),
            },
            ServiceDeps {
                tokens,
                dpop: DpopValidator::new(Duration::from_secs(60)),
                policy: policy.clone(),
                router,
                hsm: service_hsm,
                audit: audit.clone(),
            },
        )
        .unwrap());

        Self {
            service,
            hsm,
            policy,
            remote,
            audit,
            peers,
            kas_signing,
            kas_metadata,
            idp_key,
            client_key: SecretKey::random(&mut OsRng),
        }
    }

    pub fn peer(&self, url: &str) -> &ScriptedPeer {
        self.peers.iter().find(|p| p.url == url).unwrap()
    }

    /// KAO held by this KAS, wrapped through the mock HSM.
    pub async fn local_kao(&self, id: &str, key_material: &[u8]) -> KeyAccessObject {
        let wrapped = self.hsm.wrap(key_material, KID).await.unwrap();
        KeyAccessObject::issue(id, LOCAL_KAS, KID, &wrapped, &policy(), &self.kas_signing).unwrap()
    }

    /// KAO held by a scripted peer; the peer returns `share` on unwrap.
    pub fn remote_kao(&self, id: &str, url: &'static str, share: &[u8]) -> KeyAccessObject {
        KeyAccessObject::issue(id, url, KID, share, &policy(), &self.peer(url).signer).unwrap()
    }

    pub fn request(&self, kaos: Vec<KeyAccessObject>) -> RewrapRequest {
        RewrapRequest {
            client_public_key: ClientPublicKey::Pem(public_key_to_pem(&self.client_key.public_key()).unwrap()),
            key_access_objects: kaos,
            policy: policy(),
            encrypted_metadata: None,
        }
    }

    pub fn claims(&self) -> Value {
        json!({
            "sub": "f2b1c3d4",
            "iss": ISSUER,
            "exp": chrono::Utc::now().timestamp() + 300,
            "uniqueID": "john.doe@mil",
            "clearance": "TOP_SECRET",
            "countryOfAffiliation": "USA",
            "acpCOI": ["FVEY"],
            "acr": "urn:mace:incommon:iap:gold",
            "amr": ["pwd", "hwk"],
            "auth_time": 1_767_225_600,
            "cnf": {"jkt": calculate_jwk_thumbprint(&client_jwk(&self.client_key))}
        })
    }

    pub fn token(&self) -> String {
        self.token_with(&self.claims())
    }

    pub fn token_with(&self, claims: &Value) -> String {
        let pem = self.idp_key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(IDP_KID.to_string());
        encode(&header, claims, &EncodingKey::from_ec_pem(pem.as_bytes()).unwrap()).unwrap()
    }

    pub fn dpop(&self, token: &str) -> String {
        dpop_proof(&self.client_key, "POST", &format!("{}/rewrap", LOCAL_KAS), token)
    }

    /// Full rewrap call with a fresh token and DPoP proof.
    pub async fn rewrap(
        &self,
        request: &RewrapRequest,
    ) -> Result<kas::rewrap::RewrapResponse, kas::RewrapError> {
        let token = self.token();
        let proof = self.dpop(&token);
        let body = serde_json::to_vec(request).unwrap();
        self.service
            .handle_rewrap(&body, Some(&token), Some(&proof), &meta("/rewrap"))
            .await
    }

    /// Peer unwrap body for `kao`, signed by `signer` on behalf of
    /// `requester`. The share is sealed to `session`.
    pub fn peer_request(
        &self,
        requester: &str,
        kao: &KeyAccessObject,
        session: &SecretKey,
        signer: &SecureEcPrivateKey,
    ) -> Vec<u8> {
        let request = PeerUnwrapRequest::sign(
            "req-peer",
            requester,
            kao,
            &policy(),
            &session.public_key(),
            signer,
        )
        .unwrap();
        serde_json::to_vec(&request).unwrap()
    }

    /// Open the response the way the client would.
    pub fn open(&self, response: &kas::rewrap::RewrapResponse) -> Vec<u8> {
        let session = response.session_public_key.as_deref().unwrap();
        let sealed = crypto::base64_decode(&response.encrypted_key).unwrap();
        crypto::open_for_client(&self.client_key, session, &sealed)
            .unwrap()
            .to_vec()
    }
}

// ==================== Fixtures ====================

pub fn policy() -> Policy {
    Policy {
        classification: Classification::Secret,
        releasability_to: BTreeSet::from(["USA".to_string(), "GBR".to_string()]),
        coi: Some(BTreeSet::from(["FVEY".to_string()])),
        creation_date: Some("2026-03-01T12:00:00Z".to_string()),
    }
}

pub fn meta(path: &str) -> RequestMeta {
    RequestMeta {
        method: "POST".to_string(),
        url: format!("{}{}", LOCAL_KAS, path),
        source_addr: "198.51.100.7".to_string(),
        deadline: None,
    }
}

pub fn client_jwk(secret: &SecretKey) -> JWK {
    let point = secret.public_key().to_encoded_point(false);
    JWK {
        kty: "EC".to_string(),
        crv: "P-256".to_string(),
        x: base64url_encode(point.x().unwrap()),
        y: base64url_encode(point.y().unwrap()),
    }
}

pub fn dpop_proof(secret: &SecretKey, method: &str, uri: &str, token: &str) -> String {
    let jwk = client_jwk(secret);
    let mut header = Header::new(Algorithm::ES256);
    header.typ = Some("dpop+jwt".to_string());
    header.jwk = Some(
        serde_json::from_value(json!({
            "kty": jwk.kty, "crv": jwk.crv, "x": jwk.x, "y": jwk.y
        }))
        .unwrap(),
    );
    let claims = DPoPClaims {
        jti: uuid::Uuid::new_v4().to_string(),
        htm: method.to_string(),
        htu: uri.to_string(),
        iat: chrono::Utc::now().timestamp(),
        ath: Some(compute_access_token_hash(token)),
    };
    let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
    encode(&header, &claims, &EncodingKey::from_ec_pem(pem.as_bytes()).unwrap()).unwrap()
}

fn idp_key_set(secret: &SecretKey) -> JwkSet {
    let point = secret.public_key().to_encoded_point(false);
    serde_json::from_value(json!({
        "keys": [{
            "kty": "EC",
            "crv": "P-256",
            "kid": IDP_KID,
            "alg": "ES256",
            "use": "sig",
            "x": base64url_encode(point.x().unwrap()),
            "y": base64url_encode(point.y().unwrap()),
        }]
    }))
    .unwrap()
}
