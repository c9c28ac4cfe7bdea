//! Resolves key shares for validated KAOs: locally through the HSM
//! provider, or from the owning peer KAS behind its circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use p256::SecretKey;
use rand_core::OsRng;
use tokio::task::JoinSet;

use crate::federation::breaker::{BreakerRejection, BreakerTable};
use crate::federation::client::RemoteKasClient;
use crate::federation::registry::FederationRegistry;
use crate::federation::types::PeerUnwrapRequest;
use crate::federation::FederationError;
use crate::hsm::{HsmProvider, KeyMaterial};
use crate::modules::secure_keys::SecureEcPrivateKey;
use crate::policy::AuthorizationGrant;
use crate::rewrap::retry::{call_with_retry, CallError};
use crate::rewrap::types::Policy;
use crate::rewrap::validation::ValidatedKao;

/// Request-scoped data forwarded to peers.
#[derive(Debug, Clone)]
pub struct FederationContext {
    pub request_id: String,
    pub policy: Policy,
    /// The end user's own token; peers re-verify it.
    pub bearer_token: String,
}

/// How this KAS signs the unwrap requests it sends to peers.
pub struct RequesterIdentity {
    /// Canonical URL peers list this KAS under.
    pub kas_url: String,
    pub signing: SecureEcPrivateKey,
}

pub struct FederationRouter {
    identity: RequesterIdentity,
    hsm: Arc<dyn HsmProvider>,
    hsm_timeout: Duration,
    registry: Arc<FederationRegistry>,
    client: Arc<dyn RemoteKasClient>,
    breakers: Arc<BreakerTable>,
    remote_timeout: Duration,
}

impl FederationRouter {
    pub fn new(
        identity: RequesterIdentity,
        hsm: Arc<dyn HsmProvider>,
        hsm_timeout: Duration,
        registry: Arc<FederationRegistry>,
        client: Arc<dyn RemoteKasClient>,
        breakers: Arc<BreakerTable>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            hsm,
            hsm_timeout,
            registry,
            client,
            breakers,
            remote_timeout,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        &self.breakers
    }

    pub fn registry(&self) -> &FederationRegistry {
        &self.registry
    }

    /// Unwrap one KAO through the local HSM, retrying a timeout once.
    pub async fn unwrap_local(
        &self,
        _grant: &AuthorizationGrant,
        kao: &ValidatedKao,
    ) -> Result<KeyMaterial, FederationError> {
        let hsm = &self.hsm;
        call_with_retry("HSM unwrap", self.hsm_timeout, || {
            hsm.unwrap(&kao.wrapped_key, &kao.kid)
        })
        .await
        .map_err(|e| match e {
            CallError::TimedOut => FederationError::HsmTimeout,
            CallError::Failed(inner) => FederationError::Hsm(inner),
        })
    }

    /// Obtain the share for one KAO from wherever it lives.
    pub async fn fetch_share(
        &self,
        grant: &AuthorizationGrant,
        kao: &ValidatedKao,
        ctx: &FederationContext,
    ) -> Result<KeyMaterial, FederationError> {
        if kao.is_local {
            return self.unwrap_local(grant, kao).await;
        }

        let peer = self
            .registry
            .lookup(&kao.url)
            .ok_or_else(|| FederationError::UnknownPeer {
                url: kao.url.clone(),
            })?;

        let session = SecretKey::random(&mut OsRng);
        let request = PeerUnwrapRequest::sign(
            &ctx.request_id,
            &self.identity.kas_url,
            &kao.raw,
            &ctx.policy,
            &session.public_key(),
            &self.identity.signing,
        )
        .map_err(|e| FederationError::Signing(e.to_string()))?;

        let permit = match self.breakers.try_acquire(&peer.url) {
            Ok(permit) => permit,
            Err(BreakerRejection::Open { retry_in }) => {
                debug!("Skipping {}: circuit open for another {:?}", peer.url, retry_in);
                return Err(FederationError::CircuitOpen {
                    endpoint: peer.url.clone(),
                });
            }
            Err(BreakerRejection::TrialInFlight) => {
                debug!("Skipping {}: half-open trial already in flight", peer.url);
                return Err(FederationError::CircuitOpen {
                    endpoint: peer.url.clone(),
                });
            }
        };
        if permit.is_trial() {
            debug!("Circuit for {} is half-open, sending trial request", peer.url);
        }

        let outcome = match tokio::time::timeout(
            self.remote_timeout,
            self.client.unwrap_share(peer, &request, &ctx.bearer_token),
        )
        .await
        {
            Err(_) => Err(FederationError::Timeout {
                endpoint: peer.url.clone(),
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(response)) => response
                .open(&kao.id, &kao.policy_binding, &peer.verifying_key, &session)
                .map_err(|e| FederationError::InvalidResponse {
                    endpoint: peer.url.clone(),
                    reason: e.to_string(),
                }),
        };

        match outcome {
            Ok(share) => {
                permit.success();
                Ok(share)
            }
            Err(e) => {
                warn!("Share for KAO {} from {} failed: {}", kao.id, peer.kas_id, e);
                if e.counts_as_endpoint_failure() {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(e)
            }
        }
    }

    /// Fetch every member concurrently. The first failure cancels the
    /// remaining calls and fails the group; shares already recovered are
    /// dropped (and zeroized) with it.
    pub async fn fetch_all_of(
        self: &Arc<Self>,
        grant: &AuthorizationGrant,
        members: &[ValidatedKao],
        ctx: Arc<FederationContext>,
    ) -> Result<Vec<KeyMaterial>, FederationError> {
        let mut tasks = self.spawn_members(grant, members, &ctx);
        let mut shares: Vec<Option<KeyMaterial>> = (0..members.len()).map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(share))) => shares[index] = Some(share),
                Ok((index, Err(e))) => {
                    tasks.abort_all();
                    warn!(
                        "allOf member {} failed, abandoning group: {}",
                        members[index].id, e
                    );
                    return Err(e);
                }
                Err(join_error) => {
                    tasks.abort_all();
                    return Err(FederationError::TaskFailed(join_error.to_string()));
                }
            }
        }

        shares
            .into_iter()
            .map(|share| share.ok_or_else(|| FederationError::TaskFailed("missing share".into())))
            .collect()
    }

    /// Race every alternative concurrently and keep the first success;
    /// the rest are cancelled. The returned vector has one slot per
    /// member, filled only for the winner.
    pub async fn fetch_any_of(
        self: &Arc<Self>,
        grant: &AuthorizationGrant,
        members: &[ValidatedKao],
        ctx: Arc<FederationContext>,
    ) -> Result<Vec<Option<KeyMaterial>>, FederationError> {
        let mut tasks = self.spawn_members(grant, members, &ctx);
        let mut shares: Vec<Option<KeyMaterial>> = (0..members.len()).map(|_| None).collect();
        let mut last_error = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(share))) => {
                    tasks.abort_all();
                    debug!("anyOf satisfied by member {}", members[index].id);
                    shares[index] = Some(share);
                    return Ok(shares);
                }
                Ok((index, Err(e))) => {
                    debug!("anyOf member {} failed: {}", members[index].id, e);
                    last_error = Some(e.to_string());
                }
                Err(join_error) => last_error = Some(join_error.to_string()),
            }
        }

        Err(FederationError::AllAlternativesFailed {
            attempts: members.len(),
            last: last_error.unwrap_or_else(|| "no alternatives".to_string()),
        })
    }

    fn spawn_members(
        self: &Arc<Self>,
        grant: &AuthorizationGrant,
        members: &[ValidatedKao],
        ctx: &Arc<FederationContext>,
    ) -> JoinSet<(usize, Result<KeyMaterial, FederationError>)> {
        let mut tasks = JoinSet::new();
        for (index, kao) in members.iter().cloned().enumerate() {
            let router = Arc::clone(self);
            let ctx = Arc::clone(ctx);
            let grant = *grant;
            tasks.spawn(async move { (index, router.fetch_share(&grant, &kao, &ctx).await) });
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheManager, CacheTtls, MemoryBackend};
    use crate::federation::breaker::{BreakerConfig, BreakerState};
    use crate::federation::registry::PeerKas;
    use crate::federation::types::PeerUnwrapResponse;
    use crate::federation::PeerRecord;
    use crate::hsm::{CachedHsm, MockHsmProvider};
    use crate::modules::crypto::{self, public_key_to_pem, TrustedKey};
    use crate::policy::PolicyDecision;
    use crate::rewrap::types::{Classification, KeyAccessObject, SplitMode};
    use crate::rewrap::validation::validate_key_access_object;
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const LOCAL: &str = "https://kas.usa.example";

    #[derive(Clone, Copy)]
    enum Behavior {
        Healthy,
        Failing,
        Slow,
    }

    struct Peer {
        url: &'static str,
        signer: SecureEcPrivateKey,
        share: Vec<u8>,
    }

    struct ScriptedClient {
        requester: TrustedKey,
        peers: HashMap<String, (Peer, Behavior)>,
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
    }

    impl ScriptedClient {
        fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl RemoteKasClient for ScriptedClient {
        async fn unwrap_share(
            &self,
            peer: &PeerRecord,
            request: &PeerUnwrapRequest,
            _bearer_token: &str,
        ) -> Result<PeerUnwrapResponse, FederationError> {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.calls.lock().unwrap().entry(peer.url.clone()).or_insert(0) += 1;
            let (scripted, behavior) = &self.peers[&peer.url];
            match behavior {
                Behavior::Healthy => {
                    request.verify(&self.requester).unwrap();
                    assert_eq!(request.requester, LOCAL);
                    let binding = crypto::base64_decode(&request.kao.policy_binding).unwrap();
                    let session = crypto::parse_pem_public_key(&request.session_public_key).unwrap();
                    Ok(PeerUnwrapResponse::seal(
                        &request.kao.id,
                        &scripted.share,
                        &binding,
                        &session,
                        &scripted.signer,
                    )
                    .unwrap())
                }
                Behavior::Failing => Err(FederationError::Status {
                    endpoint: peer.url.clone(),
                    status: 503,
                }),
                Behavior::Slow => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!("slow peer should have been cancelled")
                }
            }
        }
    }

    fn policy() -> Policy {
        Policy {
            classification: Classification::Secret,
            releasability_to: BTreeSet::from(["USA".to_string()]),
            coi: None,
            creation_date: None,
        }
    }

    fn ctx() -> Arc<FederationContext> {
        Arc::new(FederationContext {
            request_id: "req-1".to_string(),
            policy: policy(),
            bearer_token: "user-token".to_string(),
        })
    }

    struct Fixture {
        router: Arc<FederationRouter>,
        client: Arc<ScriptedClient>,
        hsm: Arc<MockHsmProvider>,
        kas_signer: SecureEcPrivateKey,
    }

    fn fixture(peers: Vec<(Peer, Behavior)>) -> Fixture {
        let registry = FederationRegistry::from_peers(
            peers
                .iter()
                .map(|(peer, _)| PeerKas {
                    kas_id: peer.url.trim_start_matches("https://").to_string(),
                    url: peer.url.to_string(),
                    signing_public_key_pem: public_key_to_pem(&peer.signer.public_key().unwrap()).unwrap(),
                    ca_certificate_pem: None,
                })
                .collect(),
        )
        .unwrap();
        let kas_signer = SecureEcPrivateKey::generate();
        let client = Arc::new(ScriptedClient {
            requester: TrustedKey::from_p256(&kas_signer.public_key().unwrap()),
            peers: peers.into_iter().map(|(p, b)| (p.url.to_string(), (p, b))).collect(),
            calls: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
        });
        let hsm = Arc::new(MockHsmProvider::random());
        let cache = Arc::new(CacheManager::new(Arc::new(MemoryBackend::default()), CacheTtls::default()));
        let router = Arc::new(FederationRouter::new(
            RequesterIdentity {
                kas_url: LOCAL.to_string(),
                signing: kas_signer.clone(),
            },
            Arc::new(CachedHsm::new(hsm.clone(), cache)),
            Duration::from_secs(2),
            Arc::new(registry),
            client.clone(),
            Arc::new(BreakerTable::new(BreakerConfig {
                failure_threshold: 2,
                failure_window: Duration::from_secs(30),
                base_cooldown: Duration::from_secs(5),
                max_cooldown: Duration::from_secs(60),
            })),
            Duration::from_secs(2),
        ));
        Fixture {
            router,
            client,
            hsm,
            kas_signer,
        }
    }

    fn peer(url: &'static str, share: &[u8]) -> Peer {
        Peer {
            url,
            signer: SecureEcPrivateKey::generate(),
            share: share.to_vec(),
        }
    }

    fn kao(fx: &Fixture, id: &str, url: &str, wrapped: &[u8], split: Option<SplitMode>) -> ValidatedKao {
        let mut raw = KeyAccessObject::issue(id, url, "kid-1", wrapped, &policy(), &fx.kas_signer).unwrap();
        if let Some(mode) = split {
            raw = raw.with_split("split-1", mode);
        }
        validate_key_access_object(&raw, LOCAL).unwrap()
    }

    fn grant() -> AuthorizationGrant {
        AuthorizationGrant::issue(&PolicyDecision::allow()).unwrap()
    }

    #[tokio::test]
    async fn test_local_share_goes_through_hsm() {
        let fx = fixture(vec![]);
        let wrapped = fx.hsm.wrap(b"local-share", "kid-1").await.unwrap();
        let local = kao(&fx, "a", LOCAL, &wrapped, None);

        let share = fx.router.fetch_share(&grant(), &local, &ctx()).await.unwrap();
        assert_eq!(share.as_slice(), b"local-share");
        assert_eq!(fx.hsm.unwrap_calls(), 1);
        assert_eq!(fx.client.total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_share_is_verified() {
        let fx = fixture(vec![(peer("https://kas.gbr.example", b"gbr-share"), Behavior::Healthy)]);
        let remote = kao(&fx, "b", "https://kas.gbr.example", b"opaque", None);

        let share = fx.router.fetch_share(&grant(), &remote, &ctx()).await.unwrap();
        assert_eq!(share.as_slice(), b"gbr-share");
        assert_eq!(fx.hsm.unwrap_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected_without_io() {
        let fx = fixture(vec![]);
        let remote = kao(&fx, "b", "https://kas.nowhere.example", b"opaque", None);
        assert!(matches!(
            fx.router.fetch_share(&grant(), &remote, &ctx()).await,
            Err(FederationError::UnknownPeer { .. })
        ));
    }

    #[tokio::test]
    async fn test_all_of_fails_when_one_member_fails() {
        let fx = fixture(vec![
            (peer("https://kas.gbr.example", b"aaaa"), Behavior::Healthy),
            (peer("https://kas.fra.example", b"bbbb"), Behavior::Failing),
        ]);
        let members = vec![
            kao(&fx, "a", "https://kas.gbr.example", b"w1", Some(SplitMode::AllOf)),
            kao(&fx, "b", "https://kas.fra.example", b"w2", Some(SplitMode::AllOf)),
        ];

        let result = fx.router.fetch_all_of(&grant(), &members, ctx()).await;
        assert!(matches!(result, Err(FederationError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn test_all_of_returns_shares_in_member_order() {
        let fx = fixture(vec![
            (peer("https://kas.gbr.example", b"aaaa"), Behavior::Healthy),
            (peer("https://kas.fra.example", b"bbbb"), Behavior::Healthy),
        ]);
        let members = vec![
            kao(&fx, "a", "https://kas.gbr.example", b"w1", Some(SplitMode::AllOf)),
            kao(&fx, "b", "https://kas.fra.example", b"w2", Some(SplitMode::AllOf)),
        ];

        let shares = fx.router.fetch_all_of(&grant(), &members, ctx()).await.unwrap();
        assert_eq!(shares[0].as_slice(), b"aaaa");
        assert_eq!(shares[1].as_slice(), b"bbbb");
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_of_takes_healthy_alternative_and_cancels_slow() {
        let fx = fixture(vec![
            (peer("https://kas.gbr.example", b"gbr"), Behavior::Failing),
            (peer("https://kas.fra.example", b"fra"), Behavior::Slow),
            (peer("https://kas.can.example", b"can"), Behavior::Healthy),
        ]);
        let members = vec![
            kao(&fx, "a", "https://kas.gbr.example", b"w1", Some(SplitMode::AnyOf)),
            kao(&fx, "b", "https://kas.fra.example", b"w2", Some(SplitMode::AnyOf)),
            kao(&fx, "c", "https://kas.can.example", b"w3", Some(SplitMode::AnyOf)),
        ];

        let shares = fx.router.fetch_any_of(&grant(), &members, ctx()).await.unwrap();
        assert!(shares[0].is_none());
        assert!(shares[1].is_none());
        assert_eq!(shares[2].as_deref().map(|s| s.as_slice()), Some(&b"can"[..]));
    }

    #[tokio::test]
    async fn test_any_of_fails_when_every_alternative_fails() {
        let fx = fixture(vec![
            (peer("https://kas.gbr.example", b"gbr"), Behavior::Failing),
            (peer("https://kas.fra.example", b"fra"), Behavior::Failing),
        ]);
        let members = vec![
            kao(&fx, "a", "https://kas.gbr.example", b"w1", Some(SplitMode::AnyOf)),
            kao(&fx, "b", "https://kas.fra.example", b"w2", Some(SplitMode::AnyOf)),
        ];

        assert!(matches!(
            fx.router.fetch_any_of(&grant(), &members, ctx()).await,
            Err(FederationError::AllAlternativesFailed { attempts: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits_without_network_io() {
        let fx = fixture(vec![(peer("https://kas.gbr.example", b"gbr"), Behavior::Failing)]);
        let remote = kao(&fx, "a", "https://kas.gbr.example", b"w1", None);

        for _ in 0..2 {
            assert!(fx.router.fetch_share(&grant(), &remote, &ctx()).await.is_err());
        }
        assert_eq!(fx.router.breakers().state("https://kas.gbr.example"), BreakerState::Open);

        let result = fx.router.fetch_share(&grant(), &remote, &ctx()).await;
        assert!(matches!(result, Err(FederationError::CircuitOpen { .. })));
        assert_eq!(fx.client.calls_to("https://kas.gbr.example"), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(fx.router.fetch_share(&grant(), &remote, &ctx()).await.is_err());
        assert_eq!(fx.client.calls_to("https://kas.gbr.example"), 3);
        assert_eq!(fx.router.breakers().state("https://kas.gbr.example"), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout_counts_against_breaker() {
        let fx = fixture(vec![(peer("https://kas.gbr.example", b"gbr"), Behavior::Slow)]);
        let remote = kao(&fx, "a", "https://kas.gbr.example", b"w1", None);

        let result = fx.router.fetch_share(&grant(), &remote, &ctx()).await;
        assert!(matches!(result, Err(FederationError::Timeout { .. })));
    }
}
