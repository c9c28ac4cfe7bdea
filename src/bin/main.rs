use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpListener;

use kas::audit::LogAuditSink;
use kas::cache::{CacheBackend, CacheManager, MemoryBackend, RedisBackend};
use kas::config::Settings;
use kas::federation::{
    BreakerTable, ClientIdentity, FederationRegistry, FederationRouter, HttpRemoteKasClient,
    RequesterIdentity,
};
use kas::hsm::build_provider;
use kas::modules::dpop::DpopValidator;
use kas::modules::http_rewrap::{router, RewrapState};
use kas::modules::ratelimit::RateLimiter;
use kas::modules::secure_keys::SecureEcPrivateKey;
use kas::modules::token::TokenVerifier;
use kas::policy::OpaPolicyEngine;
use kas::rewrap::{KasKeys, RewrapService, ServiceConfig, ServiceDeps};

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = Settings::from_env()?;

    let backend: Arc<dyn CacheBackend> = match &settings.redis_url {
        Some(url) => {
            info!("Using Redis cache backend");
            Arc::new(RedisBackend::new(url)?)
        }
        None => {
            info!("REDIS_URL not set, using in-process cache");
            Arc::new(MemoryBackend::default())
        }
    };
    let cache = Arc::new(
        CacheManager::new(backend, settings.cache_ttls).with_timeout(settings.cache_timeout),
    );

    let hsm = build_provider(&settings, cache.clone()).await?;

    let keys = KasKeys {
        signing: load_key(settings.kas_signing_key_path.as_deref(), "KAS_SIGNING_KEY_PATH")?,
        metadata: load_key(settings.kas_ec_key_path.as_deref(), "KAS_EC_KEY_PATH")?,
    };

    let (issuers, jwks_url) = settings.require_oidc()?;
    let tokens = Arc::new(TokenVerifier::remote(
        issuers.to_vec(),
        settings.oidc_audience.clone(),
        jwks_url,
        JWKS_FETCH_TIMEOUT,
    )?);

    let mut dpop = DpopValidator::new(settings.dpop_max_age);
    if settings.redis_url.is_some() {
        dpop = dpop.with_shared_cache(cache.clone());
    }

    let policy = Arc::new(OpaPolicyEngine::new(
        settings.opa_url.clone(),
        settings.policy_timeout,
    )?);

    let registry = match &settings.federation_registry_path {
        Some(path) => FederationRegistry::load(path)?,
        None => {
            warn!("FEDERATION_REGISTRY_PATH not set; only local KAOs can be served");
            FederationRegistry::empty()
        }
    };
    let identity = load_client_identity(&settings).await?;
    let client = Arc::new(HttpRemoteKasClient::new(
        identity,
        registry.ca_certificates(),
        settings.remote_kas_timeout,
    )?);
    let federation = Arc::new(FederationRouter::new(
        RequesterIdentity {
            kas_url: settings.kas_url.clone(),
            signing: keys.signing.clone(),
        },
        hsm.clone(),
        settings.hsm_timeout,
        Arc::new(registry),
        client,
        Arc::new(BreakerTable::new((&settings.breaker).into())),
        settings.remote_kas_timeout,
    ));

    let service = Arc::new(RewrapService::new(
        ServiceConfig {
            kas_url: settings.kas_url.clone(),
            kas_id: settings.kas_id.clone(),
            tenant: settings.tenant.clone(),
            policy_timeout: settings.policy_timeout,
            hsm_timeout: settings.hsm_timeout,
            request_deadline: settings.request_deadline,
            enable_timing_logs: settings.enable_timing_logs,
        },
        keys,
        ServiceDeps {
            tokens,
            dpop,
            policy,
            router: federation,
            hsm,
            audit: Arc::new(LogAuditSink),
        },
    )?);

    let state = Arc::new(RewrapState {
        service,
        limiter: RateLimiter::new(cache, settings.rate_limit_per_minute),
        public_url: settings.kas_url.clone(),
    });
    let app = router(state);

    // Bind the server
    let listener = TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    info!("Listening on: 0.0.0.0:{}", settings.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

fn load_key(
    path: Option<&str>,
    variable: &str,
) -> Result<SecureEcPrivateKey, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)?;
            Ok(SecureEcPrivateKey::from_pem(&pem)?)
        }
        None => {
            warn!("{} not set, generating an ephemeral key for this process", variable);
            Ok(SecureEcPrivateKey::generate())
        }
    }
}

async fn load_client_identity(
    settings: &Settings,
) -> Result<Option<ClientIdentity>, Box<dyn std::error::Error>> {
    match (
        &settings.federation_client_cert_path,
        &settings.federation_client_key_path,
    ) {
        (Some(cert), Some(key)) => Ok(Some(ClientIdentity {
            certificate_pem: tokio::fs::read(cert).await?,
            private_key_pem: tokio::fs::read(key).await?,
        })),
        (None, None) => Ok(None),
        _ => Err("FEDERATION_CLIENT_CERT_PATH and FEDERATION_CLIENT_KEY_PATH must be set together".into()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
