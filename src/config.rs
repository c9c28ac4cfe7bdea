//! Environment-driven settings.

use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::cache::CacheTtls;
use crate::federation::BreakerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsmBackend {
    /// Hex encoded 32-byte master key; random when absent.
    Mock { master_key: Option<String> },
    AwsKms { region: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub kas_url: String,
    pub kas_id: String,
    pub tenant: String,
    pub kas_ec_key_path: Option<String>,
    pub kas_signing_key_path: Option<String>,
    pub hsm_backend: HsmBackend,
    pub redis_url: Option<String>,
    pub oidc_issuers: Vec<String>,
    pub oidc_jwks_url: Option<String>,
    pub oidc_audience: Option<String>,
    pub opa_url: String,
    pub federation_registry_path: Option<String>,
    pub federation_client_cert_path: Option<String>,
    pub federation_client_key_path: Option<String>,
    pub policy_timeout: Duration,
    pub remote_kas_timeout: Duration,
    pub cache_timeout: Duration,
    pub hsm_timeout: Duration,
    pub request_deadline: Duration,
    pub breaker: BreakerSettings,
    pub cache_ttls: CacheTtls,
    pub dpop_max_age: Duration,
    pub rate_limit_per_minute: u64,
    pub enable_timing_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        BreakerConfig {
            failure_threshold: s.failure_threshold,
            failure_window: s.failure_window,
            base_cooldown: s.cooldown,
            max_cooldown: s.max_cooldown,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self::from_lookup(|name| std::env::var(name).ok())?;
        info!(
            "Loaded settings: port={}, kas_url={}, hsm={:?}, cache={}",
            settings.port,
            settings.kas_url,
            match &settings.hsm_backend {
                HsmBackend::Mock { .. } => "mock",
                HsmBackend::AwsKms { .. } => "aws-kms",
            },
            if settings.redis_url.is_some() { "redis" } else { "memory" },
        );
        Ok(settings)
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);

        let hsm_backend = match env.string("HSM_PROVIDER", "mock").as_str() {
            "mock" => HsmBackend::Mock {
                master_key: env.optional("MOCK_HSM_MASTER_KEY"),
            },
            "aws-kms" => HsmBackend::AwsKms {
                region: env.optional("AWS_KMS_REGION"),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "HSM_PROVIDER",
                    value: other.to_string(),
                    reason: "expected mock or aws-kms".to_string(),
                })
            }
        };

        let oidc_issuers = env
            .optional("OIDC_ISSUER")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Settings {
            port: env.parse("PORT", 8080)?,
            kas_url: env.string("KAS_URL", "https://localhost:8080"),
            kas_id: env.string("KAS_ID", "local-kas"),
            tenant: env.string("TENANT", "default"),
            kas_ec_key_path: env.optional("KAS_EC_KEY_PATH"),
            kas_signing_key_path: env.optional("KAS_SIGNING_KEY_PATH"),
            hsm_backend,
            redis_url: env.optional("REDIS_URL"),
            oidc_issuers,
            oidc_jwks_url: env.optional("OIDC_JWKS_URL"),
            oidc_audience: env.optional("OIDC_AUDIENCE"),
            opa_url: env.string(
                "OPA_URL",
                "http://localhost:8181/v1/data/kas/authorization/decision",
            ),
            federation_registry_path: env.optional("FEDERATION_REGISTRY_PATH"),
            federation_client_cert_path: env.optional("FEDERATION_CLIENT_CERT_PATH"),
            federation_client_key_path: env.optional("FEDERATION_CLIENT_KEY_PATH"),
            policy_timeout: env.millis("POLICY_TIMEOUT_MS", 1000)?,
            remote_kas_timeout: env.millis("REMOTE_KAS_TIMEOUT_MS", 2000)?,
            cache_timeout: env.millis("CACHE_TIMEOUT_MS", 100)?,
            hsm_timeout: env.millis("HSM_TIMEOUT_MS", 2000)?,
            request_deadline: env.millis("REQUEST_DEADLINE_MS", 5000)?,
            breaker: BreakerSettings {
                failure_threshold: env.parse("BREAKER_FAILURE_THRESHOLD", 5)?,
                failure_window: env.millis("BREAKER_FAILURE_WINDOW_MS", 30_000)?,
                cooldown: env.millis("BREAKER_COOLDOWN_MS", 5000)?,
                max_cooldown: env.millis("BREAKER_MAX_COOLDOWN_MS", 60_000)?,
            },
            cache_ttls: CacheTtls {
                unwrapped_key: Duration::from_secs(env.parse("CACHE_UNWRAP_TTL_SECONDS", 60)?),
                public_key: Duration::from_secs(env.parse("CACHE_PUBLIC_KEY_TTL_SECONDS", 3600)?),
            },
            dpop_max_age: Duration::from_secs(env.parse("DPOP_MAX_AGE_SECONDS", 60)?),
            rate_limit_per_minute: env.parse("RATE_LIMIT_PER_MINUTE", 120)?,
            enable_timing_logs: env.parse("ENABLE_TIMING_LOGS", false)?,
        })
    }

    /// Bearer-token trust requires both an issuer and a JWKS location.
    pub fn require_oidc(&self) -> Result<(&[String], &str), ConfigError> {
        if self.oidc_issuers.is_empty() {
            return Err(ConfigError::Missing("OIDC_ISSUER"));
        }
        let jwks = self
            .oidc_jwks_url
            .as_deref()
            .ok_or(ConfigError::Missing("OIDC_JWKS_URL"))?;
        Ok((&self.oidc_issuers, jwks))
    }
}

struct Lookup<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Lookup<'_, F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(name, default).map(Duration::from_millis)
    }
}
