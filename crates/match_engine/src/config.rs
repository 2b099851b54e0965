//! Process-wide engine configuration, resolved once at startup from
//! `VISITD_*` environment variables.

use std::time::Duration;

use rand::RngCore;
use thiserror::Error;

use identity_token::DEFAULT_MAX_AGE_MS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("VISITD_SERVER_SECRET is required when VISITD_ENV=production")]
    MissingSecret,
}

/// Tunables of the identification engine. Read-only after startup.
pub struct EngineConfig {
    /// HMAC key for the persistent-identity layer. Required in production.
    pub server_secret: Vec<u8>,
    /// Identity token expiry.
    pub identity_max_age_ms: i64,
    /// Candidate window for the fuzzy layer.
    pub fuzzy_scan_limit: usize,
    /// Candidate window for the fuzzy-stable layer.
    pub stable_scan_limit: usize,
    /// Max Hamming distance for a fuzzy match.
    pub fuzzy_threshold: usize,
    /// Max Hamming distance for a fuzzy-stable match.
    pub stable_fuzzy_threshold: usize,
    /// History window for the trust scorer.
    pub trust_window_days: i64,
    /// Minimum reported gpu_score for the GPU hash to be usable.
    pub gpu_score_min: f64,
    /// Per-operation deadline on store access.
    pub store_op_timeout: Duration,
}

// The secret must not leak through Debug output.
impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("server_secret", &"<redacted>")
            .field("identity_max_age_ms", &self.identity_max_age_ms)
            .field("fuzzy_scan_limit", &self.fuzzy_scan_limit)
            .field("stable_scan_limit", &self.stable_scan_limit)
            .field("fuzzy_threshold", &self.fuzzy_threshold)
            .field("stable_fuzzy_threshold", &self.stable_fuzzy_threshold)
            .field("trust_window_days", &self.trust_window_days)
            .field("gpu_score_min", &self.gpu_score_min)
            .field("store_op_timeout", &self.store_op_timeout)
            .finish()
    }
}

impl EngineConfig {
    /// Defaults with an explicit secret. Used by tests and embedders.
    pub fn with_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            server_secret: secret.into(),
            identity_max_age_ms: DEFAULT_MAX_AGE_MS,
            fuzzy_scan_limit: 1000,
            stable_scan_limit: 500,
            fuzzy_threshold: 8,
            stable_fuzzy_threshold: 4,
            trust_window_days: 7,
            gpu_score_min: 0.1,
            store_op_timeout: Duration::from_millis(2000),
        }
    }

    /// Resolve from the environment.
    ///
    /// Outside production a missing secret is replaced by an ephemeral
    /// random one, which invalidates previously issued tokens on restart.
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = match std::env::var("VISITD_SERVER_SECRET") {
            Ok(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                let env = std::env::var("VISITD_ENV").unwrap_or_default();
                if env == "production" || env == "prod" {
                    return Err(ConfigError::MissingSecret);
                }
                tracing::warn!(
                    "VISITD_SERVER_SECRET not set; using an ephemeral secret, \
                     issued identity tokens will not survive a restart"
                );
                let mut buf = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut buf);
                hex::encode(buf).into_bytes()
            }
        };

        let mut cfg = Self::with_secret(secret);
        cfg.identity_max_age_ms = env_parse("VISITD_IDENTITY_MAX_AGE_MS", cfg.identity_max_age_ms);
        cfg.fuzzy_scan_limit = env_parse("VISITD_FUZZY_SCAN_LIMIT", cfg.fuzzy_scan_limit);
        cfg.stable_scan_limit = env_parse("VISITD_STABLE_SCAN_LIMIT", cfg.stable_scan_limit);
        cfg.fuzzy_threshold = env_parse("VISITD_FUZZY_THRESHOLD", cfg.fuzzy_threshold);
        cfg.stable_fuzzy_threshold =
            env_parse("VISITD_STABLE_FUZZY_THRESHOLD", cfg.stable_fuzzy_threshold);
        cfg.trust_window_days = env_parse("VISITD_TRUST_WINDOW_DAYS", cfg.trust_window_days);
        cfg.gpu_score_min = env_parse("VISITD_GPU_SCORE_MIN", cfg.gpu_score_min);
        cfg.store_op_timeout = Duration::from_millis(env_parse(
            "VISITD_STORE_OP_TIMEOUT_MS",
            cfg.store_op_timeout.as_millis() as u64,
        ));
        Ok(cfg)
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring unparseable {key}={raw}");
            default
        }),
        Err(_) => default,
    }
}
