//! Server configuration module
//!
//! Handles loading configuration from environment variables with sensible defaults.

use std::net::SocketAddr;

use aegis_core::{
    CeremonyPolicy, RegulationConfig, RelyingPartyError, StorageError, WebAuthnSettings,
};

/// Startup configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid WebAuthn configuration: {0}")]
    WebAuthn(#[from] RelyingPartyError),

    #[error("Credential storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration value out of range: {0}")]
    InvalidValue(&'static str),
}

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 3000)
    pub port: u16,
    /// Server host (default: 127.0.0.1)
    pub host: [u8; 4],
    /// Allowed CORS origins, comma-separated (default: allow all in dev)
    pub allowed_origins: Option<Vec<String>>,
    /// Request body limit in KB (default: 64)
    pub body_limit_kb: usize,
    /// Request timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// Enable rate limiting (default: false for tests, true when loaded from env)
    pub rate_limit_enabled: bool,
    /// Rate limit: requests per second (default: 10)
    pub rate_limit_per_sec: u64,
    /// Rate limit: burst size (default: 20)
    pub rate_limit_burst: u32,
    /// PostgreSQL URL; credentials are kept in memory when unset
    pub database_url: Option<String>,
    /// Database connection pool maximum connections (default: 20)
    pub database_max_connections: u32,
    /// Database connection pool minimum connections (default: 2)
    pub database_min_connections: u32,
    /// Session inactivity timeout in seconds (default: 300)
    pub session_inactivity_secs: i64,
    /// Interval between expired session sweeps in seconds (default: 60)
    pub session_purge_interval_secs: u64,
    /// Mark the session cookie `Secure` (default: false for tests, true when loaded from env)
    pub session_cookie_secure: bool,
    /// Relying Party settings
    pub webauthn: WebAuthnSettings,
    /// Passkey and session policy
    pub policy: CeremonyPolicy,
    /// Ban thresholds
    pub regulation: RegulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            host: [127, 0, 0, 1],
            allowed_origins: None, // None = allow all (dev mode)
            body_limit_kb: 64,
            timeout_secs: 30,
            rate_limit_enabled: false, // Disabled by default (for tests)
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
            database_url: None,
            database_max_connections: 20,
            database_min_connections: 2,
            session_inactivity_secs: 300,
            session_purge_interval_secs: 60,
            session_cookie_secure: false,
            webauthn: WebAuthnSettings::default(),
            policy: CeremonyPolicy::default(),
            regulation: RegulationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = env_parse("PORT").unwrap_or(defaults.port);

        let host = std::env::var("HOST")
            .ok()
            .map(|h| {
                if h == "0.0.0.0" {
                    [0, 0, 0, 0]
                } else {
                    [127, 0, 0, 1]
                }
            })
            .unwrap_or(defaults.host);

        let allowed_origins = std::env::var("ALLOWED_ORIGINS").ok().map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        // Rate limiting enabled by default in production, can be disabled with RATE_LIMIT_ENABLED=false
        let rate_limit_enabled = std::env::var("RATE_LIMIT_ENABLED")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);

        let session_cookie_secure = std::env::var("SESSION_COOKIE_SECURE")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Self {
            port,
            host,
            allowed_origins,
            body_limit_kb: env_parse("BODY_LIMIT_KB").unwrap_or(defaults.body_limit_kb),
            timeout_secs: env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(defaults.timeout_secs),
            rate_limit_enabled,
            rate_limit_per_sec: env_parse("RATE_LIMIT_PER_SEC")
                .unwrap_or(defaults.rate_limit_per_sec),
            rate_limit_burst: env_parse("RATE_LIMIT_BURST").unwrap_or(defaults.rate_limit_burst),
            database_url,
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            database_min_connections: env_parse("DATABASE_MIN_CONNECTIONS")
                .unwrap_or(defaults.database_min_connections),
            session_inactivity_secs: env_parse("SESSION_INACTIVITY_SECS")
                .filter(|v| *v > 0 && aegis_core::clock::seconds(*v).is_some())
                .unwrap_or(defaults.session_inactivity_secs),
            session_purge_interval_secs: env_parse("SESSION_PURGE_INTERVAL_SECS")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.session_purge_interval_secs),
            session_cookie_secure,
            webauthn: WebAuthnSettings::from_env()?,
            policy: CeremonyPolicy::from_env(),
            regulation: RegulationConfig::from_env(),
        })
    }

    /// Get socket address from config
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.host, self.port))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
