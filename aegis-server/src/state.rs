//! Application state module
//!
//! Defines shared state accessible across all request handlers.

use std::sync::Arc;

use aegis_core::{
    CeremonyServices, CredentialRepository, MemoryCredentialRepository, MemoryRegulator,
    MemorySessionStore, Orchestrator, RelyingPartyResolver, SystemClock, WebauthnRsVerifier,
};

use crate::config::{Config, ConfigError};
use crate::db::{self, PostgresCredentialRepository};

/// Application state containing shared resources.
#[derive(Clone)]
pub struct AppState {
    /// Ceremony orchestrator
    pub orchestrator: Arc<Orchestrator<WebauthnRsVerifier>>,
    /// Browser sessions
    pub sessions: Arc<MemorySessionStore>,
    /// PostgreSQL repository, when `DATABASE_URL` is configured
    pub database: Option<Arc<PostgresCredentialRepository>>,
    /// Whether session cookies carry `Secure`
    pub cookie_secure: bool,
}

impl AppState {
    /// State backed by in-memory credentials (development and tests).
    pub fn in_memory(config: &Config) -> Result<Self, ConfigError> {
        Self::build(config, Arc::new(MemoryCredentialRepository::new()), None)
    }

    /// State for the configured backend: PostgreSQL when a database URL is
    /// set, memory otherwise.
    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        match &config.database_url {
            Some(url) => {
                let repository = Arc::new(db::connect(url, config).await?);
                Self::build(config, repository.clone(), Some(repository))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, credentials are kept in memory");
                Self::in_memory(config)
            }
        }
    }

    fn build(
        config: &Config,
        credentials: Arc<dyn CredentialRepository>,
        database: Option<Arc<PostgresCredentialRepository>>,
    ) -> Result<Self, ConfigError> {
        let clock = Arc::new(SystemClock);
        let resolver = RelyingPartyResolver::new(config.webauthn.clone())?;
        let regulator = MemoryRegulator::new(config.regulation.clone(), clock.clone());

        let services = CeremonyServices::new(credentials, Arc::new(regulator))
            .with_clock(clock.clone())
            .with_policy(config.policy.clone());

        let inactivity = aegis_core::clock::seconds(config.session_inactivity_secs)
            .ok_or(ConfigError::InvalidValue("session_inactivity_secs"))?;
        let sessions = MemorySessionStore::new(inactivity, clock);

        Ok(Self {
            orchestrator: Arc::new(Orchestrator::new(
                WebauthnRsVerifier::new(),
                resolver,
                services,
            )),
            sessions: Arc::new(sessions),
            database,
            cookie_secure: config.session_cookie_secure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_state() {
        let state = AppState::in_memory(&Config::default()).unwrap();
        assert!(state.database.is_none());
        assert_eq!(state.sessions.session_count(), 0);
    }

    #[test]
    fn test_out_of_range_inactivity_is_rejected() {
        let config = Config {
            session_inactivity_secs: i64::MAX,
            ..Config::default()
        };
        assert!(matches!(
            AppState::in_memory(&config),
            Err(ConfigError::InvalidValue("session_inactivity_secs"))
        ));
    }
}
