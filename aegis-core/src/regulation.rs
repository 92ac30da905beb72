//! Authentication regulation
//!
//! Ceremonies consult a [`RegulationGate`] after a successful verification
//! and report every attempt to it. The gate decides bans; the ceremony only
//! enforces them.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::{self, Clock, SystemClock};

/// Regulation backend errors
#[derive(Debug, thiserror::Error)]
pub enum RegulationError {
    #[error("Regulation backend error: {0}")]
    Backend(String),
}

/// Authentication method of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptMethod {
    /// WebAuthn second factor
    WebAuthn,
    /// Passkey first factor
    Passkey,
}

impl fmt::Display for AttemptMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebAuthn => f.write_str("WebAuthn"),
            Self::Passkey => f.write_str("Passkey"),
        }
    }
}

/// One authentication attempt as reported to the regulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationAttempt {
    pub successful: bool,
    /// The attempt was refused because of an active ban
    pub banned: bool,
    pub username: String,
    pub method: AttemptMethod,
    pub remote_ip: IpAddr,
    pub time: DateTime<Utc>,
}

/// Ban checks and attempt recording.
#[async_trait]
pub trait RegulationGate: Send + Sync {
    async fn is_ip_banned(&self, ip: IpAddr) -> Result<bool, RegulationError>;
    async fn is_user_banned(&self, username: &str) -> Result<bool, RegulationError>;
    async fn record_attempt(&self, attempt: AuthenticationAttempt) -> Result<(), RegulationError>;
}

/// Regulation thresholds.
#[derive(Debug, Clone)]
pub struct RegulationConfig {
    /// Failures inside `find_time` that trigger a ban; `0` disables regulation
    pub max_retries: u32,
    pub find_time: Duration,
    pub ban_time: Duration,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            find_time: Duration::minutes(2),
            ban_time: Duration::minutes(5),
        }
    }
}

impl RegulationConfig {
    /// Regulation turned off: nothing is ever banned.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Load thresholds from environment variables
    ///
    /// - `REGULATION_MAX_RETRIES` (default: 3, `0` disables)
    /// - `REGULATION_FIND_TIME_SECS` (default: 120)
    /// - `REGULATION_BAN_TIME_SECS` (default: 300)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_retries: std::env::var("REGULATION_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            find_time: std::env::var("REGULATION_FIND_TIME_SECS")
                .ok()
                .and_then(|v| clock::parse_seconds(&v))
                .unwrap_or(defaults.find_time),
            ban_time: std::env::var("REGULATION_BAN_TIME_SECS")
                .ok()
                .and_then(|v| clock::parse_seconds(&v))
                .unwrap_or(defaults.ban_time),
        }
    }

    fn enabled(&self) -> bool {
        self.max_retries > 0
    }
}

/// In-memory regulator.
///
/// A subject (user or IP) is banned for `ban_time` once `max_retries`
/// consecutive failures fall within `find_time`. A success resets the run.
pub struct MemoryRegulator {
    config: RegulationConfig,
    clock: Arc<dyn Clock>,
    by_user: DashMap<String, Vec<AuthenticationAttempt>>,
    by_ip: DashMap<IpAddr, Vec<AuthenticationAttempt>>,
    unavailable: AtomicBool,
}

impl MemoryRegulator {
    pub fn new(config: RegulationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            by_user: DashMap::new(),
            by_ip: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Regulator that never bans, still recording attempts.
    pub fn disabled() -> Self {
        Self::new(RegulationConfig::disabled(), Arc::new(SystemClock))
    }

    /// Simulate a backend outage: every call fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Attempts recorded for `username`, oldest first.
    pub fn attempts_for(&self, username: &str) -> Vec<AuthenticationAttempt> {
        self.by_user
            .get(username)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn available(&self) -> Result<(), RegulationError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegulationError::Backend(
                "regulation store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn is_banned(&self, attempts: &[AuthenticationAttempt]) -> bool {
        if !self.config.enabled() {
            return false;
        }

        let failures: Vec<&AuthenticationAttempt> = attempts
            .iter()
            .rev()
            .take_while(|a| !a.successful)
            .filter(|a| !a.banned)
            .take(self.config.max_retries as usize)
            .collect();

        if failures.len() < self.config.max_retries as usize {
            return false;
        }

        let (Some(newest), Some(oldest)) = (failures.first(), failures.last()) else {
            return false;
        };

        newest.time - oldest.time <= self.config.find_time
            && self.clock.now() < newest.time + self.config.ban_time
    }

    fn horizon(&self) -> DateTime<Utc> {
        self.clock.now() - self.config.find_time - self.config.ban_time
    }
}

impl Default for MemoryRegulator {
    fn default() -> Self {
        Self::new(RegulationConfig::default(), Arc::new(SystemClock))
    }
}

impl fmt::Debug for MemoryRegulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegulator")
            .field("config", &self.config)
            .field("users", &self.by_user.len())
            .field("ips", &self.by_ip.len())
            .finish()
    }
}

#[async_trait]
impl RegulationGate for MemoryRegulator {
    async fn is_ip_banned(&self, ip: IpAddr) -> Result<bool, RegulationError> {
        self.available()?;
        Ok(self
            .by_ip
            .get(&ip)
            .map(|entry| self.is_banned(entry.value()))
            .unwrap_or(false))
    }

    async fn is_user_banned(&self, username: &str) -> Result<bool, RegulationError> {
        self.available()?;
        Ok(self
            .by_user
            .get(username)
            .map(|entry| self.is_banned(entry.value()))
            .unwrap_or(false))
    }

    async fn record_attempt(&self, attempt: AuthenticationAttempt) -> Result<(), RegulationError> {
        self.available()?;
        let horizon = self.horizon();

        {
            let mut ip_attempts = self.by_ip.entry(attempt.remote_ip).or_default();
            ip_attempts.retain(|a| a.time >= horizon);
            ip_attempts.push(attempt.clone());
        }

        let mut user_attempts = self.by_user.entry(attempt.username.clone()).or_default();
        user_attempts.retain(|a| a.time >= horizon);
        user_attempts.push(attempt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn attempt(clock: &FixedClock, successful: bool) -> AuthenticationAttempt {
        AuthenticationAttempt {
            successful,
            banned: false,
            username: "john".to_string(),
            method: AttemptMethod::WebAuthn,
            remote_ip: "10.0.0.1".parse().unwrap(),
            time: clock.now(),
        }
    }

    #[tokio::test]
    async fn test_ban_after_max_retries() {
        let clock = Arc::new(FixedClock::default());
        let regulator = MemoryRegulator::new(RegulationConfig::default(), clock.clone());
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..2 {
            regulator.record_attempt(attempt(&clock, false)).await.unwrap();
            clock.advance(Duration::seconds(10));
        }
        assert!(!regulator.is_user_banned("john").await.unwrap());

        regulator.record_attempt(attempt(&clock, false)).await.unwrap();
        assert!(regulator.is_user_banned("john").await.unwrap());
        assert!(regulator.is_ip_banned(ip).await.unwrap());

        clock.advance(Duration::minutes(6));
        assert!(!regulator.is_user_banned("john").await.unwrap());
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let clock = Arc::new(FixedClock::default());
        let regulator = MemoryRegulator::new(RegulationConfig::default(), clock.clone());

        regulator.record_attempt(attempt(&clock, false)).await.unwrap();
        regulator.record_attempt(attempt(&clock, false)).await.unwrap();
        regulator.record_attempt(attempt(&clock, true)).await.unwrap();
        regulator.record_attempt(attempt(&clock, false)).await.unwrap();

        assert!(!regulator.is_user_banned("john").await.unwrap());
        assert_eq!(regulator.attempts_for("john").len(), 4);
    }

    #[tokio::test]
    async fn test_failures_spread_beyond_find_time() {
        let clock = Arc::new(FixedClock::default());
        let regulator = MemoryRegulator::new(RegulationConfig::default(), clock.clone());

        for _ in 0..3 {
            regulator.record_attempt(attempt(&clock, false)).await.unwrap();
            clock.advance(Duration::seconds(90));
        }
        assert!(!regulator.is_user_banned("john").await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_regulation() {
        let clock = Arc::new(FixedClock::default());
        let regulator = MemoryRegulator::new(RegulationConfig::disabled(), clock.clone());

        for _ in 0..10 {
            regulator.record_attempt(attempt(&clock, false)).await.unwrap();
        }
        assert!(!regulator.is_user_banned("john").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_backend_errors() {
        let regulator = MemoryRegulator::default();
        regulator.set_unavailable(true);
        assert!(regulator.is_user_banned("john").await.is_err());
    }
}
