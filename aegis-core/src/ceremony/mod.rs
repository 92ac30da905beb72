//! Ceremony orchestration
//!
//! [`Orchestrator`] runs the registration and assertion ceremonies against
//! the collaborators in [`CeremonyServices`] and the per-request
//! [`CeremonyContext`]. It holds no mutable state of its own: the in-flight
//! challenge lives in the browser session, credentials live in the
//! repository.
//!
//! Every Finish clears the challenge exactly once, whatever the outcome, so
//! a challenge can never be replayed.

mod assertion;
mod management;
mod registration;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Duration;

use crate::clock::{self, Clock, SystemClock};
use crate::error::CeremonyError;
use crate::notify::{LoggingNotifier, Notifier};
use crate::regulation::RegulationGate;
use crate::relying_party::{ForwardedOrigin, RelyingPartyResolver};
use crate::session::{CeremonyKind, ChallengeSession, ChallengeSessionStore, UserSessionStore};
use crate::storage::CredentialRepository;
use crate::verifier::CeremonyVerifier;

/// Default "remember me" lifetime (30 days)
const DEFAULT_REMEMBER_ME_SECS: i64 = 30 * 24 * 60 * 60;

/// Ceremony behaviour switches.
#[derive(Debug, Clone)]
pub struct CeremonyPolicy {
    /// Allow discoverable (usernameless) passkey login
    pub passkey_login_enabled: bool,
    /// Offer every credential, not only discoverable ones, to passkey login
    pub passkey_upgrade: bool,
    /// A user-verified passkey login counts as two factors
    pub passkey_uv_two_factor: bool,
    /// Session extension granted by "remember me"; zero disables it
    pub remember_me: Duration,
    /// AppID for legacy U2F credentials; defaults to the request origin
    pub u2f_app_id: Option<String>,
}

impl Default for CeremonyPolicy {
    fn default() -> Self {
        Self {
            passkey_login_enabled: true,
            passkey_upgrade: false,
            passkey_uv_two_factor: false,
            remember_me: Duration::seconds(DEFAULT_REMEMBER_ME_SECS),
            u2f_app_id: None,
        }
    }
}

impl CeremonyPolicy {
    /// Load policy from environment variables
    ///
    /// - `PASSKEY_LOGIN_ENABLED` (default: true)
    /// - `PASSKEY_UPGRADE_ENABLED` (default: false)
    /// - `PASSKEY_UV_TWO_FACTOR` (default: false)
    /// - `SESSION_REMEMBER_ME_SECS` (default: 30 days, `0` disables)
    /// - `WEBAUTHN_U2F_APP_ID` (default: request origin)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            passkey_login_enabled: env_flag("PASSKEY_LOGIN_ENABLED")
                .unwrap_or(defaults.passkey_login_enabled),
            passkey_upgrade: env_flag("PASSKEY_UPGRADE_ENABLED")
                .unwrap_or(defaults.passkey_upgrade),
            passkey_uv_two_factor: env_flag("PASSKEY_UV_TWO_FACTOR")
                .unwrap_or(defaults.passkey_uv_two_factor),
            remember_me: std::env::var("SESSION_REMEMBER_ME_SECS")
                .ok()
                .and_then(|v| clock::parse_seconds(&v))
                .unwrap_or(defaults.remember_me),
            u2f_app_id: std::env::var("WEBAUTHN_U2F_APP_ID")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// Long-lived collaborators shared by all requests.
#[derive(Clone)]
pub struct CeremonyServices {
    credentials: Arc<dyn CredentialRepository>,
    regulator: Arc<dyn RegulationGate>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: CeremonyPolicy,
}

impl CeremonyServices {
    /// Services with the logging notifier, the system clock and the default
    /// policy.
    pub fn new(
        credentials: Arc<dyn CredentialRepository>,
        regulator: Arc<dyn RegulationGate>,
    ) -> Self {
        Self {
            credentials,
            regulator,
            notifier: Arc::new(LoggingNotifier),
            clock: Arc::new(SystemClock),
            policy: CeremonyPolicy::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: CeremonyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &CeremonyPolicy {
        &self.policy
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialRepository> {
        &self.credentials
    }
}

impl std::fmt::Debug for CeremonyServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CeremonyServices")
            .field("policy", &self.policy)
            .finish()
    }
}

/// Per-request inputs: origin headers, caller address and the caller's
/// browser session.
pub struct CeremonyContext<'a> {
    pub origin: ForwardedOrigin,
    pub remote_ip: IpAddr,
    pub sessions: &'a dyn UserSessionStore,
    pub challenges: &'a dyn ChallengeSessionStore,
}

impl<'a> CeremonyContext<'a> {
    pub fn new(
        origin: ForwardedOrigin,
        remote_ip: IpAddr,
        sessions: &'a dyn UserSessionStore,
        challenges: &'a dyn ChallengeSessionStore,
    ) -> Self {
        Self {
            origin,
            remote_ip,
            sessions,
            challenges,
        }
    }
}

/// Assertion Begin variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionBegin {
    /// Second factor for the user already in the session
    Classic,
    /// Usernameless passkey login from an anonymous session
    Discoverable,
}

/// Assertion Finish variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionFinish {
    Classic,
    Discoverable { keep_me_logged_in: bool },
}

impl AssertionFinish {
    fn is_discoverable(&self) -> bool {
        matches!(self, Self::Discoverable { .. })
    }
}

/// WebAuthn ceremony state machine.
pub struct Orchestrator<V> {
    verifier: V,
    resolver: RelyingPartyResolver,
    services: CeremonyServices,
}

impl<V: CeremonyVerifier> Orchestrator<V> {
    pub fn new(verifier: V, resolver: RelyingPartyResolver, services: CeremonyServices) -> Self {
        Self {
            verifier,
            resolver,
            services,
        }
    }

    pub fn resolver(&self) -> &RelyingPartyResolver {
        &self.resolver
    }

    pub fn services(&self) -> &CeremonyServices {
        &self.services
    }

    /// Load the challenge for `kind`, failing closed when it is absent,
    /// issued for another ceremony, or expired.
    async fn live_challenge(
        &self,
        ctx: &CeremonyContext<'_>,
        kind: CeremonyKind,
        missing: &'static str,
    ) -> Result<ChallengeSession, CeremonyError> {
        let challenge = ctx
            .challenges
            .get()
            .await?
            .ok_or(CeremonyError::ChallengeMissing(missing))?;

        if challenge.ceremony != kind {
            tracing::warn!(
                expected = ?kind,
                found = ?challenge.ceremony,
                "Challenge was issued for another ceremony"
            );
            return Err(CeremonyError::ChallengeMissing(missing));
        }

        if challenge.is_expired(self.services.clock.now()) {
            tracing::warn!(rp_id = %challenge.rp_id, "Challenge expired");
            return Err(CeremonyError::ChallengeMissing(missing));
        }

        Ok(challenge)
    }

    /// Clear the challenge at the end of a Finish. A failure here is logged
    /// and leaves the ceremony outcome unchanged.
    async fn clear_challenge(&self, ctx: &CeremonyContext<'_>) {
        if let Err(e) = ctx.challenges.clear().await {
            tracing::error!(error = %e, "Failed to clear challenge session");
        }
    }

    fn challenge_expiry(&self, timeout: std::time::Duration) -> Duration {
        Duration::from_std(timeout).unwrap_or_else(|_| Duration::seconds(60))
    }
}
