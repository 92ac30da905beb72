//! Browser session state touched by ceremonies
//!
//! Two views of one browser session:
//! - [`ChallengeSessionStore`]: the single in-flight ceremony challenge
//! - [`UserSessionStore`]: identity, authentication level and markers
//!
//! Both are scoped to the caller's session; the orchestrator never sees
//! another user's session.

mod memory;

pub use memory::{MemorySessionStore, SessionHandle};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::UserHandle;
use crate::relying_party::UserVerification;

/// Session store errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session backend error: {0}")]
    Backend(String),

    #[error("Session serialization error: {0}")]
    Serialization(String),
}

/// Which ceremony a challenge was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CeremonyKind {
    Registration,
    Assertion,
    Discoverable,
}

/// An in-flight ceremony, created at Begin and consumed at Finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSession {
    pub ceremony: CeremonyKind,
    /// RPID resolved at Begin
    pub rp_id: String,
    /// Expected user; `None` for discoverable logins
    pub user_handle: Option<UserHandle>,
    /// Requested credential description (registration only)
    pub description: Option<String>,
    pub user_verification: UserVerification,
    /// Opaque verifier state, including the challenge nonce
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChallengeSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Storage for the in-flight challenge of one browser session.
#[async_trait]
pub trait ChallengeSessionStore: Send + Sync {
    async fn get(&self) -> Result<Option<ChallengeSession>, SessionError>;
    async fn put(&self, challenge: ChallengeSession) -> Result<(), SessionError>;
    async fn clear(&self) -> Result<(), SessionError>;
}

/// Authentication level of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationLevel {
    #[default]
    Anonymous,
    OneFactor,
    TwoFactor,
}

/// Authenticator details recorded on the session after a WebAuthn login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatorMarkers {
    pub passkey: bool,
    pub user_present: bool,
    pub user_verified: bool,
    /// Roaming (hardware) authenticator
    pub cross_platform: bool,
}

/// The identity-bearing part of a browser session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub level: AuthenticationLevel,
    pub first_factor_at: Option<DateTime<Utc>>,
    pub second_factor_at: Option<DateTime<Utc>>,
    pub authenticator: Option<AuthenticatorMarkers>,
    /// Extended lifetime granted by "remember me"
    pub remember_me_until: Option<DateTime<Utc>>,
}

impl UserSession {
    /// Session established by a first factor for `username`.
    pub fn one_factor(username: &str, at: DateTime<Utc>) -> Self {
        Self {
            username: Some(username.to_string()),
            display_name: Some(username.to_string()),
            level: AuthenticationLevel::OneFactor,
            first_factor_at: Some(at),
            ..Self::default()
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.level == AuthenticationLevel::Anonymous || self.username.is_none()
    }

    /// Username of a non-anonymous session.
    pub fn authenticated_username(&self) -> Option<&str> {
        if self.is_anonymous() {
            None
        } else {
            self.username.as_deref()
        }
    }
}

/// Storage for the identity part of one browser session.
#[async_trait]
pub trait UserSessionStore: Send + Sync {
    async fn load(&self) -> Result<UserSession, SessionError>;
    async fn save(&self, session: &UserSession) -> Result<(), SessionError>;
    /// Move the session to a fresh identifier (session fixation defence).
    async fn regenerate(&self) -> Result<(), SessionError>;
}
