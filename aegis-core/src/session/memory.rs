//! In-memory browser sessions
//!
//! Sessions are temporary and expire after a period of inactivity (5 minutes
//! by default) unless "remember me" extended them. A [`SessionHandle`] is a
//! per-request view on one session and implements both session traits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{ChallengeSession, ChallengeSessionStore, SessionError, UserSession, UserSessionStore};
use crate::clock::{Clock, SystemClock};

/// Default inactivity timeout (5 minutes)
const DEFAULT_INACTIVITY_SECS: i64 = 300;

struct SessionRecord {
    user: UserSession,
    challenge: Option<ChallengeSession>,
    last_active: DateTime<Utc>,
}

impl SessionRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            user: UserSession::default(),
            challenge: None,
            last_active: now,
        }
    }

    fn is_expired(&self, now: DateTime<Utc>, inactivity: Duration) -> bool {
        if now - self.last_active <= inactivity {
            return false;
        }
        !matches!(self.user.remember_me_until, Some(until) if now < until)
    }
}

/// Thread-safe in-memory session storage
pub struct MemorySessionStore {
    /// Sessions keyed by session identifier
    sessions: DashMap<String, SessionRecord>,
    inactivity: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_INACTIVITY_SECS),
            Arc::new(SystemClock),
        )
    }
}

impl MemorySessionStore {
    pub fn new(inactivity: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            inactivity,
            clock,
        }
    }

    /// Open a handle on the session named by the request cookie.
    ///
    /// Unknown or expired identifiers get a fresh identifier; the handle then
    /// reports that a cookie must be issued.
    pub fn open(self: &Arc<Self>, id: Option<&str>) -> SessionHandle {
        let now = self.clock.now();

        let existing = id.filter(|id| {
            let expired = match self.sessions.get(*id) {
                Some(record) => record.is_expired(now, self.inactivity),
                None => return false,
            };
            if expired {
                self.sessions.remove(*id);
            }
            !expired
        });

        match existing {
            Some(id) => SessionHandle {
                store: Arc::clone(self),
                id: Mutex::new(id.to_string()),
                issued: AtomicBool::new(false),
            },
            None => SessionHandle {
                store: Arc::clone(self),
                id: Mutex::new(new_session_id()),
                issued: AtomicBool::new(true),
            },
        }
    }

    /// Create a session for an identity established elsewhere (first factor).
    pub fn insert(&self, user: UserSession) -> String {
        let id = new_session_id();
        let mut record = SessionRecord::new(self.clock.now());
        record.user = user;
        self.sessions.insert(id.clone(), record);
        id
    }

    /// Current identity of a session, if it exists.
    pub fn user(&self, id: &str) -> Option<UserSession> {
        self.sessions.get(id).map(|record| record.user.clone())
    }

    /// Current challenge of a session, if any.
    pub fn challenge(&self, id: &str) -> Option<ChallengeSession> {
        self.sessions
            .get(id)
            .and_then(|record| record.challenge.clone())
    }

    /// Remove expired sessions (called periodically). Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, record| !record.is_expired(now, self.inactivity));
        before.saturating_sub(self.sessions.len())
    }

    /// Get number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn with_record<T>(&self, id: &str, f: impl FnOnce(&mut SessionRecord) -> T) -> T {
        let now = self.clock.now();
        let mut record = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionRecord::new(now));
        record.last_active = now;
        f(&mut record)
    }

    fn read<T>(&self, id: &str, f: impl FnOnce(&SessionRecord) -> T) -> Option<T> {
        let now = self.clock.now();
        self.sessions.get_mut(id).map(|mut record| {
            record.last_active = now;
            f(&record)
        })
    }
}

impl std::fmt::Debug for MemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySessionStore")
            .field("sessions", &self.sessions.len())
            .field("inactivity", &self.inactivity)
            .finish()
    }
}

/// Per-request view on one session.
pub struct SessionHandle {
    store: Arc<MemorySessionStore>,
    id: Mutex<String>,
    issued: AtomicBool,
}

impl SessionHandle {
    /// Current session identifier.
    pub fn id(&self) -> String {
        self.id
            .lock()
            .map(|id| id.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Whether the client must be sent a (new) session cookie.
    pub fn cookie_required(&self) -> bool {
        self.issued.load(Ordering::SeqCst) && self.store.sessions.contains_key(&self.id())
    }

    fn set_id(&self, id: String) -> Result<(), SessionError> {
        let mut current = self
            .id
            .lock()
            .map_err(|_| SessionError::Backend("session handle lock poisoned".to_string()))?;
        *current = id;
        Ok(())
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("issued", &self.issued.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl ChallengeSessionStore for SessionHandle {
    async fn get(&self) -> Result<Option<ChallengeSession>, SessionError> {
        Ok(self
            .store
            .read(&self.id(), |record| record.challenge.clone())
            .flatten())
    }

    async fn put(&self, challenge: ChallengeSession) -> Result<(), SessionError> {
        self.store
            .with_record(&self.id(), |record| record.challenge = Some(challenge));
        Ok(())
    }

    async fn clear(&self) -> Result<(), SessionError> {
        if let Some(mut record) = self.store.sessions.get_mut(&self.id()) {
            record.challenge = None;
        }
        Ok(())
    }
}

#[async_trait]
impl UserSessionStore for SessionHandle {
    async fn load(&self) -> Result<UserSession, SessionError> {
        Ok(self
            .store
            .read(&self.id(), |record| record.user.clone())
            .unwrap_or_default())
    }

    async fn save(&self, session: &UserSession) -> Result<(), SessionError> {
        self.store
            .with_record(&self.id(), |record| record.user = session.clone());
        Ok(())
    }

    async fn regenerate(&self) -> Result<(), SessionError> {
        let old = self.id();
        let new = new_session_id();

        if let Some((_, record)) = self.store.sessions.remove(&old) {
            self.store.sessions.insert(new.clone(), record);
        }

        self.set_id(new)?;
        self.issued.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn new_session_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::relying_party::UserVerification;
    use crate::session::{AuthenticationLevel, CeremonyKind};

    fn store(clock: Arc<FixedClock>) -> Arc<MemorySessionStore> {
        Arc::new(MemorySessionStore::new(Duration::seconds(300), clock))
    }

    fn challenge(now: DateTime<Utc>) -> ChallengeSession {
        ChallengeSession {
            ceremony: CeremonyKind::Registration,
            rp_id: "login.example.com".to_string(),
            user_handle: None,
            description: Some("test".to_string()),
            user_verification: UserVerification::Preferred,
            state: serde_json::json!({"challenge": "abc"}),
            created_at: now,
            expires_at: now + Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_unknown_session_gets_fresh_id() {
        let clock = Arc::new(FixedClock::default());
        let store = store(clock);

        let handle = store.open(Some("does-not-exist"));
        assert_ne!(handle.id(), "does-not-exist");
        assert!(!handle.cookie_required(), "nothing stored yet");

        handle.save(&UserSession::default()).await.unwrap();
        assert!(handle.cookie_required());
    }

    #[tokio::test]
    async fn test_challenge_put_get_clear() {
        let clock = Arc::new(FixedClock::default());
        let store = store(clock.clone());
        let handle = store.open(None);

        assert!(handle.get().await.unwrap().is_none());
        handle.put(challenge(clock.now())).await.unwrap();
        assert!(handle.get().await.unwrap().is_some());

        handle.clear().await.unwrap();
        assert!(handle.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_regenerate_moves_session() {
        let clock = Arc::new(FixedClock::default());
        let store = store(clock.clone());
        let id = store.insert(UserSession::one_factor("john", clock.now()));

        let handle = store.open(Some(&id));
        assert!(!handle.cookie_required());

        handle.regenerate().await.unwrap();
        assert_ne!(handle.id(), id);
        assert!(handle.cookie_required());
        assert!(store.user(&id).is_none());

        let user = handle.load().await.unwrap();
        assert_eq!(user.level, AuthenticationLevel::OneFactor);
    }

    #[tokio::test]
    async fn test_inactive_sessions_expire() {
        let clock = Arc::new(FixedClock::default());
        let store = store(clock.clone());
        let id = store.insert(UserSession::one_factor("john", clock.now()));

        let mut remembered = UserSession::one_factor("jane", clock.now());
        remembered.remember_me_until = Some(clock.now() + Duration::days(30));
        let kept = store.insert(remembered);

        clock.advance(Duration::seconds(301));
        assert_eq!(store.purge_expired(), 1);
        assert!(store.user(&id).is_none());
        assert!(store.user(&kept).is_some());

        let handle = store.open(Some(&id));
        assert_ne!(handle.id(), id);
    }
}
