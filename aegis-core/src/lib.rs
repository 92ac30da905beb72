//! Aegis Core - WebAuthn and passkey ceremonies for the Aegis identity portal
//!
//! This crate drives the four WebAuthn ceremonies (registration begin/finish,
//! assertion begin/finish) for both second-factor security keys and
//! discoverable passkeys. It owns the challenge lifecycle, sign-count clone
//! detection, regulation checkpoints and the session markers written on
//! success. Everything else is reached through traits:
//!
//! - [`CredentialRepository`] - durable users and credentials
//! - [`ChallengeSessionStore`] / [`UserSessionStore`] - the browser session
//! - [`RegulationGate`] - ban checks and attempt recording
//! - [`CeremonyVerifier`] - the cryptographic WebAuthn library
//! - [`Notifier`] and [`Clock`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use aegis_core::{
//!     AssertionBegin, CeremonyContext, CeremonyServices, ForwardedOrigin, MemoryCredentialRepository,
//!     MemoryRegulator, MemorySessionStore, Orchestrator, RelyingPartyResolver, WebAuthnSettings,
//!     WebauthnRsVerifier,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = RelyingPartyResolver::new(WebAuthnSettings::default())?;
//! let orchestrator = Orchestrator::new(
//!     WebauthnRsVerifier::new(),
//!     resolver,
//!     CeremonyServices::new(
//!         Arc::new(MemoryCredentialRepository::new()),
//!         Arc::new(MemoryRegulator::disabled()),
//!     ),
//! );
//!
//! let sessions = Arc::new(MemorySessionStore::default());
//! let handle = sessions.open(None);
//! let ctx = CeremonyContext::new(
//!     ForwardedOrigin::new(Some("https"), Some("login.example.com")),
//!     "203.0.113.7".parse()?,
//!     &handle,
//!     &handle,
//! );
//! let options = orchestrator.begin_assertion(&ctx, AssertionBegin::Discoverable).await?;
//! # let _ = options;
//! # Ok(())
//! # }
//! ```

pub mod ceremony;
pub mod clock;
pub mod credential;
pub mod error;
pub mod notify;
pub mod regulation;
pub mod relying_party;
pub mod session;
pub mod storage;
pub mod verifier;

pub use ceremony::{
    AssertionBegin, AssertionFinish, CeremonyContext, CeremonyPolicy, CeremonyServices,
    Orchestrator,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use credential::{
    default_description, is_clone_signal, validate_description, Attachment, AuthenticatorFlags,
    DescriptionError, UserHandle, WebAuthnCredential, WebAuthnUser, FIDO_U2F_ATTESTATION,
    MAX_DESCRIPTION_LEN,
};
pub use error::{CeremonyError, FailureClass, Outcome};
pub use notify::{LoggingNotifier, NotifyError, Notifier};
pub use regulation::{
    AttemptMethod, AuthenticationAttempt, MemoryRegulator, RegulationConfig, RegulationError,
    RegulationGate,
};
pub use relying_party::{
    ConveyancePreference, ForwardedOrigin, RelyingPartyContext, RelyingPartyError,
    RelyingPartyResolver, UserVerification, WebAuthnSettings,
};
pub use session::{
    AuthenticationLevel, AuthenticatorMarkers, CeremonyKind, ChallengeSession,
    ChallengeSessionStore, MemorySessionStore, SessionError, SessionHandle, UserSession,
    UserSessionStore,
};
pub use storage::{CredentialRepository, MemoryCredentialRepository, StorageError};
pub use verifier::{
    AssertionIdentity, CeremonyVerifier, Challenge, LoginExtensions, RegisteredCredential,
    VerifiedAssertion, VerifyError,
};

#[cfg(feature = "webauthn-rs")]
pub use verifier::{WebauthnAssertion, WebauthnAttestation, WebauthnRsVerifier};
