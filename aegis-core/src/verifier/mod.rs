//! Cryptographic ceremony verification
//!
//! The orchestrator never parses attestation objects or checks signatures
//! itself. A [`CeremonyVerifier`] produces the public challenge payloads,
//! keeps whatever state it needs in an opaque JSON value stored with the
//! challenge, and validates the client responses against it.

#[cfg(feature = "webauthn-rs")]
mod webauthn;

#[cfg(feature = "webauthn-rs")]
pub use webauthn::{WebauthnAssertion, WebauthnAttestation, WebauthnRsVerifier};

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::credential::{Attachment, AuthenticatorFlags, WebAuthnCredential, WebAuthnUser};
use crate::relying_party::RelyingPartyContext;

/// Verification failures
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// The Relying Party context is unusable for the verifier
    #[error("Relying Party configuration rejected: {0}")]
    RelyingParty(String),

    /// Stored ceremony state could not be decoded
    #[error("Ceremony state is invalid: {0}")]
    State(String),

    /// Stored key material could not be decoded
    #[error("Stored key material is invalid: {0}")]
    KeyMaterial(String),

    /// The authenticator counter did not advance
    #[error("Signature counter did not advance, authenticator may be cloned")]
    PossibleClone,

    /// The client response failed verification
    #[error("Verification failed: {0}")]
    Rejected(String),
}

/// A challenge issued at Begin.
#[derive(Debug, Clone)]
pub struct Challenge<O> {
    /// Public options returned to the browser
    pub options: O,
    /// Private verifier state kept in the challenge session
    pub state: serde_json::Value,
}

/// Extensions requested for a classic login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginExtensions {
    /// FIDO AppID for credentials registered through the legacy U2F API
    pub app_id: Option<String>,
}

/// Result of a verified attestation.
#[derive(Debug, Clone)]
pub struct RegisteredCredential {
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub attestation_type: String,
    pub attachment: Attachment,
    pub transports: Vec<String>,
    pub aaguid: Option<Uuid>,
    pub sign_count: u32,
    pub discoverable: bool,
    pub flags: AuthenticatorFlags,
}

/// Result of a verified assertion.
#[derive(Debug, Clone)]
pub struct VerifiedAssertion {
    pub credential_id: Vec<u8>,
    pub sign_count: u32,
    pub flags: AuthenticatorFlags,
    /// Updated key material, when the verifier keeps state inside it
    pub public_key: Option<Vec<u8>>,
}

/// Identity claims carried by an assertion response, readable before
/// verification.
pub trait AssertionIdentity {
    fn credential_id(&self) -> &[u8];
    fn user_handle(&self) -> Option<&[u8]>;
}

/// Verification backend.
pub trait CeremonyVerifier: Send + Sync {
    type CreationOptions: Serialize + Send + Sync;
    type RequestOptions: Serialize + Send + Sync;
    type Attestation: DeserializeOwned + Send + Sync;
    type Assertion: DeserializeOwned + AssertionIdentity + Send + Sync;

    fn begin_registration(
        &self,
        rp: &RelyingPartyContext,
        user: &WebAuthnUser,
        exclude: &[WebAuthnCredential],
    ) -> Result<Challenge<Self::CreationOptions>, VerifyError>;

    fn finish_registration(
        &self,
        rp: &RelyingPartyContext,
        user: &WebAuthnUser,
        state: &serde_json::Value,
        response: &Self::Attestation,
    ) -> Result<RegisteredCredential, VerifyError>;

    fn begin_login(
        &self,
        rp: &RelyingPartyContext,
        user: &WebAuthnUser,
        allowed: &[WebAuthnCredential],
        extensions: &LoginExtensions,
    ) -> Result<Challenge<Self::RequestOptions>, VerifyError>;

    fn finish_login(
        &self,
        rp: &RelyingPartyContext,
        user: &WebAuthnUser,
        credentials: &[WebAuthnCredential],
        state: &serde_json::Value,
        response: &Self::Assertion,
    ) -> Result<VerifiedAssertion, VerifyError>;

    fn begin_discoverable_login(
        &self,
        rp: &RelyingPartyContext,
    ) -> Result<Challenge<Self::RequestOptions>, VerifyError>;

    fn finish_discoverable_login(
        &self,
        rp: &RelyingPartyContext,
        user: &WebAuthnUser,
        candidates: &[WebAuthnCredential],
        state: &serde_json::Value,
        response: &Self::Assertion,
    ) -> Result<VerifiedAssertion, VerifyError>;
}
