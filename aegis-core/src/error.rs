//! Ceremony errors and outcome classes
//!
//! Every ceremony failure maps onto one of three client-visible classes.
//! The detailed variant is for logs; callers only learn the class.

use crate::credential::DescriptionError;
use crate::regulation::RegulationError;
use crate::relying_party::RelyingPartyError;
use crate::session::SessionError;
use crate::storage::StorageError;
use crate::verifier::VerifyError;

/// Client-visible failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Malformed input or unusable request origin (400)
    BadRequest,
    /// Precondition, verification, storage or ban failure (403)
    Forbidden,
    /// Uniqueness violation (409)
    Conflict,
}

/// Ceremony errors
#[derive(Debug, thiserror::Error)]
pub enum CeremonyError {
    // Preconditions
    #[error("Session is not authenticated")]
    AnonymousSession,

    #[error("Session is already authenticated")]
    AlreadyAuthenticated,

    #[error("Passkey login is disabled")]
    PasskeyLoginDisabled,

    #[error("{0}")]
    ChallengeMissing(&'static str),

    #[error("User has no registered credentials")]
    NoCredentials,

    // Input
    #[error("Relying Party could not be resolved: {0}")]
    Origin(RelyingPartyError),

    #[error("Relying Party rejected for assertion: {0}")]
    OriginRejected(RelyingPartyError),

    #[error("Malformed ceremony response: {0}")]
    Parse(String),

    #[error("Invalid description: {0}")]
    Description(#[from] DescriptionError),

    // Verification
    #[error("Relying Party changed during the ceremony: {0}")]
    RelyingPartyChanged(String),

    #[error("Ceremony verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("User verification was required but not performed")]
    UserVerificationRequired,

    #[error("Blank user handle is not acceptable")]
    BlankUserHandle,

    #[error("Credential lookup failed")]
    UserLookup,

    #[error("Credential was not found")]
    CredentialNotFound,

    #[error("Credential sign count did not advance, possible cloned authenticator")]
    CloneDetected,

    #[error("User handle does not match the challenge")]
    UserMismatch,

    // Regulation
    #[error("Authentication refused: {0} is banned")]
    Banned(&'static str),

    #[error("Regulation check failed: {0}")]
    Regulation(#[from] RegulationError),

    // Collaborators
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl CeremonyError {
    /// Client-visible class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Origin(_) | Self::Parse(_) => FailureClass::BadRequest,
            Self::Description(DescriptionError::Duplicate(_)) => FailureClass::Conflict,
            Self::Description(_) => FailureClass::BadRequest,
            Self::Storage(StorageError::Duplicate(_)) => FailureClass::Conflict,
            _ => FailureClass::Forbidden,
        }
    }

    /// Whether this failure is a verification failure, which is counted
    /// against the user by the regulator.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::RelyingPartyChanged(_)
                | Self::Verification(_)
                | Self::UserVerificationRequired
                | Self::CredentialNotFound
                | Self::CloneDetected
                | Self::UserMismatch
        )
    }
}

/// Outcome of a ceremony step, as handed to the transport layer.
///
/// Failures keep their cause for logging; only the class reaches the client.
#[derive(Debug)]
pub enum Outcome<T> {
    Success(T),
    BadRequest(CeremonyError),
    Forbidden(CeremonyError),
    Conflict(CeremonyError),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl<T> From<Result<T, CeremonyError>> for Outcome<T> {
    fn from(result: Result<T, CeremonyError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) => match e.class() {
                FailureClass::BadRequest => Self::BadRequest(e),
                FailureClass::Forbidden => Self::Forbidden(e),
                FailureClass::Conflict => Self::Conflict(e),
            },
        }
    }
}
