//! WebAuthn users and credentials
//!
//! The entities a ceremony reads and writes, plus the two rules that apply to
//! them regardless of storage backend: credential description validation and
//! sign-count clone detection.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a credential description, in characters.
pub const MAX_DESCRIPTION_LEN: usize = 64;

/// Attestation type recorded for credentials migrated from the legacy U2F flow.
pub const FIDO_U2F_ATTESTATION: &str = "fido-u2f";

/// Opaque, immutable WebAuthn user handle.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserHandle(Vec<u8>);

impl UserHandle {
    /// Generate a fresh random handle (16 bytes).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }

    /// The handle as a UUID, when it is exactly 16 bytes long.
    pub fn as_uuid(&self) -> Option<Uuid> {
        Uuid::from_slice(&self.0).ok()
    }

    /// Base64url (unpadded) encoding, used in logs and storage keys.
    pub fn encoded(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.0)
    }
}

impl fmt::Debug for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserHandle({})", self.encoded())
    }
}

impl fmt::Display for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded())
    }
}

/// A principal as seen by WebAuthn ceremonies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAuthnUser {
    /// Storage identifier, `None` until saved
    pub id: Option<i64>,
    pub rp_id: String,
    pub username: String,
    pub display_name: String,
    pub user_handle: UserHandle,
}

impl WebAuthnUser {
    /// Create a new user with a freshly generated handle.
    pub fn new(rp_id: &str, username: &str, display_name: &str) -> Self {
        Self {
            id: None,
            rp_id: rp_id.to_string(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            user_handle: UserHandle::generate(),
        }
    }
}

/// Authenticator attachment class reported at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Attachment {
    /// Built into the client device (Touch ID, Windows Hello)
    Platform,
    /// Roaming authenticator (security key, phone)
    CrossPlatform,
    #[default]
    Unknown,
}

impl Attachment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::CrossPlatform => "cross-platform",
            Self::Unknown => "",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "platform" => Self::Platform,
            "cross-platform" => Self::CrossPlatform,
            _ => Self::Unknown,
        }
    }
}

/// Authenticator data flags observed during a ceremony.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatorFlags {
    pub user_present: bool,
    pub user_verified: bool,
    pub backup_eligible: bool,
    pub backup_state: bool,
}

/// One registered authenticator binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAuthnCredential {
    /// Storage identifier, `0` until saved
    pub id: i64,
    pub rp_id: String,
    pub username: String,
    pub description: String,
    /// Credential ID (key handle) chosen by the authenticator
    pub credential_id: Vec<u8>,
    /// Key material as produced by the verifier
    pub public_key: Vec<u8>,
    pub attestation_type: String,
    pub attachment: Attachment,
    pub transports: Vec<String>,
    pub aaguid: Option<Uuid>,
    pub sign_count: u32,
    pub discoverable: bool,
    pub flags: AuthenticatorFlags,
    pub clone_warning: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl WebAuthnCredential {
    /// Whether this credential was registered through the legacy U2F API and
    /// needs the AppID extension to be asserted.
    pub fn is_legacy_u2f(&self) -> bool {
        self.attestation_type.eq_ignore_ascii_case(FIDO_U2F_ATTESTATION)
    }

    /// Base64url encoded credential ID.
    pub fn encoded_id(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.credential_id)
    }

    /// Apply a verified assertion's counter.
    ///
    /// Returns `true` when the counter failed to advance. In that case the
    /// stored counter is left untouched and `clone_warning` is raised.
    pub fn apply_sign_count(&mut self, received: u32) -> bool {
        if is_clone_signal(self.sign_count, received) {
            self.clone_warning = true;
            return true;
        }
        self.sign_count = received;
        false
    }
}

/// Sign-count clone rule.
///
/// A counter that does not strictly increase signals a cloned authenticator,
/// except when both sides are zero (authenticators that never count).
pub fn is_clone_signal(stored: u32, received: u32) -> bool {
    received <= stored && (received != 0 || stored != 0)
}

/// Description validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptionError {
    #[error("description must not be empty")]
    Empty,
    #[error("description must not exceed {MAX_DESCRIPTION_LEN} characters")]
    TooLong,
    #[error("description '{0}' is already in use")]
    Duplicate(String),
}

/// Validate a description against the user's existing credentials.
///
/// Returns the trimmed description. `ignore_id` excludes one credential from
/// the uniqueness check (used when renaming).
pub fn validate_description(
    description: &str,
    existing: &[WebAuthnCredential],
    ignore_id: Option<i64>,
) -> Result<String, DescriptionError> {
    let description = description.trim();

    if description.is_empty() {
        return Err(DescriptionError::Empty);
    }

    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(DescriptionError::TooLong);
    }

    let taken = existing
        .iter()
        .filter(|c| Some(c.id) != ignore_id)
        .any(|c| c.description == description);

    if taken {
        return Err(DescriptionError::Duplicate(description.to_string()));
    }

    Ok(description.to_string())
}

/// First free `Security Key N` description.
pub fn default_description(existing: &[WebAuthnCredential]) -> String {
    (1..)
        .map(|n| format!("Security Key {}", n))
        .find(|candidate| existing.iter().all(|c| &c.description != candidate))
        .unwrap_or_else(|| "Security Key".to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn credential(id: i64, description: &str, sign_count: u32) -> WebAuthnCredential {
        WebAuthnCredential {
            id,
            rp_id: "login.example.com".to_string(),
            username: "john".to_string(),
            description: description.to_string(),
            credential_id: vec![id as u8; 16],
            public_key: vec![0xA5; 8],
            attestation_type: "packed".to_string(),
            attachment: Attachment::CrossPlatform,
            transports: vec!["usb".to_string()],
            aaguid: None,
            sign_count,
            discoverable: false,
            flags: AuthenticatorFlags::default(),
            clone_warning: false,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    #[test]
    fn test_clone_signal_rules() {
        assert!(!is_clone_signal(0, 0), "zero baseline is accepted");
        assert!(!is_clone_signal(0, 1));
        assert!(!is_clone_signal(10, 11));
        assert!(is_clone_signal(10000, 10000));
        assert!(is_clone_signal(10, 9));
        assert!(is_clone_signal(5, 0), "a counter dropping back to zero is a clone signal");
    }

    #[test]
    fn test_apply_sign_count_keeps_stored_value_on_clone() {
        let mut cred = credential(1, "test", 10000);
        assert!(cred.apply_sign_count(10000));
        assert!(cred.clone_warning);
        assert_eq!(cred.sign_count, 10000);

        let mut cred = credential(2, "test", 10);
        assert!(!cred.apply_sign_count(11));
        assert!(!cred.clone_warning);
        assert_eq!(cred.sign_count, 11);
    }

    #[test]
    fn test_validate_description() {
        let existing = vec![credential(1, "test", 0)];

        assert_eq!(
            validate_description("  yubikey  ", &existing, None),
            Ok("yubikey".to_string())
        );
        assert_eq!(
            validate_description("   ", &existing, None),
            Err(DescriptionError::Empty)
        );
        assert_eq!(
            validate_description(&"x".repeat(65), &existing, None),
            Err(DescriptionError::TooLong)
        );
        assert!(validate_description(&"é".repeat(64), &existing, None).is_ok());
        assert_eq!(
            validate_description("test", &existing, None),
            Err(DescriptionError::Duplicate("test".to_string()))
        );
        assert!(validate_description("test", &existing, Some(1)).is_ok());
    }

    #[test]
    fn test_default_description_skips_taken_names() {
        let existing = vec![credential(1, "Security Key 1", 0), credential(2, "other", 0)];
        assert_eq!(default_description(&existing), "Security Key 2");
        assert_eq!(default_description(&[]), "Security Key 1");
    }

    #[test]
    fn test_user_handle_encoding() {
        let handle = UserHandle::generate();
        assert_eq!(handle.as_bytes().len(), 16);
        assert!(handle.as_uuid().is_some());
        assert!(!handle.is_blank());
        assert!(UserHandle::from_bytes(Vec::new()).is_blank());
        assert_eq!(UserHandle::from_bytes(vec![0xFF, 0xEE]).encoded(), "_-4");
    }

    #[test]
    fn test_legacy_u2f_detection() {
        let mut cred = credential(1, "old key", 0);
        assert!(!cred.is_legacy_u2f());
        cred.attestation_type = "FIDO-U2F".to_string();
        assert!(cred.is_legacy_u2f());
    }
}
