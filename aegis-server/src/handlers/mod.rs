//! HTTP request handlers
//!
//! This module contains all the request handlers for the API endpoints.

pub mod credentials;
pub mod health;
pub mod passkey;
pub mod webauthn;

use aegis_core::WebAuthnCredential;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

pub use crate::state::AppState;
pub use credentials::{
    delete_credential, list_credentials, rename_credential, RenameCredentialRequest,
};
pub use health::{health, ready, HealthResponse, ReadyResponse};
pub use passkey::{passkey_begin, passkey_finish, PasskeyFinishRequest};
pub use webauthn::{
    assertion_begin, assertion_finish, register_begin, register_finish, RegisterBeginRequest,
};

/// Success envelope: `{"status":"OK","data":...}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: "OK",
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    /// Success without payload
    pub fn empty() -> Self {
        Self {
            status: "OK",
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

/// A registered credential as shown to its owner
#[derive(Debug, Serialize, ToSchema)]
pub struct CredentialResponse {
    #[schema(example = 12)]
    pub id: i64,
    #[schema(example = "Security Key 1")]
    pub description: String,
    /// Base64url credential ID
    #[schema(example = "q83vEjRWeJA")]
    pub kid: String,
    #[schema(example = "packed")]
    pub attestation_type: String,
    /// `platform`, `cross-platform` or empty
    #[schema(example = "cross-platform")]
    pub attachment: String,
    pub transports: Vec<String>,
    #[schema(example = "00000000-0000-0000-0000-000000000000")]
    pub aaguid: Option<String>,
    pub discoverable: bool,
    pub user_verified: bool,
    pub backup_eligible: bool,
    pub backup_state: bool,
    /// Set when a sign count regression was observed
    pub clone_warning: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<WebAuthnCredential> for CredentialResponse {
    fn from(credential: WebAuthnCredential) -> Self {
        Self {
            id: credential.id,
            kid: credential.encoded_id(),
            description: credential.description,
            attestation_type: credential.attestation_type,
            attachment: credential.attachment.as_str().to_string(),
            transports: credential.transports,
            aaguid: credential.aaguid.map(|aaguid| aaguid.to_string()),
            discoverable: credential.discoverable,
            user_verified: credential.flags.user_verified,
            backup_eligible: credential.flags.backup_eligible,
            backup_state: credential.flags.backup_state,
            clone_warning: credential.clone_warning,
            created_at: credential.created_at,
            last_used_at: credential.last_used_at,
        }
    }
}

/// Signed-in session state after a successful assertion
#[derive(Debug, Serialize, ToSchema)]
pub struct AssertionResponse {
    #[schema(example = "john")]
    pub username: Option<String>,
    /// `one_factor` or `two_factor`
    #[schema(example = "two_factor")]
    pub level: String,
}

impl From<aegis_core::UserSession> for AssertionResponse {
    fn from(session: aegis_core::UserSession) -> Self {
        let level = match session.level {
            aegis_core::AuthenticationLevel::Anonymous => "anonymous",
            aegis_core::AuthenticationLevel::OneFactor => "one_factor",
            aegis_core::AuthenticationLevel::TwoFactor => "two_factor",
        };
        Self {
            username: session.username,
            level: level.to_string(),
        }
    }
}
