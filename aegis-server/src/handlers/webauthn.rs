//! Second factor WebAuthn endpoints
//!
//! Registration of security keys for the signed-in user and the classic
//! (non-discoverable) assertion that elevates a one factor session.

use aegis_core::{AssertionBegin, AssertionFinish};
use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use super::{ApiResponse, AppState, AssertionResponse, CredentialResponse};
use crate::error::{ApiError, Operation};
use crate::session::CeremonyRequest;

/// Optional body of a registration Begin
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RegisterBeginRequest {
    /// Credential description; the first free "Security Key N" when omitted
    #[schema(example = "YubiKey 5C")]
    pub description: Option<String>,
}

impl RegisterBeginRequest {
    /// An empty body asks for the default description.
    fn parse(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| ApiError::bad_request(format!("Invalid registration request: {}", e)))
    }
}

/// Client response bodies are handed to the orchestrator as-is; a body that
/// is not JSON still ends the ceremony (and its challenge) there.
pub(super) fn ceremony_payload(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

/// POST /api/secondfactor/webauthn/credential/register/begin
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/credential/register/begin",
    tag = "WebAuthn",
    request_body(content = RegisterBeginRequest, description = "Optional; an empty body requests the default description"),
    responses(
        (status = 200, description = "Credential creation options (PublicKeyCredentialCreationOptions)"),
        (status = 400, description = "Invalid description or origin", body = crate::error::ErrorBody),
        (status = 403, description = "Session is not signed in", body = crate::error::ErrorBody),
        (status = 409, description = "Description already in use", body = crate::error::ErrorBody)
    )
)]
pub async fn register_begin(
    State(state): State<AppState>,
    request: CeremonyRequest,
    body: Bytes,
) -> Response {
    let result = match RegisterBeginRequest::parse(&body) {
        Ok(req) => Operation::Registration
            .settle(
                state
                    .orchestrator
                    .begin_registration(&request.context(), req.description)
                    .await,
            )
            .map(ApiResponse::ok),
        Err(e) => Err(e),
    };

    request.respond(result).await
}

/// POST /api/secondfactor/webauthn/credential/register/finish
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/credential/register/finish",
    tag = "WebAuthn",
    request_body(content_type = "application/json", description = "PublicKeyCredential returned by navigator.credentials.create()"),
    responses(
        (status = 200, description = "Credential registered", body = CredentialResponse),
        (status = 400, description = "Malformed attestation", body = crate::error::ErrorBody),
        (status = 403, description = "Registration not initiated or verification failed", body = crate::error::ErrorBody),
        (status = 409, description = "Credential or description already registered", body = crate::error::ErrorBody)
    )
)]
pub async fn register_finish(
    State(state): State<AppState>,
    request: CeremonyRequest,
    body: Bytes,
) -> Response {
    let result = Operation::Registration
        .settle(
            state
                .orchestrator
                .finish_registration(&request.context(), ceremony_payload(&body))
                .await,
        )
        .map(|credential| ApiResponse::ok(CredentialResponse::from(credential)));

    request.respond(result).await
}

/// POST /api/secondfactor/webauthn/assertion/begin
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/assertion/begin",
    tag = "WebAuthn",
    responses(
        (status = 200, description = "Credential request options (PublicKeyCredentialRequestOptions)"),
        (status = 403, description = "No session, no credentials or rejected origin", body = crate::error::ErrorBody)
    )
)]
pub async fn assertion_begin(State(state): State<AppState>, request: CeremonyRequest) -> Response {
    let result = Operation::Authentication
        .settle(
            state
                .orchestrator
                .begin_assertion(&request.context(), AssertionBegin::Classic)
                .await,
        )
        .map(ApiResponse::ok);

    request.respond(result).await
}

/// POST /api/secondfactor/webauthn/assertion/finish
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/assertion/finish",
    tag = "WebAuthn",
    request_body(content_type = "application/json", description = "PublicKeyCredential returned by navigator.credentials.get()"),
    responses(
        (status = 200, description = "Session elevated to two factors", body = AssertionResponse),
        (status = 400, description = "Malformed assertion", body = crate::error::ErrorBody),
        (status = 403, description = "Authentication failed", body = crate::error::ErrorBody)
    )
)]
pub async fn assertion_finish(
    State(state): State<AppState>,
    request: CeremonyRequest,
    body: Bytes,
) -> Response {
    let result = Operation::Authentication
        .settle(
            state
                .orchestrator
                .finish_assertion(
                    &request.context(),
                    AssertionFinish::Classic,
                    ceremony_payload(&body),
                )
                .await,
        )
        .map(|session| ApiResponse::ok(AssertionResponse::from(session)));

    request.respond(result).await
}
