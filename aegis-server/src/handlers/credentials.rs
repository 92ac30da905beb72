//! Credential management for the signed-in user

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::Response;
use serde::Deserialize;
use utoipa::ToSchema;

use super::{ApiResponse, AppState, CredentialResponse};
use crate::error::{ApiError, Operation};
use crate::session::CeremonyRequest;

/// Body of a credential rename
#[derive(Debug, Deserialize, ToSchema)]
pub struct RenameCredentialRequest {
    #[schema(example = "Backup key")]
    pub description: String,
}

/// GET /api/secondfactor/webauthn/credentials
#[utoipa::path(
    get,
    path = "/api/secondfactor/webauthn/credentials",
    tag = "Credentials",
    responses(
        (status = 200, description = "Credentials of the signed-in user", body = [CredentialResponse]),
        (status = 403, description = "Session is not signed in", body = crate::error::ErrorBody)
    )
)]
pub async fn list_credentials(State(state): State<AppState>, request: CeremonyRequest) -> Response {
    let result = Operation::Management
        .settle(
            state
                .orchestrator
                .list_credentials(&request.context())
                .await,
        )
        .map(|credentials| {
            ApiResponse::ok(
                credentials
                    .into_iter()
                    .map(CredentialResponse::from)
                    .collect::<Vec<_>>(),
            )
        });

    request.respond(result).await
}

/// PUT /api/secondfactor/webauthn/credential/{id}
#[utoipa::path(
    put,
    path = "/api/secondfactor/webauthn/credential/{id}",
    tag = "Credentials",
    params(("id" = i64, Path, description = "Credential identifier")),
    request_body = RenameCredentialRequest,
    responses(
        (status = 200, description = "Credential renamed", body = CredentialResponse),
        (status = 400, description = "Invalid description", body = crate::error::ErrorBody),
        (status = 403, description = "Unknown credential or session not signed in", body = crate::error::ErrorBody),
        (status = 409, description = "Description already in use", body = crate::error::ErrorBody)
    )
)]
pub async fn rename_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    request: CeremonyRequest,
    body: Bytes,
) -> Response {
    let result = match serde_json::from_slice::<RenameCredentialRequest>(&body) {
        Ok(req) => Operation::Management
            .settle(
                state
                    .orchestrator
                    .rename_credential(&request.context(), id, &req.description)
                    .await,
            )
            .map(|credential| ApiResponse::ok(CredentialResponse::from(credential))),
        Err(e) => Err(ApiError::bad_request(format!(
            "Invalid rename request: {}",
            e
        ))),
    };

    request.respond(result).await
}

/// DELETE /api/secondfactor/webauthn/credential/{id}
#[utoipa::path(
    delete,
    path = "/api/secondfactor/webauthn/credential/{id}",
    tag = "Credentials",
    params(("id" = i64, Path, description = "Credential identifier")),
    responses(
        (status = 200, description = "Credential deleted"),
        (status = 403, description = "Unknown credential or session not signed in", body = crate::error::ErrorBody)
    )
)]
pub async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    request: CeremonyRequest,
) -> Response {
    let result = Operation::Management
        .settle(
            state
                .orchestrator
                .delete_credential(&request.context(), id)
                .await,
        )
        .map(|()| ApiResponse::empty());

    request.respond(result).await
}
