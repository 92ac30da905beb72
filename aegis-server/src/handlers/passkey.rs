//! Passkey (usernameless) first factor endpoints

use aegis_core::{AssertionBegin, AssertionFinish};
use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use super::{ApiResponse, AppState, AssertionResponse};
use crate::error::Operation;
use crate::session::CeremonyRequest;

/// Body of a passkey login Finish
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PasskeyFinishRequest {
    /// PublicKeyCredential returned by navigator.credentials.get()
    #[serde(default)]
    #[schema(value_type = Object)]
    pub response: Value,
    /// Extend the session with "remember me"
    #[serde(default)]
    pub keep_me_logged_in: bool,
}

impl PasskeyFinishRequest {
    /// Unreadable bodies carry no response; the orchestrator rejects them.
    fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }
}

/// POST /api/firstfactor/passkey/begin
#[utoipa::path(
    post,
    path = "/api/firstfactor/passkey/begin",
    tag = "Passkey",
    responses(
        (status = 200, description = "Credential request options for a discoverable credential"),
        (status = 403, description = "Passkey login disabled or session already signed in", body = crate::error::ErrorBody)
    )
)]
pub async fn passkey_begin(State(state): State<AppState>, request: CeremonyRequest) -> Response {
    let result = Operation::Authentication
        .settle(
            state
                .orchestrator
                .begin_assertion(&request.context(), AssertionBegin::Discoverable)
                .await,
        )
        .map(ApiResponse::ok);

    request.respond(result).await
}

/// POST /api/firstfactor/passkey/finish
#[utoipa::path(
    post,
    path = "/api/firstfactor/passkey/finish",
    tag = "Passkey",
    request_body = PasskeyFinishRequest,
    responses(
        (status = 200, description = "Signed in", body = AssertionResponse),
        (status = 400, description = "Malformed assertion", body = crate::error::ErrorBody),
        (status = 403, description = "Authentication failed", body = crate::error::ErrorBody)
    )
)]
pub async fn passkey_finish(
    State(state): State<AppState>,
    request: CeremonyRequest,
    body: Bytes,
) -> Response {
    let req = PasskeyFinishRequest::parse(&body);

    let result = Operation::Authentication
        .settle(
            state
                .orchestrator
                .finish_assertion(
                    &request.context(),
                    AssertionFinish::Discoverable {
                        keep_me_logged_in: req.keep_me_logged_in,
                    },
                    req.response,
                )
                .await,
        )
        .map(|session| ApiResponse::ok(AssertionResponse::from(session)));

    request.respond(result).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passkey_finish_request_parsing() {
        let req = PasskeyFinishRequest::parse(br#"{"response":{"id":"abc"},"keepMeLoggedIn":true}"#);
        assert!(req.keep_me_logged_in);
        assert_eq!(req.response["id"], "abc");

        let req = PasskeyFinishRequest::parse(b"{broken");
        assert!(!req.keep_me_logged_in);
        assert!(req.response.is_null());
    }
}
