//! API integration tests for aegis-server.
//!
//! These tests drive the router with real HTTP requests, using in-memory
//! credentials and sessions and the webauthn-rs verifier.

use aegis_core::{
    Attachment, AuthenticatorFlags, CredentialRepository, UserSession, WebAuthnCredential,
    WebAuthnUser,
};
use aegis_server::error::{AUTHENTICATION_FAILED, MANAGEMENT_FAILED, REGISTRATION_FAILED};
use aegis_server::{create_router, create_router_with_state, AppState, Config, SESSION_COOKIE_NAME};
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;

const HOST: &str = "example.com";

/// Router plus the state behind it, so tests can seed sessions and credentials
struct TestApp {
    app: Router,
    state: AppState,
}

impl TestApp {
    fn new() -> Self {
        let config = Config::default();
        let state = AppState::in_memory(&config).unwrap();
        Self {
            app: create_router_with_state(state.clone(), &config),
            state,
        }
    }

    /// Session cookie of a user who passed the first factor
    fn sign_in(&self, username: &str) -> String {
        let id = self
            .state
            .sessions
            .insert(UserSession::one_factor(username, Utc::now()));
        format!("{}={}", SESSION_COOKIE_NAME, id)
    }

    async fn seed_credential(&self, username: &str, description: &str) -> WebAuthnCredential {
        let repo = self.state.orchestrator.services().credentials();
        let user = match repo.load_user(HOST, username).await.unwrap() {
            Some(user) => user,
            None => repo
                .save_user(WebAuthnUser::new(HOST, username, username))
                .await
                .unwrap(),
        };

        repo.save_credential(WebAuthnCredential {
            id: 0,
            rp_id: HOST.to_string(),
            username: user.username,
            description: description.to_string(),
            credential_id: description.as_bytes().to_vec(),
            public_key: vec![0xA5; 32],
            attestation_type: "packed".to_string(),
            attachment: Attachment::CrossPlatform,
            transports: vec!["usb".to_string()],
            aaguid: None,
            sign_count: 5,
            discoverable: false,
            flags: AuthenticatorFlags {
                user_present: true,
                ..AuthenticatorFlags::default()
            },
            clone_warning: false,
            created_at: Utc::now(),
            last_used_at: None,
        })
        .await
        .unwrap()
    }

    async fn send(
        &self,
        method: &str,
        uri: &str,
        cookie: Option<&str>,
        body: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, HOST)
            .header("x-forwarded-proto", "https");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let body = match body {
            Some(body) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };

        self.app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }
}

async fn json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Session identifier from a `Set-Cookie` header, as a `Cookie` value
fn issued_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(str::to_string)
}

async fn assert_failure(response: Response, status: StatusCode, code: &str, message: &str) {
    assert_eq!(response.status(), status);
    let json = json_body(response).await;
    assert_eq!(json["status"], "KO");
    assert_eq!(json["code"], code);
    assert_eq!(json["message"], message);
}

// ============================================================================
// Health & Documentation Tests
// ============================================================================

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    let app = create_router().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["storage"], "memory");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint_returns_ok() {
    let app = create_router().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["ready"], true);
}

#[tokio::test]
async fn test_openapi_document_lists_ceremonies() {
    let app = create_router().unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    let paths = json["paths"].as_object().unwrap();
    assert!(paths.contains_key("/api/firstfactor/passkey/begin"));
    assert!(paths.contains_key("/api/secondfactor/webauthn/credential/register/finish"));
    assert!(paths.contains_key("/api/secondfactor/webauthn/credential/{id}"));
}

// ============================================================================
// Registration Tests
// ============================================================================

#[tokio::test]
async fn test_register_begin_returns_creation_options() {
    let test = TestApp::new();
    let cookie = test.sign_in("john");

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/credential/register/begin",
            Some(&cookie),
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(issued_cookie(&response).is_none());

    let json = json_body(response).await;
    assert_eq!(json["status"], "OK");
    assert!(json["data"]["publicKey"]["challenge"].is_string());
    assert_eq!(json["data"]["publicKey"]["rp"]["id"], HOST);
    assert_eq!(json["data"]["publicKey"]["attestation"], "indirect");
    assert_eq!(
        json["data"]["publicKey"]["authenticatorSelection"]["userVerification"],
        "preferred"
    );

    let session_id = cookie.split_once('=').unwrap().1;
    let challenge = test.state.sessions.challenge(session_id).unwrap();
    assert_eq!(challenge.description.as_deref(), Some("Security Key 1"));
}

#[tokio::test]
async fn test_register_begin_requires_signed_in_session() {
    let test = TestApp::new();

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/credential/register/begin",
            None,
            None,
        )
        .await;

    assert_failure(response, StatusCode::FORBIDDEN, "FORBIDDEN", REGISTRATION_FAILED).await;
}

#[tokio::test]
async fn test_register_begin_rejects_invalid_description() {
    let test = TestApp::new();
    let cookie = test.sign_in("john");
    let body = format!(r#"{{"description":"{}"}}"#, "k".repeat(65));

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/credential/register/begin",
            Some(&cookie),
            Some(&body),
        )
        .await;

    assert_failure(response, StatusCode::BAD_REQUEST, "INVALID_INPUT", REGISTRATION_FAILED).await;
}

#[tokio::test]
async fn test_register_begin_rejects_malformed_body() {
    let test = TestApp::new();
    let cookie = test.sign_in("john");

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/credential/register/begin",
            Some(&cookie),
            Some("{description"),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_register_begin_duplicate_description_conflicts() {
    let test = TestApp::new();
    test.seed_credential("john", "Work key").await;
    let cookie = test.sign_in("john");

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/credential/register/begin",
            Some(&cookie),
            Some(r#"{"description":"Work key"}"#),
        )
        .await;

    assert_failure(response, StatusCode::CONFLICT, "CONFLICT", REGISTRATION_FAILED).await;
}

#[tokio::test]
async fn test_register_begin_rejects_unsupported_scheme() {
    let test = TestApp::new();
    let cookie = test.sign_in("john");

    let request = Request::builder()
        .method("POST")
        .uri("/api/secondfactor/webauthn/credential/register/begin")
        .header(header::HOST, HOST)
        .header("x-forwarded-proto", "ftp")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .unwrap();
    let response = test.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_register_finish_without_begin_is_forbidden() {
    let test = TestApp::new();
    let cookie = test.sign_in("john");

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/credential/register/finish",
            Some(&cookie),
            Some(r#"{"id":"AAAA","rawId":"AAAA","type":"public-key","response":{}}"#),
        )
        .await;

    assert_failure(response, StatusCode::FORBIDDEN, "FORBIDDEN", REGISTRATION_FAILED).await;
}

// ============================================================================
// Passkey Tests
// ============================================================================

#[tokio::test]
async fn test_passkey_ceremony_consumes_challenge() {
    let test = TestApp::new();

    let begin = test
        .send("POST", "/api/firstfactor/passkey/begin", None, None)
        .await;
    assert_eq!(begin.status(), StatusCode::OK);
    let cookie = issued_cookie(&begin).expect("passkey begin issues a session cookie");
    assert!(cookie.starts_with(SESSION_COOKIE_NAME));

    let json = json_body(begin).await;
    assert!(json["data"]["publicKey"]["challenge"].is_string());

    // Unreadable response: rejected as bad input, challenge consumed
    let finish = test
        .send(
            "POST",
            "/api/firstfactor/passkey/finish",
            Some(&cookie),
            Some("{not json"),
        )
        .await;
    assert_failure(finish, StatusCode::BAD_REQUEST, "INVALID_INPUT", AUTHENTICATION_FAILED).await;

    let session_id = cookie.split_once('=').unwrap().1;
    assert!(test.state.sessions.challenge(session_id).is_none());

    let replay = test
        .send(
            "POST",
            "/api/firstfactor/passkey/finish",
            Some(&cookie),
            Some(r#"{"response":{},"keepMeLoggedIn":true}"#),
        )
        .await;
    assert_failure(replay, StatusCode::FORBIDDEN, "FORBIDDEN", AUTHENTICATION_FAILED).await;
}

#[tokio::test]
async fn test_passkey_begin_refuses_signed_in_session() {
    let test = TestApp::new();
    let cookie = test.sign_in("john");

    let response = test
        .send("POST", "/api/firstfactor/passkey/begin", Some(&cookie), None)
        .await;

    assert_failure(response, StatusCode::FORBIDDEN, "FORBIDDEN", AUTHENTICATION_FAILED).await;
}

// ============================================================================
// Second Factor Assertion Tests
// ============================================================================

#[tokio::test]
async fn test_assertion_begin_without_credentials_is_forbidden() {
    let test = TestApp::new();
    let cookie = test.sign_in("john");

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/assertion/begin",
            Some(&cookie),
            None,
        )
        .await;

    assert_failure(response, StatusCode::FORBIDDEN, "FORBIDDEN", AUTHENTICATION_FAILED).await;
}

#[tokio::test]
async fn test_assertion_finish_without_begin_is_forbidden() {
    let test = TestApp::new();
    test.seed_credential("john", "Work key").await;
    let cookie = test.sign_in("john");

    let response = test
        .send(
            "POST",
            "/api/secondfactor/webauthn/assertion/finish",
            Some(&cookie),
            Some("{}"),
        )
        .await;

    assert_failure(response, StatusCode::FORBIDDEN, "FORBIDDEN", AUTHENTICATION_FAILED).await;
}

// ============================================================================
// Credential Management Tests
// ============================================================================

#[tokio::test]
async fn test_credential_management_lifecycle() {
    let test = TestApp::new();
    let credential = test.seed_credential("john", "Work key").await;
    test.seed_credential("mary", "Mary's key").await;
    let cookie = test.sign_in("john");

    let list = test
        .send(
            "GET",
            "/api/secondfactor/webauthn/credentials",
            Some(&cookie),
            None,
        )
        .await;
    assert_eq!(list.status(), StatusCode::OK);
    let json = json_body(list).await;
    let items = json["data"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["description"], "Work key");
    assert_eq!(items[0]["attachment"], "cross-platform");

    let uri = format!("/api/secondfactor/webauthn/credential/{}", credential.id);

    let rename = test
        .send("PUT", &uri, Some(&cookie), Some(r#"{"description":"Backup"}"#))
        .await;
    assert_eq!(rename.status(), StatusCode::OK);
    assert_eq!(json_body(rename).await["data"]["description"], "Backup");

    let malformed = test
        .send("PUT", &uri, Some(&cookie), Some(r#"{"name":"Backup"}"#))
        .await;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    let delete = test.send("DELETE", &uri, Some(&cookie), None).await;
    assert_eq!(delete.status(), StatusCode::OK);
    let json = json_body(delete).await;
    assert_eq!(json["status"], "OK");
    assert!(json.get("data").is_none());

    let again = test.send("DELETE", &uri, Some(&cookie), None).await;
    assert_failure(again, StatusCode::FORBIDDEN, "FORBIDDEN", MANAGEMENT_FAILED).await;

    assert_eq!(
        test.state
            .orchestrator
            .services()
            .credentials()
            .load_credentials_by_username(HOST, "mary")
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_credential_management_is_scoped_to_owner() {
    let test = TestApp::new();
    let marys = test.seed_credential("mary", "Mary's key").await;
    let cookie = test.sign_in("john");

    let uri = format!("/api/secondfactor/webauthn/credential/{}", marys.id);
    let rename = test
        .send("PUT", &uri, Some(&cookie), Some(r#"{"description":"Mine now"}"#))
        .await;
    assert_eq!(rename.status(), StatusCode::FORBIDDEN);

    let delete = test.send("DELETE", &uri, Some(&cookie), None).await;
    assert_eq!(delete.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_credential_list_requires_signed_in_session() {
    let test = TestApp::new();

    let response = test
        .send("GET", "/api/secondfactor/webauthn/credentials", None, None)
        .await;

    assert!(issued_cookie(&response).is_none());
    assert_failure(response, StatusCode::FORBIDDEN, "FORBIDDEN", MANAGEMENT_FAILED).await;
}
