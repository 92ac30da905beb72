//! OpenAPI documentation configuration
//!
//! Generates the OpenAPI 3 document for the Aegis WebAuthn API.

use utoipa::OpenApi;

use crate::error::ErrorBody;
use crate::handlers::{
    AssertionResponse, CredentialResponse, HealthResponse, PasskeyFinishRequest, ReadyResponse,
    RegisterBeginRequest, RenameCredentialRequest,
};

/// Aegis WebAuthn API - OpenAPI Documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Aegis - WebAuthn API",
        version = "0.1.0",
        description = r#"
## WebAuthn and passkey ceremonies for the Aegis identity portal

Every ceremony is two calls. **Begin** returns the options to hand to
`navigator.credentials.create()` or `navigator.credentials.get()` and stores
the challenge in the caller's session. **Finish** takes the browser's
response and consumes the challenge, whether it succeeds or not.

- Security keys are registered by a signed-in user and used as a second factor
- Passkeys (discoverable credentials) sign an anonymous session in directly

The session is carried by the `aegis_session` cookie. Successful responses are
`{"status":"OK","data":...}`; failures are `{"status":"KO","message":...,"code":...}`
and never say why a ceremony failed.
"#,
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    tags(
        (name = "WebAuthn", description = "Security key registration and second factor assertion"),
        (name = "Passkey", description = "Usernameless first factor login"),
        (name = "Credentials", description = "Manage the signed-in user's credentials"),
        (name = "Health", description = "Service health and readiness endpoints")
    ),
    paths(
        crate::handlers::health::health,
        crate::handlers::health::ready,
        crate::handlers::webauthn::register_begin,
        crate::handlers::webauthn::register_finish,
        crate::handlers::webauthn::assertion_begin,
        crate::handlers::webauthn::assertion_finish,
        crate::handlers::passkey::passkey_begin,
        crate::handlers::passkey::passkey_finish,
        crate::handlers::credentials::list_credentials,
        crate::handlers::credentials::rename_credential,
        crate::handlers::credentials::delete_credential,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            ErrorBody,
            RegisterBeginRequest,
            PasskeyFinishRequest,
            RenameCredentialRequest,
            CredentialResponse,
            AssertionResponse,
        )
    )
)]
pub struct ApiDoc;
