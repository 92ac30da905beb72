//! Router configuration module
//!
//! Configures all routes, middleware layers, and creates the application router.

use std::{sync::Arc, time::Duration};

use axum::{
    http::{header, Method, StatusCode},
    routing::{get, post, put},
    Router,
};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{Config, ConfigError};
use crate::handlers::{
    assertion_begin, assertion_finish, delete_credential, health, list_credentials,
    passkey_begin, passkey_finish, ready, register_begin, register_finish, rename_credential,
};
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Create the application router with default config and in-memory
/// collaborators (for testing)
pub fn create_router() -> Result<Router, ConfigError> {
    let config = Config::default();
    let state = AppState::in_memory(&config)?;
    Ok(create_router_with_state(state, &config))
}

/// Create the application router around existing state
pub fn create_router_with_state(state: AppState, config: &Config) -> Router {
    // Configure CORS based on allowed_origins
    let cors = match &config.allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            tracing::info!("CORS: Restricting to {} origin(s)", origins.len());
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
                .allow_credentials(true)
        }
        _ => {
            tracing::warn!("CORS: Allowing all origins (dev mode)");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    // Request body limit
    let body_limit = RequestBodyLimitLayer::new(config.body_limit_kb * 1024);

    // Request timeout
    let timeout = TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(config.timeout_secs),
    );

    let api = Router::new()
        .route(
            "/api/secondfactor/webauthn/credential/register/begin",
            post(register_begin),
        )
        .route(
            "/api/secondfactor/webauthn/credential/register/finish",
            post(register_finish),
        )
        .route(
            "/api/secondfactor/webauthn/assertion/begin",
            post(assertion_begin),
        )
        .route(
            "/api/secondfactor/webauthn/assertion/finish",
            post(assertion_finish),
        )
        .route("/api/secondfactor/webauthn/credentials", get(list_credentials))
        .route(
            "/api/secondfactor/webauthn/credential/{id}",
            put(rename_credential).delete(delete_credential),
        )
        .route("/api/firstfactor/passkey/begin", post(passkey_begin))
        .route("/api/firstfactor/passkey/finish", post(passkey_finish))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state);

    // Base router with common layers
    let router = api
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(body_limit)
        .layer(timeout);

    // Conditionally apply rate limiting (disabled in tests, enabled in production)
    if !config.rate_limit_enabled {
        tracing::warn!("Rate limiting: DISABLED");
        return router.layer(TraceLayer::new_for_http());
    }

    let governor_conf = match GovernorConfigBuilder::default()
        .per_second(config.rate_limit_per_sec)
        .burst_size(config.rate_limit_burst)
        .finish()
    {
        Some(conf) => conf,
        None => {
            tracing::error!(
                per_second = config.rate_limit_per_sec,
                burst = config.rate_limit_burst,
                "Invalid rate limit settings, rate limiting DISABLED"
            );
            return router.layer(TraceLayer::new_for_http());
        }
    };

    tracing::info!(
        "Rate limiting: {} req/s (burst: {})",
        config.rate_limit_per_sec,
        config.rate_limit_burst
    );

    router
        .layer(GovernorLayer::new(Arc::new(governor_conf)))
        .layer(TraceLayer::new_for_http())
}
