//! Aegis Server Library - REST API components for WebAuthn and passkey ceremonies
//!
//! This library exposes the server components for use in integration tests.
//! The main binary uses these same components.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod openapi;
pub mod routes;
pub mod session;
pub mod state;

pub use config::{Config, ConfigError};
pub use db::PostgresCredentialRepository;
pub use error::ApiError;
pub use openapi::ApiDoc;
pub use routes::{create_router, create_router_with_state};
pub use session::{CeremonyRequest, SESSION_COOKIE_NAME};
pub use state::AppState;
