//! Credential storage
//!
//! Persistent storage for WebAuthn users and their credentials. The
//! orchestrator only sees the [`CredentialRepository`] trait; the server
//! crate provides a PostgreSQL backend and [`MemoryCredentialRepository`]
//! covers development and tests (credentials are lost on restart).

mod memory;

pub use memory::MemoryCredentialRepository;

use async_trait::async_trait;

use crate::credential::{UserHandle, WebAuthnCredential, WebAuthnUser};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A uniqueness constraint (credential ID, description, user) was violated
    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Users and credentials, scoped by RPID.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn load_user(
        &self,
        rp_id: &str,
        username: &str,
    ) -> Result<Option<WebAuthnUser>, StorageError>;

    async fn load_user_by_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Option<WebAuthnUser>, StorageError>;

    /// Insert a user. Returns the stored user with its identifier set.
    async fn save_user(&self, user: WebAuthnUser) -> Result<WebAuthnUser, StorageError>;

    async fn load_credentials_by_username(
        &self,
        rp_id: &str,
        username: &str,
    ) -> Result<Vec<WebAuthnCredential>, StorageError>;

    async fn load_credentials_by_user_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Vec<WebAuthnCredential>, StorageError>;

    /// Like [`load_credentials_by_user_handle`](Self::load_credentials_by_user_handle)
    /// restricted to resident (discoverable) credentials.
    async fn load_discoverable_credentials_by_user_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Vec<WebAuthnCredential>, StorageError>;

    async fn load_credential_by_id(&self, id: i64)
        -> Result<Option<WebAuthnCredential>, StorageError>;

    /// Insert a credential. Returns the stored credential with its identifier set.
    async fn save_credential(
        &self,
        credential: WebAuthnCredential,
    ) -> Result<WebAuthnCredential, StorageError>;

    /// Persist the mutable sign-in state: key material, sign count, flags,
    /// clone warning and last use.
    async fn update_credential_sign_in(
        &self,
        credential: &WebAuthnCredential,
    ) -> Result<(), StorageError>;

    async fn update_credential_description(
        &self,
        rp_id: &str,
        username: &str,
        id: i64,
        description: &str,
    ) -> Result<(), StorageError>;

    async fn delete_credential(&self, id: i64) -> Result<(), StorageError>;
}
