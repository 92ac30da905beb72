//! PostgreSQL storage for WebAuthn users and credentials

use aegis_core::{
    Attachment, AuthenticatorFlags, CredentialRepository, StorageError, UserHandle,
    WebAuthnCredential, WebAuthnUser,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

const CREDENTIAL_COLUMNS: &str = r#"
    c.id, c.rp_id, c.username, c.description, c.credential_id, c.public_key,
    c.attestation_type, c.attachment, c.transports, c.aaguid, c.sign_count,
    c.discoverable, c.present, c.verified, c.backup_eligible, c.backup_state,
    c.clone_warning, c.created_at, c.last_used_at
"#;

/// PostgreSQL-backed credential repository
pub struct PostgresCredentialRepository {
    pool: PgPool,
}

impl PostgresCredentialRepository {
    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Check database connection health
    pub async fn check_health(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn fetch_credentials(
        &self,
        filter: &str,
        rp_id: &str,
        key: CredentialKey<'_>,
    ) -> Result<Vec<WebAuthnCredential>, StorageError> {
        let sql = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM webauthn_credentials c {filter} ORDER BY c.id"
        );
        let query = sqlx::query_as::<_, CredentialRow>(&sql).bind(rp_id);
        let query = match key {
            CredentialKey::Username(username) => query.bind(username),
            CredentialKey::Handle(handle) => query.bind(handle.as_bytes()),
        };

        query
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?
            .into_iter()
            .map(CredentialRow::into_credential)
            .collect()
    }
}

enum CredentialKey<'a> {
    Username(&'a str),
    Handle(&'a UserHandle),
}

#[async_trait]
impl CredentialRepository for PostgresCredentialRepository {
    async fn load_user(
        &self,
        rp_id: &str,
        username: &str,
    ) -> Result<Option<WebAuthnUser>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, rp_id, username, display_name, user_handle
            FROM webauthn_users
            WHERE rp_id = $1 AND username = $2
            "#,
        )
        .bind(rp_id)
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(row.map(UserRow::into_user))
    }

    async fn load_user_by_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Option<WebAuthnUser>, StorageError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, rp_id, username, display_name, user_handle
            FROM webauthn_users
            WHERE rp_id = $1 AND user_handle = $2
            "#,
        )
        .bind(rp_id)
        .bind(handle.as_bytes())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(row.map(UserRow::into_user))
    }

    async fn save_user(&self, mut user: WebAuthnUser) -> Result<WebAuthnUser, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO webauthn_users (rp_id, username, display_name, user_handle)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&user.rp_id)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(user.user_handle.as_bytes())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error(e, format!("user {} already exists", user.username)))?;

        tracing::info!(username = %user.username, rp_id = %user.rp_id, "WebAuthn user stored");
        user.id = Some(id);
        Ok(user)
    }

    async fn load_credentials_by_username(
        &self,
        rp_id: &str,
        username: &str,
    ) -> Result<Vec<WebAuthnCredential>, StorageError> {
        self.fetch_credentials(
            "WHERE c.rp_id = $1 AND c.username = $2",
            rp_id,
            CredentialKey::Username(username),
        )
        .await
    }

    async fn load_credentials_by_user_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Vec<WebAuthnCredential>, StorageError> {
        self.fetch_credentials(
            r#"JOIN webauthn_users u ON u.rp_id = c.rp_id AND u.username = c.username
               WHERE c.rp_id = $1 AND u.user_handle = $2"#,
            rp_id,
            CredentialKey::Handle(handle),
        )
        .await
    }

    async fn load_discoverable_credentials_by_user_handle(
        &self,
        rp_id: &str,
        handle: &UserHandle,
    ) -> Result<Vec<WebAuthnCredential>, StorageError> {
        self.fetch_credentials(
            r#"JOIN webauthn_users u ON u.rp_id = c.rp_id AND u.username = c.username
               WHERE c.rp_id = $1 AND u.user_handle = $2 AND c.discoverable"#,
            rp_id,
            CredentialKey::Handle(handle),
        )
        .await
    }

    async fn load_credential_by_id(
        &self,
        id: i64,
    ) -> Result<Option<WebAuthnCredential>, StorageError> {
        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM webauthn_credentials c WHERE c.id = $1");
        sqlx::query_as::<_, CredentialRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?
            .map(CredentialRow::into_credential)
            .transpose()
    }

    async fn save_credential(
        &self,
        mut credential: WebAuthnCredential,
    ) -> Result<WebAuthnCredential, StorageError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO webauthn_credentials
                (rp_id, username, description, credential_id, public_key, attestation_type,
                 attachment, transports, aaguid, sign_count, discoverable, present, verified,
                 backup_eligible, backup_state, clone_warning, created_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING id
            "#,
        )
        .bind(&credential.rp_id)
        .bind(&credential.username)
        .bind(&credential.description)
        .bind(&credential.credential_id)
        .bind(&credential.public_key)
        .bind(&credential.attestation_type)
        .bind(credential.attachment.as_str())
        .bind(&credential.transports)
        .bind(credential.aaguid)
        .bind(i64::from(credential.sign_count))
        .bind(credential.discoverable)
        .bind(credential.flags.user_present)
        .bind(credential.flags.user_verified)
        .bind(credential.flags.backup_eligible)
        .bind(credential.flags.backup_state)
        .bind(credential.clone_warning)
        .bind(credential.created_at)
        .bind(credential.last_used_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            write_error(
                e,
                format!(
                    "credential {} or description '{}' already registered",
                    credential.encoded_id(),
                    credential.description
                ),
            )
        })?;

        tracing::info!(
            credential = %credential.encoded_id(),
            username = %credential.username,
            "Credential stored in database"
        );
        credential.id = id;
        Ok(credential)
    }

    async fn update_credential_sign_in(
        &self,
        credential: &WebAuthnCredential,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE webauthn_credentials
            SET public_key = $2, sign_count = $3, present = $4, verified = $5,
                backup_eligible = $6, backup_state = $7, clone_warning = $8, last_used_at = $9
            WHERE id = $1
            "#,
        )
        .bind(credential.id)
        .bind(&credential.public_key)
        .bind(i64::from(credential.sign_count))
        .bind(credential.flags.user_present)
        .bind(credential.flags.user_verified)
        .bind(credential.flags.backup_eligible)
        .bind(credential.flags.backup_state)
        .bind(credential.clone_warning)
        .bind(credential.last_used_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("credential {}", credential.id)));
        }
        Ok(())
    }

    async fn update_credential_description(
        &self,
        rp_id: &str,
        username: &str,
        id: i64,
        description: &str,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE webauthn_credentials
            SET description = $4
            WHERE id = $1 AND rp_id = $2 AND username = $3
            "#,
        )
        .bind(id)
        .bind(rp_id)
        .bind(username)
        .bind(description)
        .execute(&self.pool)
        .await
        .map_err(|e| write_error(e, format!("description '{}' already in use", description)))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("credential {}", id)));
        }
        Ok(())
    }

    async fn delete_credential(&self, id: i64) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM webauthn_credentials WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("credential {}", id)));
        }
        Ok(())
    }
}

fn query_error(err: sqlx::Error) -> StorageError {
    StorageError::Query(err.to_string())
}

/// Unique violations become [`StorageError::Duplicate`] so the orchestrator
/// can answer with a conflict.
fn write_error(err: sqlx::Error, duplicate: String) -> StorageError {
    if is_unique_violation(&err) {
        StorageError::Duplicate(duplicate)
    } else {
        query_error(err)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Database row for users
#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    rp_id: String,
    username: String,
    display_name: String,
    user_handle: Vec<u8>,
}

impl UserRow {
    fn into_user(self) -> WebAuthnUser {
        WebAuthnUser {
            id: Some(self.id),
            rp_id: self.rp_id,
            username: self.username,
            display_name: self.display_name,
            user_handle: UserHandle::from_bytes(self.user_handle),
        }
    }
}

/// Database row for credentials
#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: i64,
    rp_id: String,
    username: String,
    description: String,
    credential_id: Vec<u8>,
    public_key: Vec<u8>,
    attestation_type: String,
    attachment: String,
    transports: Vec<String>,
    aaguid: Option<Uuid>,
    sign_count: i64,
    discoverable: bool,
    present: bool,
    verified: bool,
    backup_eligible: bool,
    backup_state: bool,
    clone_warning: bool,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl CredentialRow {
    fn into_credential(self) -> Result<WebAuthnCredential, StorageError> {
        let sign_count = u32::try_from(self.sign_count).map_err(|_| {
            StorageError::Serialization(format!(
                "credential {} has an out of range sign count {}",
                self.id, self.sign_count
            ))
        })?;

        Ok(WebAuthnCredential {
            id: self.id,
            rp_id: self.rp_id,
            username: self.username,
            description: self.description,
            credential_id: self.credential_id,
            public_key: self.public_key,
            attestation_type: self.attestation_type,
            attachment: Attachment::parse(&self.attachment),
            transports: self.transports,
            aaguid: self.aaguid,
            sign_count,
            discoverable: self.discoverable,
            flags: AuthenticatorFlags {
                user_present: self.present,
                user_verified: self.verified,
                backup_eligible: self.backup_eligible,
                backup_state: self.backup_state,
            },
            clone_warning: self.clone_warning,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
        })
    }
}
