//! Credential management for the signed-in user

use super::{CeremonyContext, Orchestrator};
use crate::credential::{validate_description, WebAuthnCredential};
use crate::error::CeremonyError;
use crate::relying_party::RelyingPartyContext;
use crate::storage::StorageError;
use crate::verifier::CeremonyVerifier;

impl<V: CeremonyVerifier> Orchestrator<V> {
    /// Credentials registered by the signed-in user for the request's RP.
    pub async fn list_credentials(
        &self,
        ctx: &CeremonyContext<'_>,
    ) -> Result<Vec<WebAuthnCredential>, CeremonyError> {
        let (rp, username) = self.management_scope(ctx).await?;

        let credentials = self
            .services
            .credentials
            .load_credentials_by_username(&rp.id, &username)
            .await?;

        tracing::debug!(username = %username, count = credentials.len(), "Listed credentials");
        Ok(credentials)
    }

    pub async fn rename_credential(
        &self,
        ctx: &CeremonyContext<'_>,
        id: i64,
        description: &str,
    ) -> Result<WebAuthnCredential, CeremonyError> {
        let (rp, username) = self.management_scope(ctx).await?;
        let repo = &self.services.credentials;

        let existing = repo.load_credentials_by_username(&rp.id, &username).await?;
        let Some(mut credential) = existing.iter().find(|c| c.id == id).cloned() else {
            tracing::warn!(username = %username, id, "Rename of unknown credential");
            return Err(CeremonyError::CredentialNotFound);
        };

        let description = validate_description(description, &existing, Some(id))?;

        repo.update_credential_description(&rp.id, &username, id, &description)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) => CeremonyError::CredentialNotFound,
                e => CeremonyError::Storage(e),
            })?;

        tracing::info!(
            username = %username,
            credential = %credential.encoded_id(),
            from = %credential.description,
            to = %description,
            "Credential renamed"
        );

        credential.description = description;
        Ok(credential)
    }

    pub async fn delete_credential(
        &self,
        ctx: &CeremonyContext<'_>,
        id: i64,
    ) -> Result<(), CeremonyError> {
        let (rp, username) = self.management_scope(ctx).await?;
        let repo = &self.services.credentials;

        let credential = repo
            .load_credential_by_id(id)
            .await?
            .filter(|c| c.rp_id == rp.id && c.username == username)
            .ok_or_else(|| {
                tracing::warn!(username = %username, id, "Delete of unknown credential");
                CeremonyError::CredentialNotFound
            })?;

        repo.delete_credential(id).await.map_err(|e| match e {
            StorageError::NotFound(_) => CeremonyError::CredentialNotFound,
            e => CeremonyError::Storage(e),
        })?;

        tracing::info!(
            username = %username,
            credential = %credential.encoded_id(),
            description = %credential.description,
            "Credential deleted"
        );
        Ok(())
    }

    async fn management_scope(
        &self,
        ctx: &CeremonyContext<'_>,
    ) -> Result<(RelyingPartyContext, String), CeremonyError> {
        let session = ctx.sessions.load().await?;
        let username = session
            .authenticated_username()
            .ok_or(CeremonyError::AnonymousSession)?
            .to_string();

        let rp = self
            .resolver
            .resolve(&ctx.origin)
            .map_err(CeremonyError::Origin)?;

        Ok((rp, username))
    }
}
