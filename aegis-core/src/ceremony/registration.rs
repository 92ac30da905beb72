//! Registration (attestation) ceremony

use serde_json::Value;

use super::{CeremonyContext, Orchestrator};
use crate::credential::{
    default_description, validate_description, WebAuthnCredential, WebAuthnUser,
};
use crate::error::CeremonyError;
use crate::relying_party::{RelyingPartyContext, UserVerification};
use crate::session::{CeremonyKind, ChallengeSession, UserSession};
use crate::storage::StorageError;
use crate::verifier::CeremonyVerifier;

const NOT_INITIATED: &str = "registration has not been initiated";

impl<V: CeremonyVerifier> Orchestrator<V> {
    /// Start registering a new credential for the signed-in user.
    ///
    /// Without a description the first free `Security Key N` is used.
    pub async fn begin_registration(
        &self,
        ctx: &CeremonyContext<'_>,
        description: Option<String>,
    ) -> Result<V::CreationOptions, CeremonyError> {
        let session = ctx.sessions.load().await?;
        let username = session
            .authenticated_username()
            .ok_or(CeremonyError::AnonymousSession)?;

        let rp = self.resolver.resolve(&ctx.origin).map_err(|e| {
            tracing::warn!(username = %username, error = %e, "Registration origin rejected");
            CeremonyError::Origin(e)
        })?;

        let user = self.load_or_create_user(&rp, &session, username).await?;

        let existing = self
            .services
            .credentials
            .load_credentials_by_username(&rp.id, username)
            .await
            .map_err(|e| {
                tracing::error!(username = %username, error = %e, "Failed to load credentials");
                CeremonyError::Storage(e)
            })?;

        let description = match description {
            Some(description) => validate_description(&description, &existing, None)?,
            None => default_description(&existing),
        };

        let challenge = self.verifier.begin_registration(&rp, &user, &existing)?;

        let now = self.services.clock.now();
        ctx.challenges
            .put(ChallengeSession {
                ceremony: CeremonyKind::Registration,
                rp_id: rp.id.clone(),
                user_handle: Some(user.user_handle.clone()),
                description: Some(description.clone()),
                user_verification: rp.user_verification,
                state: challenge.state,
                created_at: now,
                expires_at: now + self.challenge_expiry(rp.timeout),
            })
            .await?;

        tracing::info!(
            username = %username,
            rp_id = %rp.id,
            description = %description,
            excluded = existing.len(),
            "WebAuthn registration started"
        );

        Ok(challenge.options)
    }

    /// Verify an attestation and store the new credential.
    ///
    /// The challenge is cleared whatever the outcome.
    pub async fn finish_registration(
        &self,
        ctx: &CeremonyContext<'_>,
        response: Value,
    ) -> Result<WebAuthnCredential, CeremonyError> {
        let result = self.finish_registration_inner(ctx, response).await;
        self.clear_challenge(ctx).await;

        if let Err(e) = &result {
            tracing::warn!(error = %e, "WebAuthn registration failed");
        }

        result
    }

    async fn finish_registration_inner(
        &self,
        ctx: &CeremonyContext<'_>,
        response: Value,
    ) -> Result<WebAuthnCredential, CeremonyError> {
        let session = ctx.sessions.load().await?;
        let username = session
            .authenticated_username()
            .ok_or(CeremonyError::AnonymousSession)?;

        let challenge = self
            .live_challenge(ctx, CeremonyKind::Registration, NOT_INITIATED)
            .await?;

        let rp = self
            .resolver
            .resolve(&ctx.origin)
            .map_err(|e| CeremonyError::RelyingPartyChanged(e.to_string()))?;
        if rp.id != challenge.rp_id {
            return Err(CeremonyError::RelyingPartyChanged(format!(
                "began for {}, finished for {}",
                challenge.rp_id, rp.id
            )));
        }

        let attestation: V::Attestation = serde_json::from_value(response)
            .map_err(|e| CeremonyError::Parse(e.to_string()))?;

        let repo = &self.services.credentials;

        let user = repo
            .load_user(&rp.id, username)
            .await?
            .ok_or(CeremonyError::UserLookup)?;
        if challenge.user_handle.as_ref() != Some(&user.user_handle) {
            return Err(CeremonyError::UserMismatch);
        }

        let existing = repo.load_credentials_by_username(&rp.id, username).await?;

        let description = match &challenge.description {
            Some(description) => validate_description(description, &existing, None)?,
            None => default_description(&existing),
        };

        let registered =
            self.verifier
                .finish_registration(&rp, &user, &challenge.state, &attestation)?;

        if challenge.user_verification == UserVerification::Required
            && !registered.flags.user_verified
        {
            return Err(CeremonyError::UserVerificationRequired);
        }

        let credential = WebAuthnCredential {
            id: 0,
            rp_id: rp.id.clone(),
            username: username.to_string(),
            description,
            credential_id: registered.credential_id,
            public_key: registered.public_key,
            attestation_type: registered.attestation_type,
            attachment: registered.attachment,
            transports: registered.transports,
            aaguid: registered.aaguid,
            sign_count: registered.sign_count,
            discoverable: registered.discoverable,
            flags: registered.flags,
            clone_warning: false,
            created_at: self.services.clock.now(),
            last_used_at: None,
        };

        let saved = repo.save_credential(credential).await.map_err(|e| {
            match &e {
                StorageError::Duplicate(_) => {
                    tracing::warn!(username = %username, error = %e, "Credential already registered")
                }
                _ => tracing::error!(username = %username, error = %e, "Failed to save credential"),
            }
            CeremonyError::Storage(e)
        })?;

        tracing::info!(
            username = %username,
            rp_id = %saved.rp_id,
            credential = %saved.encoded_id(),
            description = %saved.description,
            discoverable = saved.discoverable,
            "WebAuthn registration completed"
        );

        if let Err(e) = self
            .services
            .notifier
            .second_factor_added(username, &saved)
            .await
        {
            tracing::error!(username = %username, error = %e, "Failed to send second factor notification");
        }

        Ok(saved)
    }

    async fn load_or_create_user(
        &self,
        rp: &RelyingPartyContext,
        session: &UserSession,
        username: &str,
    ) -> Result<WebAuthnUser, CeremonyError> {
        let repo = &self.services.credentials;

        let load = |e: StorageError| {
            tracing::error!(username = %username, error = %e, "Failed to load WebAuthn user");
            CeremonyError::Storage(e)
        };

        if let Some(user) = repo.load_user(&rp.id, username).await.map_err(load)? {
            return Ok(user);
        }

        let display_name = session.display_name.as_deref().unwrap_or(username);
        match repo
            .save_user(WebAuthnUser::new(&rp.id, username, display_name))
            .await
        {
            Ok(user) => {
                tracing::debug!(username = %username, rp_id = %rp.id, "Created WebAuthn user");
                Ok(user)
            }
            // Created concurrently by another request
            Err(StorageError::Duplicate(_)) => repo
                .load_user(&rp.id, username)
                .await
                .map_err(load)?
                .ok_or(CeremonyError::UserLookup),
            Err(e) => Err(load(e)),
        }
    }
}
