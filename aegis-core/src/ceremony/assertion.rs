//! Assertion (login) ceremony, classic second factor and discoverable passkey

use serde_json::Value;

use super::{AssertionBegin, AssertionFinish, CeremonyContext, Orchestrator};
use crate::credential::{Attachment, UserHandle, WebAuthnCredential, WebAuthnUser};
use crate::error::CeremonyError;
use crate::regulation::{AttemptMethod, AuthenticationAttempt};
use crate::relying_party::UserVerification;
use crate::session::{AuthenticationLevel, AuthenticatorMarkers, CeremonyKind, ChallengeSession, UserSession};
use crate::verifier::{AssertionIdentity, CeremonyVerifier, LoginExtensions, VerifyError};

const NOT_PRESENT: &str = "challenge session data is not present";

impl<V: CeremonyVerifier> Orchestrator<V> {
    /// Issue an assertion challenge.
    pub async fn begin_assertion(
        &self,
        ctx: &CeremonyContext<'_>,
        begin: AssertionBegin,
    ) -> Result<V::RequestOptions, CeremonyError> {
        match begin {
            AssertionBegin::Classic => self.begin_classic(ctx).await,
            AssertionBegin::Discoverable => self.begin_discoverable(ctx).await,
        }
    }

    async fn begin_classic(
        &self,
        ctx: &CeremonyContext<'_>,
    ) -> Result<V::RequestOptions, CeremonyError> {
        let session = ctx.sessions.load().await?;
        let username = session
            .authenticated_username()
            .ok_or(CeremonyError::AnonymousSession)?;

        let rp = self.resolver.resolve(&ctx.origin).map_err(|e| {
            tracing::warn!(username = %username, error = %e, "Assertion origin rejected");
            CeremonyError::OriginRejected(e)
        })?;

        let repo = &self.services.credentials;
        let user = repo
            .load_user(&rp.id, username)
            .await
            .map_err(|e| {
                tracing::error!(username = %username, error = %e, "Failed to load WebAuthn user");
                CeremonyError::Storage(e)
            })?
            .ok_or(CeremonyError::NoCredentials)?;

        let credentials = repo
            .load_credentials_by_username(&rp.id, username)
            .await
            .map_err(|e| {
                tracing::error!(username = %username, error = %e, "Failed to load credentials");
                CeremonyError::Storage(e)
            })?;

        if credentials.is_empty() {
            return Err(CeremonyError::NoCredentials);
        }

        let extensions = LoginExtensions {
            app_id: credentials
                .iter()
                .any(WebAuthnCredential::is_legacy_u2f)
                .then(|| self.app_id(&rp.origin)),
        };

        let challenge = self
            .verifier
            .begin_login(&rp, &user, &credentials, &extensions)?;

        self.store_assertion_challenge(
            ctx,
            CeremonyKind::Assertion,
            &rp.id,
            Some(user.user_handle.clone()),
            rp.user_verification,
            rp.timeout,
            challenge.state,
        )
        .await?;

        tracing::info!(
            username = %username,
            rp_id = %rp.id,
            credentials = credentials.len(),
            app_id = extensions.app_id.is_some(),
            "WebAuthn assertion started"
        );

        Ok(challenge.options)
    }

    async fn begin_discoverable(
        &self,
        ctx: &CeremonyContext<'_>,
    ) -> Result<V::RequestOptions, CeremonyError> {
        if !self.services.policy.passkey_login_enabled {
            return Err(CeremonyError::PasskeyLoginDisabled);
        }

        let session = ctx.sessions.load().await?;
        if let Some(username) = session.authenticated_username() {
            tracing::warn!(username = %username, "Passkey login requested by an authenticated session");
            return Err(CeremonyError::AlreadyAuthenticated);
        }

        let rp = self.resolver.resolve(&ctx.origin).map_err(|e| {
            tracing::warn!(error = %e, "Passkey origin rejected");
            CeremonyError::OriginRejected(e)
        })?;

        let challenge = self.verifier.begin_discoverable_login(&rp)?;

        self.store_assertion_challenge(
            ctx,
            CeremonyKind::Discoverable,
            &rp.id,
            None,
            rp.user_verification,
            rp.timeout,
            challenge.state,
        )
        .await?;

        tracing::info!(rp_id = %rp.id, "Passkey login started");

        Ok(challenge.options)
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_assertion_challenge(
        &self,
        ctx: &CeremonyContext<'_>,
        kind: CeremonyKind,
        rp_id: &str,
        user_handle: Option<UserHandle>,
        user_verification: UserVerification,
        timeout: std::time::Duration,
        state: Value,
    ) -> Result<(), CeremonyError> {
        let now = self.services.clock.now();
        ctx.challenges
            .put(ChallengeSession {
                ceremony: kind,
                rp_id: rp_id.to_string(),
                user_handle,
                description: None,
                user_verification,
                state,
                created_at: now,
                expires_at: now + self.challenge_expiry(timeout),
            })
            .await?;
        Ok(())
    }

    fn app_id(&self, origin: &url::Url) -> String {
        match &self.services.policy.u2f_app_id {
            Some(app_id) => app_id.clone(),
            None => format!("https://{}", origin.host_str().unwrap_or_default()),
        }
    }

    /// Verify an assertion and mark the session authenticated.
    ///
    /// The challenge is cleared whatever the outcome. Verification failures
    /// for a known user are reported to the regulator.
    pub async fn finish_assertion(
        &self,
        ctx: &CeremonyContext<'_>,
        finish: AssertionFinish,
        response: Value,
    ) -> Result<UserSession, CeremonyError> {
        let method = if finish.is_discoverable() {
            AttemptMethod::Passkey
        } else {
            AttemptMethod::WebAuthn
        };

        let mut username = None;
        let result = self
            .finish_assertion_inner(ctx, finish, response, &mut username)
            .await;
        self.clear_challenge(ctx).await;

        if let Err(e) = &result {
            tracing::warn!(
                username = username.as_deref().unwrap_or("<unknown>"),
                method = %method,
                error = %e,
                "WebAuthn assertion failed"
            );

            let banned = matches!(e, CeremonyError::Banned(_));
            if let (Some(username), true) = (&username, banned || e.is_verification_failure()) {
                self.record_attempt(ctx, username, method, false, banned)
                    .await;
            }
        }

        result
    }

    async fn finish_assertion_inner(
        &self,
        ctx: &CeremonyContext<'_>,
        finish: AssertionFinish,
        response: Value,
        username: &mut Option<String>,
    ) -> Result<UserSession, CeremonyError> {
        let discoverable = finish.is_discoverable();
        let session = ctx.sessions.load().await?;

        if discoverable {
            if !self.services.policy.passkey_login_enabled {
                return Err(CeremonyError::PasskeyLoginDisabled);
            }
            if !session.is_anonymous() {
                return Err(CeremonyError::AlreadyAuthenticated);
            }
        } else {
            let name = session
                .authenticated_username()
                .ok_or(CeremonyError::AnonymousSession)?;
            *username = Some(name.to_string());
        }

        let kind = if discoverable {
            CeremonyKind::Discoverable
        } else {
            CeremonyKind::Assertion
        };
        let challenge = self.live_challenge(ctx, kind, NOT_PRESENT).await?;

        let assertion: V::Assertion = serde_json::from_value(response)
            .map_err(|e| CeremonyError::Parse(e.to_string()))?;

        let (user, credentials) = if discoverable {
            self.discoverable_candidates(&challenge, &assertion).await?
        } else {
            self.classic_candidates(&challenge, &session).await?
        };
        *username = Some(user.username.clone());

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

        let verified = if discoverable {
            self.verifier.finish_discoverable_login(
                &rp,
                &user,
                &credentials,
                &challenge.state,
                &assertion,
            )
        } else {
            self.verifier
                .finish_login(&rp, &user, &credentials, &challenge.state, &assertion)
        };

        let verified = match verified {
            Ok(verified) => verified,
            Err(VerifyError::PossibleClone) => {
                let mut credential = find_credential(credentials, assertion.credential_id())?;
                credential.clone_warning = true;
                self.persist_clone_warning(&credential).await;
                return Err(CeremonyError::CloneDetected);
            }
            Err(e) => return Err(e.into()),
        };

        if challenge.user_verification == UserVerification::Required
            && !verified.flags.user_verified
        {
            return Err(CeremonyError::UserVerificationRequired);
        }

        let mut credential = find_credential(credentials, &verified.credential_id)?;

        if credential.apply_sign_count(verified.sign_count) {
            tracing::warn!(
                username = %user.username,
                credential = %credential.encoded_id(),
                stored = credential.sign_count,
                received = verified.sign_count,
                "Sign count did not advance, flagging credential"
            );
            self.persist_clone_warning(&credential).await;
            return Err(CeremonyError::CloneDetected);
        }

        credential.flags = verified.flags;
        credential.last_used_at = Some(self.services.clock.now());
        if let Some(public_key) = verified.public_key {
            credential.public_key = public_key;
        }

        self.services
            .credentials
            .update_credential_sign_in(&credential)
            .await
            .map_err(|e| {
                tracing::error!(username = %user.username, error = %e, "Failed to update credential sign-in");
                CeremonyError::Storage(e)
            })?;

        let regulator = &self.services.regulator;
        if regulator.is_ip_banned(ctx.remote_ip).await? {
            return Err(CeremonyError::Banned("remote address"));
        }
        if regulator.is_user_banned(&user.username).await? {
            return Err(CeremonyError::Banned("user"));
        }

        ctx.sessions.regenerate().await.map_err(|e| {
            tracing::error!(username = %user.username, error = %e, "Failed to regenerate session");
            CeremonyError::Session(e)
        })?;

        let method = if discoverable {
            AttemptMethod::Passkey
        } else {
            AttemptMethod::WebAuthn
        };
        self.record_attempt(ctx, &user.username, method, true, false)
            .await;

        let session = self.mark_session(session, &user, &credential, finish);
        ctx.sessions.save(&session).await?;

        tracing::info!(
            username = %user.username,
            rp_id = %rp.id,
            credential = %credential.encoded_id(),
            level = ?session.level,
            "WebAuthn assertion completed"
        );

        Ok(session)
    }

    /// User and candidate credentials for a classic assertion.
    async fn classic_candidates(
        &self,
        challenge: &ChallengeSession,
        session: &UserSession,
    ) -> Result<(WebAuthnUser, Vec<WebAuthnCredential>), CeremonyError> {
        let username = session
            .authenticated_username()
            .ok_or(CeremonyError::AnonymousSession)?;
        let repo = &self.services.credentials;

        let user = repo
            .load_user(&challenge.rp_id, username)
            .await?
            .ok_or(CeremonyError::UserLookup)?;

        if challenge.user_handle.as_ref() != Some(&user.user_handle) {
            return Err(CeremonyError::UserMismatch);
        }

        let credentials = repo
            .load_credentials_by_username(&challenge.rp_id, username)
            .await?;

        Ok((user, credentials))
    }

    /// User and candidate credentials for a discoverable assertion, resolved
    /// from the user handle in the response. Unknown handles and storage
    /// errors fail identically.
    async fn discoverable_candidates(
        &self,
        challenge: &ChallengeSession,
        assertion: &V::Assertion,
    ) -> Result<(WebAuthnUser, Vec<WebAuthnCredential>), CeremonyError> {
        let handle = match assertion.user_handle() {
            Some(handle) if !handle.is_empty() => UserHandle::from_bytes(handle),
            _ => return Err(CeremonyError::BlankUserHandle),
        };

        let repo = &self.services.credentials;

        let user = match repo.load_user_by_handle(&challenge.rp_id, &handle).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(user_handle = %handle, "No user for passkey user handle");
                return Err(CeremonyError::UserLookup);
            }
            Err(e) => {
                tracing::error!(user_handle = %handle, error = %e, "Failed to load user by handle");
                return Err(CeremonyError::UserLookup);
            }
        };

        let credentials = if self.services.policy.passkey_upgrade {
            repo.load_credentials_by_user_handle(&challenge.rp_id, &handle)
                .await
        } else {
            repo.load_discoverable_credentials_by_user_handle(&challenge.rp_id, &handle)
                .await
        };

        let credentials = credentials.map_err(|e| {
            tracing::error!(username = %user.username, error = %e, "Failed to load passkeys");
            CeremonyError::UserLookup
        })?;

        Ok((user, credentials))
    }

    async fn persist_clone_warning(&self, credential: &WebAuthnCredential) {
        if let Err(e) = self
            .services
            .credentials
            .update_credential_sign_in(credential)
            .await
        {
            tracing::error!(
                credential = %credential.encoded_id(),
                error = %e,
                "Failed to persist clone warning"
            );
        }
    }

    async fn record_attempt(
        &self,
        ctx: &CeremonyContext<'_>,
        username: &str,
        method: AttemptMethod,
        successful: bool,
        banned: bool,
    ) {
        let attempt = AuthenticationAttempt {
            successful,
            banned,
            username: username.to_string(),
            method,
            remote_ip: ctx.remote_ip,
            time: self.services.clock.now(),
        };

        if let Err(e) = self.services.regulator.record_attempt(attempt).await {
            tracing::error!(username = %username, error = %e, "Failed to record authentication attempt");
        }
    }

    fn mark_session(
        &self,
        mut session: UserSession,
        user: &WebAuthnUser,
        credential: &WebAuthnCredential,
        finish: AssertionFinish,
    ) -> UserSession {
        let now = self.services.clock.now();
        let policy = &self.services.policy;

        let markers = AuthenticatorMarkers {
            passkey: finish.is_discoverable(),
            user_present: credential.flags.user_present,
            user_verified: credential.flags.user_verified,
            cross_platform: credential.attachment == Attachment::CrossPlatform,
        };

        match finish {
            AssertionFinish::Classic => {
                session.level = AuthenticationLevel::TwoFactor;
                session.second_factor_at = Some(now);
            }
            AssertionFinish::Discoverable { keep_me_logged_in } => {
                let two_factor = policy.passkey_uv_two_factor && credential.flags.user_verified;

                session.username = Some(user.username.clone());
                session.display_name = Some(user.display_name.clone());
                session.first_factor_at = Some(now);
                if two_factor {
                    session.level = AuthenticationLevel::TwoFactor;
                    session.second_factor_at = Some(now);
                } else {
                    session.level = AuthenticationLevel::OneFactor;
                }

                if keep_me_logged_in && policy.remember_me > chrono::Duration::zero() {
                    session.remember_me_until = Some(now + policy.remember_me);
                }
            }
        }

        session.authenticator = Some(markers);
        session
    }
}

fn find_credential(
    credentials: Vec<WebAuthnCredential>,
    credential_id: &[u8],
) -> Result<WebAuthnCredential, CeremonyError> {
    credentials
        .into_iter()
        .find(|c| c.credential_id == credential_id)
        .ok_or(CeremonyError::CredentialNotFound)
}
