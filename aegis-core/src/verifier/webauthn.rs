//! webauthn-rs backed verifier
//!
//! A `WebauthnCore` is built from every resolved Relying Party context, so
//! the RPID, origin set, user verification policy and attestation
//! conveyance used at Begin and checked at Finish all follow the request's
//! context. Credentials store the serialized core `Credential` as their key
//! material; ceremony states are serialized into the challenge session.

use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;
use webauthn_rs_core::error::WebauthnError;
use webauthn_rs_core::proto::{
    AuthenticationResult, AuthenticationState, Credential, CredentialID, RegistrationState,
};
use webauthn_rs_core::WebauthnCore;
use webauthn_rs_proto::{
    AttestationConveyancePreference, CreationChallengeResponse, Mediation, PublicKeyCredential,
    RegisterPublicKeyCredential, RequestAuthenticationExtensions, RequestChallengeResponse,
    RequestRegistrationExtensions, UserVerificationPolicy,
};

use super::{
    AssertionIdentity, CeremonyVerifier, Challenge, LoginExtensions, RegisteredCredential,
    VerifiedAssertion, VerifyError,
};
use crate::credential::{Attachment, AuthenticatorFlags, WebAuthnCredential, WebAuthnUser};
use crate::relying_party::{ConveyancePreference, RelyingPartyContext, UserVerification};

/// Attestation response as posted by the browser.
///
/// Keeps the raw JSON next to the typed credential so that client-reported
/// details webauthn-rs does not model (attachment, `credProps`) survive.
#[derive(Debug, Clone)]
pub struct WebauthnAttestation {
    pub credential: RegisterPublicKeyCredential,
    raw: Value,
}

/// Assertion response as posted by the browser.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct WebauthnAssertion {
    pub credential: PublicKeyCredential,
}

impl<'de> Deserialize<'de> for WebauthnAttestation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        let credential =
            serde_json::from_value(raw.clone()).map_err(serde::de::Error::custom)?;
        Ok(Self { credential, raw })
    }
}

impl AssertionIdentity for WebauthnAssertion {
    fn credential_id(&self) -> &[u8] {
        &self.credential.raw_id
    }

    fn user_handle(&self) -> Option<&[u8]> {
        self.credential.response.user_handle.as_ref().map(|h| {
            let bytes: &[u8] = h;
            bytes
        })
    }
}

impl WebauthnAttestation {
    fn attachment(&self) -> Attachment {
        self.raw
            .get("authenticatorAttachment")
            .and_then(Value::as_str)
            .map(Attachment::parse)
            .unwrap_or_default()
    }

    fn transports(&self) -> Vec<String> {
        self.raw
            .pointer("/response/transports")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `credProps.rk` client extension output.
    fn resident_key(&self) -> bool {
        ["/clientExtensionResults/credProps/rk", "/extensions/credProps/rk"]
            .iter()
            .find_map(|pointer| self.raw.pointer(pointer).and_then(Value::as_bool))
            .unwrap_or(false)
    }
}

/// [`CeremonyVerifier`] implemented with the webauthn-rs core.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebauthnRsVerifier;

impl WebauthnRsVerifier {
    pub fn new() -> Self {
        Self
    }

    fn core(&self, rp: &RelyingPartyContext) -> Result<WebauthnCore, VerifyError> {
        let origins = if rp.origins.is_empty() {
            vec![rp.origin.clone()]
        } else {
            rp.origins.clone()
        };

        // Every origin must be the RPID or one of its subdomains
        let suffix = format!(".{}", rp.id);
        for origin in &origins {
            let valid = origin
                .domain()
                .map(|domain| domain == rp.id || domain.ends_with(&suffix))
                .unwrap_or(false);
            if !valid {
                return Err(VerifyError::RelyingParty(format!(
                    "{} is not within RPID {}",
                    origin, rp.id
                )));
            }
        }

        if u32::try_from(rp.timeout.as_millis()).is_err() {
            return Err(VerifyError::RelyingParty(format!(
                "timeout of {}s is too large",
                rp.timeout.as_secs()
            )));
        }

        Ok(WebauthnCore::new_unsafe_experts_only(
            &rp.display_name,
            &rp.id,
            origins,
            rp.timeout,
            Some(false),
            Some(false),
        ))
    }
}

impl CeremonyVerifier for WebauthnRsVerifier {
    type CreationOptions = CreationChallengeResponse;
    type RequestOptions = RequestChallengeResponse;
    type Attestation = WebauthnAttestation;
    type Assertion = WebauthnAssertion;

    fn begin_registration(
        &self,
        rp: &RelyingPartyContext,
        user: &WebAuthnUser,
        exclude: &[WebAuthnCredential],
    ) -> Result<Challenge<Self::CreationOptions>, VerifyError> {
        let core = self.core(rp)?;

        let exclude: Vec<CredentialID> = exclude
            .iter()
            .map(|c| CredentialID::from(c.credential_id.clone()))
            .collect();
        let exclude = (!exclude.is_empty()).then_some(exclude);

        let extensions = RequestRegistrationExtensions {
            cred_protect: None,
            uvm: Some(true),
            cred_props: Some(true),
            min_pin_length: None,
            hmac_create_secret: None,
        };

        let builder = core
            .new_challenge_register_builder(
                user.user_handle.as_bytes(),
                &user.username,
                &user.display_name,
            )
            .map_err(|e| VerifyError::Rejected(e.to_string()))?
            .attestation(conveyance(rp.attestation))
            .user_verification_policy(uv_policy(rp.user_verification))
            .exclude_credentials(exclude)
            .require_resident_key(false)
            .extensions(Some(extensions));

        let (options, state) = core
            .generate_challenge_register(builder)
            .map_err(|e| VerifyError::Rejected(e.to_string()))?;

        Ok(Challenge {
            options,
            state: to_state(&state)?,
        })
    }

    fn finish_registration(
        &self,
        rp: &RelyingPartyContext,
        _user: &WebAuthnUser,
        state: &Value,
        response: &Self::Attestation,
    ) -> Result<RegisteredCredential, VerifyError> {
        let core = self.core(rp)?;
        let state: RegistrationState = from_state(state)?;

        let credential = core
            .register_credential(&response.credential, &state, None)
            .map_err(map_webauthn_error)?;

        let document = serde_json::to_value(&credential)
            .map_err(|e| VerifyError::KeyMaterial(e.to_string()))?;
        let public_key = serde_json::to_vec(&credential)
            .map_err(|e| VerifyError::KeyMaterial(e.to_string()))?;

        Ok(RegisteredCredential {
            credential_id: credential.cred_id.to_vec(),
            public_key,
            attestation_type: document
                .get("attestation_format")
                .and_then(Value::as_str)
                .unwrap_or("none")
                .to_string(),
            attachment: response.attachment(),
            transports: response.transports(),
            aaguid: attested_aaguid(&document),
            sign_count: credential.counter,
            discoverable: response.resident_key(),
            flags: AuthenticatorFlags {
                user_present: true,
                user_verified: credential.user_verified,
                backup_eligible: credential.backup_eligible,
                backup_state: credential.backup_state,
            },
        })
    }

    fn begin_login(
        &self,
        rp: &RelyingPartyContext,
        _user: &WebAuthnUser,
        allowed: &[WebAuthnCredential],
        extensions: &LoginExtensions,
    ) -> Result<Challenge<Self::RequestOptions>, VerifyError> {
        let core = self.core(rp)?;

        let extensions = RequestAuthenticationExtensions {
            appid: extensions.app_id.clone(),
            uvm: Some(true),
            hmac_get_secret: None,
        };

        let builder = core
            .new_challenge_authenticate_builder(
                credentials(allowed)?,
                Some(uv_policy(rp.user_verification)),
            )
            .map_err(|e| VerifyError::Rejected(e.to_string()))?
            .extensions(Some(extensions));

        let (options, state) = core
            .generate_challenge_authenticate(builder)
            .map_err(|e| VerifyError::Rejected(e.to_string()))?;

        Ok(Challenge {
            options,
            state: to_state(&state)?,
        })
    }

    fn finish_login(
        &self,
        rp: &RelyingPartyContext,
        _user: &WebAuthnUser,
        credentials: &[WebAuthnCredential],
        state: &Value,
        response: &Self::Assertion,
    ) -> Result<VerifiedAssertion, VerifyError> {
        let core = self.core(rp)?;
        let state: AuthenticationState = from_state(state)?;

        let result = core
            .authenticate_credential(&response.credential, &state)
            .map_err(map_webauthn_error)?;

        verified(credentials, &result)
    }

    fn begin_discoverable_login(
        &self,
        rp: &RelyingPartyContext,
    ) -> Result<Challenge<Self::RequestOptions>, VerifyError> {
        let core = self.core(rp)?;

        let extensions = RequestAuthenticationExtensions {
            appid: None,
            uvm: Some(true),
            hmac_get_secret: None,
        };

        // No allow list: the authenticator picks a resident credential
        let builder = core
            .new_challenge_authenticate_builder(Vec::new(), Some(uv_policy(rp.user_verification)))
            .map_err(|e| VerifyError::Rejected(e.to_string()))?
            .extensions(Some(extensions));

        let (mut options, state) = core
            .generate_challenge_authenticate(builder)
            .map_err(|e| VerifyError::Rejected(e.to_string()))?;
        options.mediation = Some(Mediation::Conditional);

        Ok(Challenge {
            options,
            state: to_state(&state)?,
        })
    }

    fn finish_discoverable_login(
        &self,
        rp: &RelyingPartyContext,
        _user: &WebAuthnUser,
        candidates: &[WebAuthnCredential],
        state: &Value,
        response: &Self::Assertion,
    ) -> Result<VerifiedAssertion, VerifyError> {
        let core = self.core(rp)?;
        let mut state: AuthenticationState = from_state(state)?;
        state.set_allowed_credentials(credentials(candidates)?);

        let result = core
            .authenticate_credential(&response.credential, &state)
            .map_err(map_webauthn_error)?;

        verified(candidates, &result)
    }
}

fn uv_policy(requirement: UserVerification) -> UserVerificationPolicy {
    match requirement {
        UserVerification::Required => UserVerificationPolicy::Required,
        UserVerification::Preferred => UserVerificationPolicy::Preferred,
        UserVerification::Discouraged => UserVerificationPolicy::Discouraged_DO_NOT_USE,
    }
}

fn conveyance(preference: ConveyancePreference) -> AttestationConveyancePreference {
    match preference {
        ConveyancePreference::None => AttestationConveyancePreference::None,
        ConveyancePreference::Indirect => AttestationConveyancePreference::Indirect,
        ConveyancePreference::Direct => AttestationConveyancePreference::Direct,
    }
}

/// Build the assertion result, folding the new counter and flags into the
/// matching credential so its serialized form stays current.
fn verified(
    credentials: &[WebAuthnCredential],
    result: &AuthenticationResult,
) -> Result<VerifiedAssertion, VerifyError> {
    let credential_id: &[u8] = result.cred_id();

    let public_key = match credentials
        .iter()
        .find(|c| c.credential_id.as_slice() == credential_id)
    {
        Some(stored) => {
            let mut credential: Credential = serde_json::from_slice(&stored.public_key)
                .map_err(|e| VerifyError::KeyMaterial(e.to_string()))?;
            refresh(&mut credential, result);
            Some(
                serde_json::to_vec(&credential)
                    .map_err(|e| VerifyError::KeyMaterial(e.to_string()))?,
            )
        }
        None => None,
    };

    Ok(VerifiedAssertion {
        credential_id: credential_id.to_vec(),
        sign_count: result.counter(),
        flags: AuthenticatorFlags {
            user_present: true,
            user_verified: result.user_verified(),
            backup_eligible: result.backup_eligible(),
            backup_state: result.backup_state(),
        },
        public_key,
    })
}

/// Counter only moves forward; backup eligibility is only ever gained.
fn refresh(credential: &mut Credential, result: &AuthenticationResult) {
    if result.counter() > credential.counter {
        credential.counter = result.counter();
    }
    credential.backup_state = result.backup_state();
    if result.backup_eligible() {
        credential.backup_eligible = true;
    }
}

fn map_webauthn_error(e: WebauthnError) -> VerifyError {
    match e {
        WebauthnError::CredentialPossibleCompromise => VerifyError::PossibleClone,
        other => VerifyError::Rejected(other.to_string()),
    }
}

fn credentials(stored: &[WebAuthnCredential]) -> Result<Vec<Credential>, VerifyError> {
    stored
        .iter()
        .map(|c| {
            serde_json::from_slice(&c.public_key)
                .map_err(|e| VerifyError::KeyMaterial(format!("{}: {}", c.encoded_id(), e)))
        })
        .collect()
}

fn to_state<T: serde::Serialize>(state: &T) -> Result<Value, VerifyError> {
    serde_json::to_value(state).map_err(|e| VerifyError::State(e.to_string()))
}

fn from_state<T: DeserializeOwned>(state: &Value) -> Result<T, VerifyError> {
    serde_json::from_value(state.clone()).map_err(|e| VerifyError::State(e.to_string()))
}

/// AAGUID from the parsed attestation metadata, when the format carries one.
fn attested_aaguid(document: &Value) -> Option<Uuid> {
    document
        .pointer("/attestation/metadata")
        .and_then(Value::as_object)
        .and_then(|metadata| {
            metadata
                .values()
                .find_map(|m| m.get("aaguid").and_then(Value::as_str))
        })
        .and_then(|aaguid| Uuid::parse_str(aaguid).ok())
        .filter(|aaguid| !aaguid.is_nil())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use url::Url;

    fn rp() -> RelyingPartyContext {
        let origin = Url::parse("https://login.example.com").unwrap();
        RelyingPartyContext {
            id: "login.example.com".to_string(),
            display_name: "Aegis".to_string(),
            origin: origin.clone(),
            origins: vec![origin],
            user_verification: UserVerification::Preferred,
            timeout: Duration::from_secs(60),
            attestation: ConveyancePreference::Indirect,
        }
    }

    fn user() -> WebAuthnUser {
        WebAuthnUser::new("login.example.com", "john", "John")
    }

    #[test]
    fn test_registration_challenge_state_is_serializable() {
        let verifier = WebauthnRsVerifier::new();

        let challenge = verifier.begin_registration(&rp(), &user(), &[]).unwrap();
        assert!(challenge.state.is_object());

        let options = serde_json::to_value(&challenge.options).unwrap();
        assert_eq!(options["publicKey"]["rp"]["id"], "login.example.com");
        assert_eq!(options["publicKey"]["extensions"]["credProps"], true);

        let restored: Result<RegistrationState, _> = from_state(&challenge.state);
        assert!(restored.is_ok());
    }

    #[test]
    fn test_registration_options_follow_context_policy() {
        let verifier = WebauthnRsVerifier::new();
        let mut rp = rp();
        rp.user_verification = UserVerification::Discouraged;
        rp.attestation = ConveyancePreference::Direct;

        let challenge = verifier.begin_registration(&rp, &user(), &[]).unwrap();
        let options = serde_json::to_value(&challenge.options).unwrap();
        assert_eq!(
            options["publicKey"]["authenticatorSelection"]["userVerification"],
            "discouraged"
        );
        assert_eq!(options["publicKey"]["attestation"], "direct");
        assert_eq!(challenge.state["policy"], "discouraged");

        rp.user_verification = UserVerification::Required;
        rp.attestation = ConveyancePreference::None;
        let challenge = verifier.begin_registration(&rp, &user(), &[]).unwrap();
        let options = serde_json::to_value(&challenge.options).unwrap();
        assert_eq!(
            options["publicKey"]["authenticatorSelection"]["userVerification"],
            "required"
        );
        assert_eq!(options["publicKey"]["attestation"], "none");
    }

    #[test]
    fn test_login_options_follow_context_policy() {
        let verifier = WebauthnRsVerifier::new();
        let mut rp = rp();
        rp.user_verification = UserVerification::Discouraged;

        let extensions = LoginExtensions {
            app_id: Some("https://login.example.com".to_string()),
        };
        let challenge = verifier
            .begin_login(&rp, &user(), &[], &extensions)
            .unwrap();

        let options = serde_json::to_value(&challenge.options).unwrap();
        assert_eq!(options["publicKey"]["userVerification"], "discouraged");
        assert_eq!(
            options["publicKey"]["extensions"]["appid"],
            "https://login.example.com"
        );
        assert_eq!(challenge.state["appid"], "https://login.example.com");
        assert_eq!(challenge.state["policy"], "discouraged");
    }

    #[test]
    fn test_discoverable_challenge_has_no_allow_list() {
        let verifier = WebauthnRsVerifier::new();
        let mut rp = rp();
        rp.user_verification = UserVerification::Required;
        let challenge = verifier.begin_discoverable_login(&rp).unwrap();

        let options = serde_json::to_value(&challenge.options).unwrap();
        let allow = &options["publicKey"]["allowCredentials"];
        assert!(allow.is_null() || allow.as_array().map(Vec::is_empty).unwrap_or(false));
        assert_eq!(options["publicKey"]["userVerification"], "required");
        assert_eq!(options["mediation"], "conditional");

        let restored: Result<AuthenticationState, _> = from_state(&challenge.state);
        assert!(restored.is_ok());
    }

    #[test]
    fn test_blank_display_name_rejected() {
        let verifier = WebauthnRsVerifier::new();
        let mut user = user();
        user.display_name = String::new();

        let err = verifier.begin_registration(&rp(), &user, &[]).unwrap_err();
        assert!(matches!(err, VerifyError::Rejected(_)));
    }

    #[test]
    fn test_mismatched_rp_id_rejected() {
        let verifier = WebauthnRsVerifier::new();
        let mut rp = rp();
        rp.id = "other.org".to_string();

        let err = verifier.begin_discoverable_login(&rp).unwrap_err();
        assert!(matches!(err, VerifyError::RelyingParty(_)));

        // Suffix match must fall on a label boundary
        let mut rp = self::rp();
        rp.id = "example.com".to_string();
        rp.origins = vec![Url::parse("https://notexample.com").unwrap()];
        let err = verifier.begin_discoverable_login(&rp).unwrap_err();
        assert!(matches!(err, VerifyError::RelyingParty(_)));
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let verifier = WebauthnRsVerifier::new();
        let mut rp = rp();
        rp.timeout = Duration::from_secs(u64::from(u32::MAX));

        let err = verifier.begin_discoverable_login(&rp).unwrap_err();
        assert!(matches!(err, VerifyError::RelyingParty(_)));
    }

    #[test]
    fn test_assertion_identity_reads_raw_id_and_user_handle() {
        let body = serde_json::json!({
            "id": "AQID",
            "rawId": "AQID",
            "type": "public-key",
            "response": {
                "authenticatorData": "AA",
                "clientDataJSON": "AA",
                "signature": "AA",
                "userHandle": "BAUG"
            },
            "extensions": {}
        });

        let assertion: WebauthnAssertion = serde_json::from_value(body).unwrap();
        assert_eq!(assertion.credential_id(), &[1, 2, 3]);
        assert_eq!(assertion.user_handle(), Some(&[4u8, 5, 6][..]));
    }

    #[test]
    fn test_attestation_client_details() {
        let body = serde_json::json!({
            "id": "AQID",
            "rawId": "AQID",
            "type": "public-key",
            "authenticatorAttachment": "cross-platform",
            "response": {
                "attestationObject": "AA",
                "clientDataJSON": "AA",
                "transports": ["usb", "nfc"]
            },
            "clientExtensionResults": { "credProps": { "rk": true } }
        });

        let attestation: WebauthnAttestation = serde_json::from_value(body).unwrap();
        assert_eq!(attestation.attachment(), Attachment::CrossPlatform);
        assert_eq!(attestation.transports(), vec!["usb", "nfc"]);
        assert!(attestation.resident_key());
    }
}
