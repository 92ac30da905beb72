//! Relying Party resolution
//!
//! Derives the RPID and the allowed origin set for one request from the
//! forwarded-origin headers and static configuration. Resolution happens on
//! every Begin and every Finish; nothing here is cached, so an RPID that
//! differs between the two halves of a ceremony is always observable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Default ceremony timeout (60 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Relying Party resolution errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelyingPartyError {
    #[error("Relying Party display name is not configured")]
    MissingDisplayName,
    #[error("No origin could be determined for the request")]
    MissingOrigin,
    #[error("Malformed origin: {0}")]
    Malformed(String),
    #[error("Origin {0} is not an allowed origin")]
    UntrustedOrigin(String),
    #[error("Origin host {host} is not within Relying Party ID {rp_id}")]
    RpIdMismatch { host: String, rp_id: String },
}

/// User verification requirement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserVerification {
    Required,
    #[default]
    Preferred,
    Discouraged,
}

impl UserVerification {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "required" => Some(Self::Required),
            "preferred" => Some(Self::Preferred),
            "discouraged" => Some(Self::Discouraged),
            _ => None,
        }
    }
}

/// Attestation conveyance preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConveyancePreference {
    None,
    #[default]
    Indirect,
    Direct,
}

impl ConveyancePreference {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "indirect" => Some(Self::Indirect),
            "direct" => Some(Self::Direct),
            _ => None,
        }
    }
}

/// Static WebAuthn configuration.
#[derive(Debug, Clone)]
pub struct WebAuthnSettings {
    /// Relying Party display name
    pub display_name: String,
    /// Explicit RPID; derived from the request origin when `None`
    pub rp_id: Option<String>,
    /// Allowed origins; the request origin is trusted alone when empty
    pub allowed_origins: Vec<Url>,
    pub timeout: Duration,
    pub user_verification: UserVerification,
    pub attestation: ConveyancePreference,
}

impl Default for WebAuthnSettings {
    fn default() -> Self {
        Self {
            display_name: "Aegis".to_string(),
            rp_id: None,
            allowed_origins: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_verification: UserVerification::Preferred,
            attestation: ConveyancePreference::Indirect,
        }
    }
}

impl WebAuthnSettings {
    /// Load settings from environment variables
    ///
    /// Environment variables:
    /// - `WEBAUTHN_DISPLAY_NAME` - RP display name (default: "Aegis")
    /// - `WEBAUTHN_RP_ID` - explicit RPID (default: request host)
    /// - `WEBAUTHN_ALLOWED_ORIGINS` - comma-separated origin URLs
    /// - `WEBAUTHN_TIMEOUT_SECS` - ceremony timeout (default: 60)
    /// - `WEBAUTHN_USER_VERIFICATION` - required | preferred | discouraged
    /// - `WEBAUTHN_ATTESTATION` - none | indirect | direct
    pub fn from_env() -> Result<Self, RelyingPartyError> {
        let defaults = Self::default();

        let display_name =
            std::env::var("WEBAUTHN_DISPLAY_NAME").unwrap_or(defaults.display_name);

        let rp_id = std::env::var("WEBAUTHN_RP_ID")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let allowed_origins = match std::env::var("WEBAUTHN_ALLOWED_ORIGINS") {
            Ok(origins) => origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(|o| Url::parse(o).map_err(|e| RelyingPartyError::Malformed(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => Vec::new(),
        };

        let timeout = std::env::var("WEBAUTHN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        let user_verification = std::env::var("WEBAUTHN_USER_VERIFICATION")
            .ok()
            .and_then(|v| UserVerification::parse(&v))
            .unwrap_or(defaults.user_verification);

        let attestation = std::env::var("WEBAUTHN_ATTESTATION")
            .ok()
            .and_then(|v| ConveyancePreference::parse(&v))
            .unwrap_or(defaults.attestation);

        Ok(Self {
            display_name,
            rp_id,
            allowed_origins,
            timeout,
            user_verification,
            attestation,
        })
    }
}

/// Origin headers of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedOrigin {
    /// `X-Forwarded-Proto`
    pub proto: Option<String>,
    /// `X-Forwarded-Host`, falling back to `Host`
    pub host: Option<String>,
}

impl ForwardedOrigin {
    pub fn new(proto: Option<&str>, host: Option<&str>) -> Self {
        Self {
            proto: proto.map(str::to_string),
            host: host.map(str::to_string),
        }
    }
}

/// Per-request Relying Party context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelyingPartyContext {
    /// Relying Party ID
    pub id: String,
    pub display_name: String,
    /// Origin of the current request
    pub origin: Url,
    /// Origins accepted in client data
    pub origins: Vec<Url>,
    pub user_verification: UserVerification,
    pub timeout: Duration,
    pub attestation: ConveyancePreference,
}

/// Resolves [`RelyingPartyContext`]s from request headers.
#[derive(Debug, Clone)]
pub struct RelyingPartyResolver {
    settings: WebAuthnSettings,
}

impl RelyingPartyResolver {
    pub fn new(settings: WebAuthnSettings) -> Result<Self, RelyingPartyError> {
        if settings.display_name.trim().is_empty() {
            return Err(RelyingPartyError::MissingDisplayName);
        }

        Ok(Self { settings })
    }

    pub fn settings(&self) -> &WebAuthnSettings {
        &self.settings
    }

    /// Resolve the context for one request.
    pub fn resolve(
        &self,
        forwarded: &ForwardedOrigin,
    ) -> Result<RelyingPartyContext, RelyingPartyError> {
        let origin = match forwarded.host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => {
                parse_origin(forwarded.proto.as_deref().unwrap_or("https"), host)?
            }
            _ => self
                .settings
                .allowed_origins
                .first()
                .cloned()
                .ok_or(RelyingPartyError::MissingOrigin)?,
        };

        let host = origin
            .host_str()
            .ok_or_else(|| RelyingPartyError::Malformed(origin.to_string()))?
            .to_ascii_lowercase();

        let rp_id = self
            .settings
            .rp_id
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| host.clone());

        if host != rp_id && !host.ends_with(&format!(".{}", rp_id)) {
            return Err(RelyingPartyError::RpIdMismatch { host, rp_id });
        }

        let origins = if self.settings.allowed_origins.is_empty() {
            vec![origin.clone()]
        } else {
            let trusted = self
                .settings
                .allowed_origins
                .iter()
                .any(|allowed| allowed.origin() == origin.origin());
            if !trusted {
                return Err(RelyingPartyError::UntrustedOrigin(
                    origin.origin().ascii_serialization(),
                ));
            }
            self.settings.allowed_origins.clone()
        };

        Ok(RelyingPartyContext {
            id: rp_id,
            display_name: self.settings.display_name.clone(),
            origin,
            origins,
            user_verification: self.settings.user_verification,
            timeout: self.settings.timeout,
            attestation: self.settings.attestation,
        })
    }
}

fn parse_origin(proto: &str, host: &str) -> Result<Url, RelyingPartyError> {
    let proto = proto
        .split(',')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if proto != "https" && proto != "http" {
        return Err(RelyingPartyError::Malformed(format!(
            "unsupported scheme '{}'",
            proto
        )));
    }

    let host = host.split(',').next().unwrap_or_default().trim();
    if host.is_empty() || host.contains(['/', '?', '#', '@', ' ']) {
        return Err(RelyingPartyError::Malformed(format!(
            "invalid host '{}'",
            host
        )));
    }

    let url = Url::parse(&format!("{}://{}", proto, host))
        .map_err(|e| RelyingPartyError::Malformed(e.to_string()))?;

    if url.host_str().is_none() {
        return Err(RelyingPartyError::Malformed(url.to_string()));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(allowed: &[&str], rp_id: Option<&str>) -> RelyingPartyResolver {
        RelyingPartyResolver::new(WebAuthnSettings {
            rp_id: rp_id.map(str::to_string),
            allowed_origins: allowed.iter().map(|o| Url::parse(o).unwrap()).collect(),
            ..WebAuthnSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rp_id_derived_from_forwarded_host() {
        let rp = resolver(&[], None)
            .resolve(&ForwardedOrigin::new(
                Some("https"),
                Some("login.example.com:8080"),
            ))
            .unwrap();

        assert_eq!(rp.id, "login.example.com");
        assert_eq!(rp.origin.as_str(), "https://login.example.com:8080/");
        assert_eq!(rp.origins, vec![rp.origin.clone()]);
    }

    #[test]
    fn test_missing_proto_defaults_to_https() {
        let rp = resolver(&[], None)
            .resolve(&ForwardedOrigin::new(None, Some("auth.example.com")))
            .unwrap();
        assert_eq!(rp.origin.scheme(), "https");
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let resolver = resolver(&[], None);

        let err = resolver
            .resolve(&ForwardedOrigin::new(Some("ftp"), Some("example.com")))
            .unwrap_err();
        assert!(matches!(err, RelyingPartyError::Malformed(_)));

        let err = resolver
            .resolve(&ForwardedOrigin::new(Some("https"), Some("evil.com/path")))
            .unwrap_err();
        assert!(matches!(err, RelyingPartyError::Malformed(_)));

        let err = resolver
            .resolve(&ForwardedOrigin::new(Some("https"), Some("user@example.com")))
            .unwrap_err();
        assert!(matches!(err, RelyingPartyError::Malformed(_)));
    }

    #[test]
    fn test_missing_origin() {
        let err = resolver(&[], None)
            .resolve(&ForwardedOrigin::default())
            .unwrap_err();
        assert_eq!(err, RelyingPartyError::MissingOrigin);
    }

    #[test]
    fn test_configured_origin_used_without_headers() {
        let rp = resolver(&["https://login.example.com"], None)
            .resolve(&ForwardedOrigin::default())
            .unwrap();
        assert_eq!(rp.id, "login.example.com");
    }

    #[test]
    fn test_untrusted_origin_rejected() {
        let err = resolver(&["https://login.example.com:8080"], None)
            .resolve(&ForwardedOrigin::new(Some("http"), Some("example.com")))
            .unwrap_err();
        assert_eq!(
            err,
            RelyingPartyError::UntrustedOrigin("http://example.com".to_string())
        );
    }

    #[test]
    fn test_explicit_rp_id_must_cover_host() {
        let rp = resolver(&[], Some("example.com"))
            .resolve(&ForwardedOrigin::new(Some("https"), Some("login.example.com")))
            .unwrap();
        assert_eq!(rp.id, "example.com");

        let err = resolver(&[], Some("example.com"))
            .resolve(&ForwardedOrigin::new(Some("https"), Some("notexample.com")))
            .unwrap_err();
        assert!(matches!(err, RelyingPartyError::RpIdMismatch { .. }));
    }

    #[test]
    fn test_empty_display_name_rejected() {
        let err = RelyingPartyResolver::new(WebAuthnSettings {
            display_name: "  ".to_string(),
            ..WebAuthnSettings::default()
        })
        .unwrap_err();
        assert_eq!(err, RelyingPartyError::MissingDisplayName);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(UserVerification::parse("Required"), Some(UserVerification::Required));
        assert_eq!(UserVerification::parse("maybe"), None);
        assert_eq!(ConveyancePreference::parse("direct"), Some(ConveyancePreference::Direct));
    }
}
