//! Browser session extractor
//!
//! [`CeremonyRequest`] resolves the caller's session from the `aegis_session`
//! cookie, reads the origin and client address headers and hands the
//! orchestrator a [`CeremonyContext`] bound to them. Responses pass back
//! through [`CeremonyRequest::respond`] so a new or regenerated session
//! identifier reaches the browser.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use aegis_core::{CeremonyContext, ForwardedOrigin, SessionHandle, UserSessionStore};
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::header::{COOKIE, HOST, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::state::AppState;

/// Name of the session cookie
pub const SESSION_COOKIE_NAME: &str = "aegis_session";

/// Per-request ceremony inputs.
pub struct CeremonyRequest {
    handle: SessionHandle,
    origin: ForwardedOrigin,
    remote_ip: IpAddr,
    cookie_secure: bool,
}

impl FromRequestParts<AppState> for CeremonyRequest {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookie = extract_session_cookie(&parts.headers);
        let handle = state.sessions.open(cookie.as_deref());

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(Self {
            handle,
            origin: forwarded_origin(&parts.headers),
            remote_ip: client_ip(&parts.headers, peer),
            cookie_secure: state.cookie_secure,
        })
    }
}

impl CeremonyRequest {
    /// Context handed to the orchestrator; both session views are the
    /// caller's session.
    pub fn context(&self) -> CeremonyContext<'_> {
        CeremonyContext::new(
            self.origin.clone(),
            self.remote_ip,
            &self.handle,
            &self.handle,
        )
    }

    pub fn session_id(&self) -> String {
        self.handle.id()
    }

    /// Finish the response, attaching a session cookie when the session
    /// identifier is new to the browser.
    pub async fn respond(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if !self.handle.cookie_required() {
            return response;
        }

        // A failed load only costs the persistent cookie
        let max_age = match self.handle.load().await {
            Ok(session) => session
                .remember_me_until
                .map(|until| (until - Utc::now()).num_seconds().max(0)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load session for cookie");
                None
            }
        };

        match session_cookie(&self.handle.id(), max_age, self.cookie_secure) {
            Ok(cookie) => {
                response.headers_mut().append(SET_COOKIE, cookie);
            }
            Err(e) => tracing::error!(error = %e, "Failed to build session cookie"),
        }
        response
    }
}

/// Build an `HttpOnly` session cookie. Without `max_age` it lives as long as
/// the browser session.
pub fn session_cookie(
    id: &str,
    max_age: Option<i64>,
    secure: bool,
) -> Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}={id}; Path=/; HttpOnly; SameSite=Lax");
    if let Some(max_age) = max_age {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// Session identifier presented in the `Cookie` header, if any.
pub fn extract_session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == SESSION_COOKIE_NAME)
                .then(|| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}

/// Origin headers as seen behind the reverse proxy.
pub fn forwarded_origin(headers: &HeaderMap) -> ForwardedOrigin {
    let proto = header_str(headers, "x-forwarded-proto");
    let host = header_str(headers, "x-forwarded-host").or_else(|| header_str(headers, HOST.as_str()));
    ForwardedOrigin::new(proto, host)
}

/// Client address: first `X-Forwarded-For` hop, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> IpAddr {
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
        .or(peer)
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_extract_session_cookie() {
        let map = headers(&[("cookie", "theme=dark; aegis_session=abc123; lang=en")]);
        assert_eq!(extract_session_cookie(&map).as_deref(), Some("abc123"));

        let map = headers(&[("cookie", "theme=dark"), ("cookie", "aegis_session=xyz")]);
        assert_eq!(extract_session_cookie(&map).as_deref(), Some("xyz"));

        assert!(extract_session_cookie(&headers(&[("cookie", "aegis_session=")])).is_none());
        assert!(extract_session_cookie(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("abc", None, false).unwrap();
        assert_eq!(
            cookie.to_str().unwrap(),
            "aegis_session=abc; Path=/; HttpOnly; SameSite=Lax"
        );

        let cookie = session_cookie("abc", Some(3600), true).unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.contains("Max-Age=3600"));
        assert!(value.ends_with("; Secure"));
    }

    #[test]
    fn test_forwarded_origin_prefers_forwarded_host() {
        let map = headers(&[
            ("x-forwarded-proto", "https"),
            ("x-forwarded-host", "login.example.com"),
            ("host", "internal:3000"),
        ]);
        assert_eq!(
            forwarded_origin(&map),
            ForwardedOrigin::new(Some("https"), Some("login.example.com"))
        );

        let map = headers(&[("host", "example.com")]);
        assert_eq!(
            forwarded_origin(&map),
            ForwardedOrigin::new(None, Some("example.com"))
        );
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let peer = Some("10.0.0.1".parse().unwrap());
        let map = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.2")]);
        assert_eq!(client_ip(&map, peer).to_string(), "203.0.113.7");

        let map = headers(&[("x-forwarded-for", "not-an-ip")]);
        assert_eq!(client_ip(&map, peer).to_string(), "10.0.0.1");

        assert_eq!(client_ip(&HeaderMap::new(), None).to_string(), "0.0.0.0");
    }
}
