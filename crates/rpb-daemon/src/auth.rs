//! HTTP basic authentication and cross-cutting response headers.
//!
//! Every route sits behind a single shared secret. The presented password
//! is hashed and compared against the configured secret's digest in
//! constant time; a rejected attempt is persisted to the access log with
//! whatever origin information the fronting proxy supplied. The
//! authenticated username doubles as the press origin.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rpb_core::now_utc_ms;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{error, warn};

use crate::db::AccessAttempt;
use crate::http::AppState;

/// Press origin extracted from the authenticated username.
#[derive(Debug, Clone)]
pub struct Origin(pub String);

/// SHA-256 digest of the configured secret, computed once at startup so
/// request handling never touches the secret itself.
#[must_use]
pub fn secret_digest(secret: &SecretString) -> [u8; 32] {
    Sha256::digest(secret.expose_secret().as_bytes()).into()
}

/// Reject requests that don't carry the shared secret.
///
/// On success the username is attached to the request as [`Origin`] and the
/// response gains a `Press-Timeout` header advertising the configured
/// maximum hold. On failure the attempt is recorded and the client gets a
/// 401 with a `WWW-Authenticate` challenge.
pub async fn require_basic_auth(
    State(app): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some((username, password)) = parse_basic_auth(&req) {
        let presented: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        if bool::from(presented.ct_eq(&app.secret_digest)) {
            let origin = if username.is_empty() {
                "unknown".to_string()
            } else {
                username
            };
            req.extensions_mut().insert(Origin(origin));

            let mut response = next.run(req).await;
            if let Ok(value) = HeaderValue::from_str(&format!("{:.2}", app.max_hold.as_secs_f64()))
            {
                response.headers_mut().insert("Press-Timeout", value);
            }
            return response;
        }
        record_rejection(&app, &req, username);
    }

    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"restricted\", charset=\"UTF-8\""),
    );
    response
}

/// Attach a permissive CORS header to every response.
pub async fn allow_cors(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn parse_basic_auth(req: &Request) -> Option<(String, String)> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

fn record_rejection(app: &AppState, req: &Request, username: String) {
    let ip = proxy_header(req, "Cf-Connecting-Ip")
        .or_else(|| proxy_header(req, "X-Forwarded-For"))
        .unwrap_or_else(|| "unknown".to_string());
    let country = proxy_header(req, "Cf-Ipcountry").unwrap_or_else(|| "unknown".to_string());
    warn!(%ip, %country, "rejected access attempt");

    let attempt = AccessAttempt {
        timestamp: now_utc_ms(),
        ip,
        country,
        username,
    };
    if let Err(err) = app.store.record_access_attempt(&attempt) {
        error!(%err, "failed to record access attempt");
    }
}

fn proxy_header(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_only_the_exact_secret() {
        let secret = SecretString::from("hunter2".to_string());
        let digest = secret_digest(&secret);

        let good: [u8; 32] = Sha256::digest(b"hunter2").into();
        let bad: [u8; 32] = Sha256::digest(b"hunter3").into();
        assert!(bool::from(good.ct_eq(&digest)));
        assert!(!bool::from(bad.ct_eq(&digest)));
    }

    #[test]
    fn basic_header_parses_username_and_password() {
        let encoded = STANDARD.encode("alice:hunter2");
        let req = Request::builder()
            .header(header::AUTHORIZATION, format!("Basic {encoded}"))
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(
            parse_basic_auth(&req),
            Some(("alice".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let req = Request::builder()
            .header(header::AUTHORIZATION, "Bearer whatever")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(parse_basic_auth(&req), None);

        let req = Request::builder()
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(parse_basic_auth(&req), None);
    }
}
