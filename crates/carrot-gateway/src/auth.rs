//! Handshake credentials: session token plus optional shared secret

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use carrot_core::SessionToken;
use tracing::warn;

/// What a peer presented when asking to upgrade
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Token of the session to resume, if any
    pub token: Option<SessionToken>,
    pub secret: String,
}

impl Credentials {
    /// Read credentials from the `Authorization: Basic` header, falling
    /// back to a `token` query parameter for clients that cannot set headers.
    pub fn from_request(headers: &HeaderMap, query_token: Option<&str>) -> Self {
        let basic = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic);

        match basic {
            Some((token, secret)) => Self {
                token: non_empty(&token).map(SessionToken::new),
                secret,
            },
            None => Self {
                token: query_token.and_then(non_empty).map(SessionToken::new),
                secret: String::new(),
            },
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s) }
}

/// Decode `Basic base64(user:password)` into its two halves.
pub fn parse_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.trim().strip_prefix("Basic ")?.trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Check a presented secret against the configured one.
///
/// Returns `true` when no secret is configured.
pub fn validate_secret(configured: &str, provided: &str) -> bool {
    if configured.is_empty() {
        return true;
    }
    if provided.is_empty() {
        warn!("gateway auth: no secret provided");
        return false;
    }
    constant_time_eq(configured.as_bytes(), provided.as_bytes())
}

/// Constant-time byte comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Mask a secret for Debug output. Shows the first 3 and last 4 chars of
/// anything longer than 7 chars.
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}
