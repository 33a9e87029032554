//! Unverified decoding of access-credential claims.
//!
//! The credential arrives from the identity service over a trusted channel,
//! so the client never checks its signature. Decoding only serves the UX
//! side (role-gated views); authorization is enforced server-side.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::types::Role;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ClaimsError {
    #[error("expected 3 dot-separated segments, got {0}")]
    Segments(usize),
    #[error("payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not a claims object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Claims read from the credential payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct Claims {
    pub subject: Option<String>,
    pub roles: Vec<Role>,
    pub expires_at: Option<OffsetDateTime>,
}

impl Claims {
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.as_str() == role)
    }

    /// Whether the `exp` claim lies in the past. Tokens without `exp` never expire here.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(Deserialize)]
struct ClaimsRepr {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    roles: Option<RolesRepr>,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RolesRepr {
    Many(Vec<String>),
    Single(String),
}

impl From<ClaimsRepr> for Claims {
    fn from(repr: ClaimsRepr) -> Self {
        let roles = match repr.roles {
            Some(RolesRepr::Many(items)) => items.into_iter().map(Role).collect(),
            Some(RolesRepr::Single(item)) => vec![Role(item)],
            None => Vec::new(),
        };
        Self {
            subject: repr.sub,
            roles,
            expires_at: repr
                .exp
                .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok()),
        }
    }
}

/// Decodes the payload segment of a JWT-shaped credential.
pub(crate) fn decode(token: &str) -> Result<Claims, ClaimsError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(ClaimsError::Segments(parts.len()));
    }
    let payload = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('='))?;
    let repr: ClaimsRepr = serde_json::from_slice(&payload)?;
    Ok(repr.into())
}

/// Decodes claims, degrading to empty claims on any structural error.
///
/// An undecodable credential still counts as present but grants no roles.
#[must_use]
pub fn decode_lenient(token: &str) -> Claims {
    decode(token).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "credential claims undecodable; treating as role-less");
        Claims::default()
    })
}

/// Role set of `token`, or empty if the token is malformed.
#[must_use]
pub fn decode_roles(token: &str) -> Vec<Role> {
    decode_lenient(token).roles
}

/// Builds an unsigned JWT-shaped token around `claims` for tests.
#[cfg(test)]
pub(crate) fn unsigned_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
