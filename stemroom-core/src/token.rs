//! Compact HS256 session tokens.
//!
//! Format: `base64url(header) . base64url(payload) . base64url(hmac)` where
//! the MAC is HMAC-SHA256 over the ASCII bytes of `header.payload`.
//! Header is always `{"alg":"HS256","typ":"JWT"}`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::error::TrackError;
use crate::Identity;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_ALGORITHM: &str = "HS256";
pub const TOKEN_TYPE: &str = "JWT";
pub const DEFAULT_ISSUER: &str = "stemroom";
/// Lifetime of a token minted after a provider login.
pub const SESSION_TTL_SECS: u64 = 60 * 60 * 24 * 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("unsupported token header")]
    UnsupportedHeader,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

impl From<TokenError> for TrackError {
    fn from(e: TokenError) -> Self {
        TrackError::Unauthorized(e.to_string())
    }
}

/// Signing key for session tokens.
///
/// `Debug` never prints the key material.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSecret(Vec<u8>);

impl TokenSecret {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self(secret.as_ref().to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenSecret(<{} bytes>)", self.0.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

/// Claims carried in the token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Issued at, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Expiry, unix seconds. Tokens without one never expire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default)]
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Profile returned by the identity provider after the OAuth exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: u64,
    pub login: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl SessionClaims {
    pub fn new(sub: impl Into<String>, username: impl Into<String>, issued_at: u64, ttl_secs: u64) -> Self {
        Self {
            sub: sub.into(),
            username: username.into(),
            avatar: None,
            iat: Some(issued_at),
            exp: Some(issued_at.saturating_add(ttl_secs)),
            iss: DEFAULT_ISSUER.to_string(),
            provider: None,
        }
    }

    pub fn from_provider_profile(profile: &ProviderProfile, provider: &str, now: u64) -> Self {
        Self {
            sub: profile.id.to_string(),
            username: profile.login.clone(),
            avatar: profile.avatar_url.clone(),
            iat: Some(now),
            exp: Some(now.saturating_add(SESSION_TTL_SECS)),
            iss: DEFAULT_ISSUER.to_string(),
            provider: Some(provider.to_string()),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            subject_id: self.sub.clone(),
            username: self.username.clone(),
            avatar: self.avatar.clone(),
        }
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        matches!(self.exp, Some(exp) if now > exp)
    }
}

/// Issues and verifies session tokens with an injected secret.
#[derive(Debug, Clone)]
pub struct TokenCodec {
    secret: TokenSecret,
}

impl TokenCodec {
    pub fn new(secret: TokenSecret) -> Self {
        Self { secret }
    }

    pub fn issue(&self, claims: &SessionClaims) -> Result<String, TrackError> {
        let header = TokenHeader {
            alg: TOKEN_ALGORITHM.to_string(),
            typ: TOKEN_TYPE.to_string(),
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| TrackError::Internal(e.to_string()))?;
        let payload_json =
            serde_json::to_vec(claims).map_err(|e| TrackError::Internal(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(payload_json)
        );
        let signature = self.sign(signing_input.as_bytes())?;
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Verify against the current wall clock.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        self.verify_at(token, crate::unix_seconds())
    }

    /// Verify against an explicit `now` (unix seconds).
    pub fn verify_at(&self, token: &str, now: u64) -> Result<SessionClaims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::Malformed)?;
        let header: TokenHeader =
            serde_json::from_slice(&header_bytes).map_err(|_| TokenError::Malformed)?;
        if header.alg != TOKEN_ALGORITHM || header.typ != TOKEN_TYPE {
            return Err(TokenError::UnsupportedHeader);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| TokenError::BadSignature)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: SessionClaims =
            serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::Malformed)?;
        if claims.is_expired_at(now) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, TrackError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| TrackError::Internal(e.to_string()))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Extract the token from an `Authorization: Bearer …` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Where the browser lands after a successful provider login.
pub fn login_redirect(app_url: &str, token: &str) -> String {
    format!("{}/auth/callback?token={token}", app_url.trim_end_matches('/'))
}
