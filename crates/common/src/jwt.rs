//! Sync token claims and pre-verification helpers.
//!
//! Session tokens are HS256 JWTs signed with a per-session key. This module holds
//! the parts that both the server and clients need:
//!
//! - The claim set (`SyncClaims`)
//! - Size limits checked before any parsing
//! - Unverified extraction of the session id, used only to route a token to the
//!   session that owns its signing key
//! - The token error taxonomy
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - `peek_session_id` performs NO signature verification; its result must never be
//!   trusted beyond choosing which key to verify with
//! - Error messages are generic; details are logged at debug level
//! - The nonce (`jti`) is redacted in Debug output

use crate::types::{ParticipantId, Role, SessionId};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum allowed size for a sync token in bytes.
///
/// Claims are small and fixed; anything larger is rejected before base64 or JSON
/// decoding is attempted.
pub const MAX_TOKEN_SIZE_BYTES: usize = 4096;

/// Token validation failures.
///
/// `Invalid` is terminal: a token that failed signature verification is never
/// re-submitted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Malformed, oversized, tampered, or signed for another session.
    #[error("Token invalid")]
    Invalid,

    /// `exp` is in the past.
    #[error("Token expired")]
    Expired,

    /// Nonce already consumed, or the participant was revoked.
    #[error("Token revoked")]
    Revoked,
}

impl TokenError {
    /// Returns a bounded label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TokenError::Invalid => "invalid",
            TokenError::Expired => "expired",
            TokenError::Revoked => "revoked",
        }
    }
}

/// Claim set carried by every session token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncClaims {
    /// Session this token is valid for.
    pub sid: SessionId,
    /// Participant the token was issued to.
    pub sub: ParticipantId,
    /// Role at issue time. The session decides the effective role on attach.
    pub role: Role,
    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,
    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,
    /// Single-use nonce (hex).
    pub jti: String,
    /// Display name chosen when the credential was redeemed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl fmt::Debug for SyncClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClaims")
            .field("sid", &self.sid)
            .field("sub", &self.sub)
            .field("role", &self.role)
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("jti", &"[REDACTED]")
            .field("name", &self.name)
            .finish()
    }
}

impl SyncClaims {
    /// Whether the token is expired at `now` (Unix seconds).
    ///
    /// A token expiring exactly at `now` is expired.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp <= now
    }
}

/// Extract the `sid` claim from a token WITHOUT verifying it.
///
/// Used to find the session whose key must verify the token.
///
/// # Errors
///
/// Returns `TokenError::Invalid` if the token is oversized, not a three-part JWT,
/// or its payload does not carry a well-formed `sid`.
pub fn peek_session_id(token: &str) -> Result<SessionId, TokenError> {
    if token.len() > MAX_TOKEN_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_TOKEN_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(TokenError::Invalid);
    }

    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
        return Err(TokenError::Invalid);
    };

    let payload_bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to decode token payload base64");
        TokenError::Invalid
    })?;

    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes).map_err(|e| {
        tracing::debug!(target: "common.jwt", error = %e, "Failed to parse token payload JSON");
        TokenError::Invalid
    })?;

    payload
        .get("sid")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or(TokenError::Invalid)
}
