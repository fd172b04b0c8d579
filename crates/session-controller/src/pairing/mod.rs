//! Pairing: token issuance and validation, join descriptors, pairing PINs.
//!
//! The [`PairingAuthority`] is process-wide and stateless apart from the master
//! secret. It signs and verifies tokens (size, signature, session binding,
//! expiry) and seals/opens join descriptors. The stateful half of validation,
//! single-use nonces and revocations, lives in each session actor's
//! [`ledger::CredentialLedger`] and is dropped when the session closes.
//!
//! # Error precedence
//!
//! `TokenInvalid` (malformed, oversized, bad signature, wrong session) is checked
//! first, then `TokenExpired`, then `TokenRevoked` (in the session).

pub mod descriptor;
pub mod keys;
pub mod ledger;

use crate::config::{Config, MIN_MASTER_SECRET_LENGTH};
use crate::errors::ScError;
use crate::observability::metrics;
use common::jwt::{peek_session_id, SyncClaims, TokenError, MAX_TOKEN_SIZE_BYTES};
use common::secret::{ExposeSecret, SecretBox};
use common::types::{ParticipantId, Role, SessionId};
use descriptor::DescriptorBundle;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use ring::rand::SystemRandom;
use serde::Serialize;
use std::time::Duration;

/// A freshly issued token and the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: SyncClaims,
}

/// A rendered join descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct JoinDescriptor {
    /// base64url payload.
    pub descriptor: String,
    /// `flowsync://join?d=...`, also the content of a scannable code.
    pub uri: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl JoinDescriptor {
    /// Render [`JoinDescriptor::uri`] as a scannable SVG code.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Encoding` if the URI does not fit in a code.
    pub fn qr_svg(&self) -> Result<String, ScError> {
        use qrcode::{render::svg, QrCode};

        let code = QrCode::new(self.uri.as_bytes())
            .map_err(|e| ScError::Encoding(format!("QR generation failed: {e}")))?;
        Ok(code
            .render::<svg::Color<'_>>()
            .min_dimensions(256, 256)
            .dark_color(svg::Color("#000000"))
            .light_color(svg::Color("#FFFFFF"))
            .build())
    }
}

/// Process-wide signer and verifier of session credentials.
pub struct PairingAuthority {
    master_secret: SecretBox<Vec<u8>>,
    descriptor_key: SecretBox<Vec<u8>>,
    rng: SystemRandom,
    token_ttl: Duration,
    descriptor_ttl: Duration,
}

impl std::fmt::Debug for PairingAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingAuthority")
            .field("master_secret", &"[REDACTED]")
            .field("token_ttl", &self.token_ttl)
            .field("descriptor_ttl", &self.descriptor_ttl)
            .finish_non_exhaustive()
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

impl PairingAuthority {
    /// Create an authority from decoded master secret bytes.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Config` if the secret is shorter than 32 bytes, or
    /// `ScError::Internal` if key derivation fails.
    pub fn new(
        master_secret: SecretBox<Vec<u8>>,
        token_ttl: Duration,
        descriptor_ttl: Duration,
    ) -> Result<Self, ScError> {
        if master_secret.expose_secret().len() < MIN_MASTER_SECRET_LENGTH {
            return Err(ScError::Config(format!(
                "master secret must be at least {MIN_MASTER_SECRET_LENGTH} bytes"
            )));
        }
        let descriptor_key = keys::derive_descriptor_key(master_secret.expose_secret())?;

        Ok(Self {
            master_secret,
            descriptor_key,
            rng: SystemRandom::new(),
            token_ttl,
            descriptor_ttl,
        })
    }

    /// Create an authority from service configuration.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Config` if the master secret is invalid.
    pub fn from_config(config: &Config) -> Result<Self, ScError> {
        let master_secret = config
            .master_secret_bytes()
            .map_err(|e| ScError::Config(e.to_string()))?;
        Self::new(
            master_secret,
            Duration::from_secs(config.token_ttl_seconds),
            Duration::from_secs(config.descriptor_ttl_seconds),
        )
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    #[must_use]
    pub fn rng(&self) -> &SystemRandom {
        &self.rng
    }

    fn session_key(&self, session_id: &SessionId) -> Result<SecretBox<Vec<u8>>, ScError> {
        keys::derive_session_key(self.master_secret.expose_secret(), session_id)
    }

    /// Sign a token for `participant_id` in `session_id`, valid for `ttl`.
    ///
    /// Whether the session may still issue tokens is the session's decision;
    /// see `SessionHandle::issue_token`.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Internal` if key derivation, randomness or signing fails.
    pub fn issue_token(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        role: Role,
        ttl: Duration,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        let now = now_secs();
        self.issue_token_expiring(
            session_id,
            participant_id,
            role,
            now,
            now.saturating_add(ttl_secs(ttl)),
            display_name,
        )
    }

    fn issue_token_expiring(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        role: Role,
        issued_at: i64,
        expires_at: i64,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        let claims = SyncClaims {
            sid: session_id,
            sub: participant_id,
            role,
            exp: expires_at,
            iat: issued_at,
            jti: keys::random_nonce_hex(&self.rng)?,
            name: display_name,
        };

        let key = self.session_key(&session_id)?;
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(key.expose_secret()),
        )
        .map_err(|e| ScError::Internal(format!("token signing failed: {e}")))?;

        Ok(IssuedToken { token, claims })
    }

    /// Stateless token checks: size, signature under the session key, expiry.
    ///
    /// Nonce and revocation checks happen in the owning session.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Invalid` or `TokenError::Expired`.
    pub fn verify(&self, token: &str) -> Result<SyncClaims, TokenError> {
        self.verify_at(token, now_secs())
    }

    /// [`PairingAuthority::verify`] against an explicit clock (Unix seconds).
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Invalid` or `TokenError::Expired`.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<SyncClaims, TokenError> {
        let result = self.verify_inner(token, now);
        if let Err(e) = &result {
            metrics::record_token_validation(e.as_str());
        }
        result
    }

    fn verify_inner(&self, token: &str, now: i64) -> Result<SyncClaims, TokenError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            return Err(TokenError::Invalid);
        }
        let session_id = peek_session_id(token)?;
        let key = self.session_key(&session_id).map_err(|e| {
            tracing::error!(target: "sc.pairing", error = %e, "Session key derivation failed");
            TokenError::Invalid
        })?;

        // Expiry is checked after the signature so that precedence holds
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;

        let claims = decode::<SyncClaims>(
            token,
            &DecodingKey::from_secret(key.expose_secret()),
            &validation,
        )
        .map_err(|e| {
            tracing::debug!(target: "sc.pairing", error = %e, "Token signature verification failed");
            TokenError::Invalid
        })?
        .claims;

        if claims.sid != session_id {
            return Err(TokenError::Invalid);
        }
        if claims.is_expired_at(now) {
            tracing::debug!(
                target: "sc.pairing",
                session_id = %claims.sid,
                participant_id = %claims.sub,
                "Token expired"
            );
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Seal a join descriptor for `session_id`.
    ///
    /// The caller checks the session still exists.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Encoding` if the bundle cannot be sealed.
    pub fn create_join_descriptor(
        &self,
        session_id: SessionId,
        host_address_hints: Vec<String>,
    ) -> Result<JoinDescriptor, ScError> {
        let issued_at = now_secs();
        let expiry = issued_at.saturating_add(ttl_secs(self.descriptor_ttl));
        let session_key = self.session_key(&session_id)?;

        let bundle = DescriptorBundle {
            session_id,
            secret: descriptor::join_secret(session_key.expose_secret(), expiry),
            host_address_hints,
            issued_at,
            expiry,
        };

        let nonce = keys::random_bytes(&self.rng)?;
        let payload = descriptor::seal(self.descriptor_key.expose_secret(), nonce, &bundle)?;

        tracing::info!(
            target: "sc.pairing",
            session_id = %session_id,
            expires_at = expiry,
            "Join descriptor created"
        );

        Ok(JoinDescriptor {
            uri: descriptor::to_uri(&payload),
            descriptor: payload,
            expires_at: expiry,
        })
    }

    /// Decrypt a descriptor (URI or bare payload).
    ///
    /// # Errors
    ///
    /// Returns `ScError::Encoding` if it cannot be opened.
    pub fn open_descriptor(&self, descriptor: &str) -> Result<DescriptorBundle, ScError> {
        descriptor::open(self.descriptor_key.expose_secret(), descriptor)
    }

    /// Turn a join descriptor into a follower token.
    ///
    /// The token expires with the descriptor and passes through the same
    /// stateless checks as any other token, so an expired descriptor fails with
    /// `TokenExpired` before any session is consulted.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Encoding` for an undecryptable descriptor,
    /// `ScError::Token(Invalid)` for a bad join secret and
    /// `ScError::Token(Expired)` for an expired descriptor.
    pub fn redeem_descriptor(
        &self,
        descriptor: &str,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        let bundle = self.open_descriptor(descriptor)?;
        let session_key = self.session_key(&bundle.session_id)?;

        if !descriptor::verify_join_secret(session_key.expose_secret(), &bundle) {
            tracing::debug!(
                target: "sc.pairing",
                session_id = %bundle.session_id,
                "Join secret verification failed"
            );
            return Err(ScError::Token(TokenError::Invalid));
        }

        let issued = self.issue_token_expiring(
            bundle.session_id,
            ParticipantId::new(),
            Role::Follower,
            now_secs(),
            bundle.expiry,
            display_name,
        )?;
        let claims = self.verify(&issued.token)?;

        Ok(IssuedToken {
            token: issued.token,
            claims,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn authority() -> PairingAuthority {
        PairingAuthority::new(
            SecretBox::new(Box::new(vec![0x42; 32])),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_short_master_secret() {
        let result = PairingAuthority::new(
            SecretBox::new(Box::new(vec![0x42; 16])),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );
        assert!(matches!(result, Err(ScError::Config(_))));
    }

    #[test]
    fn test_issue_then_verify() {
        let auth = authority();
        let sid = SessionId::new();
        let pid = ParticipantId::new();

        let issued = auth
            .issue_token(sid, pid, Role::Host, Duration::from_secs(60), Some("Ana".to_string()))
            .unwrap();
        let claims = auth.verify(&issued.token).unwrap();

        assert_eq!(claims, issued.claims);
        assert_eq!(claims.sid, sid);
        assert_eq!(claims.sub, pid);
        assert_eq!(claims.role, Role::Host);
        assert_eq!(claims.name.as_deref(), Some("Ana"));
        assert_eq!(claims.jti.len(), 32);
    }

    #[test]
    fn test_each_token_gets_a_fresh_nonce() {
        let auth = authority();
        let sid = SessionId::new();
        let pid = ParticipantId::new();
        let a = auth.issue_token(sid, pid, Role::Follower, Duration::from_secs(60), None).unwrap();
        let b = auth.issue_token(sid, pid, Role::Follower, Duration::from_secs(60), None).unwrap();
        assert_ne!(a.claims.jti, b.claims.jti);
    }

    #[test]
    fn test_past_expiry_fails_with_expired() {
        let auth = authority();
        let issued = auth
            .issue_token(SessionId::new(), ParticipantId::new(), Role::Follower, Duration::from_secs(60), None)
            .unwrap();

        assert_eq!(
            auth.verify_at(&issued.token, issued.claims.exp),
            Err(TokenError::Expired)
        );
        assert!(auth.verify_at(&issued.token, issued.claims.exp - 1).is_ok());
    }

    #[test]
    fn test_token_from_other_master_secret_is_invalid() {
        let other = PairingAuthority::new(
            SecretBox::new(Box::new(vec![0x43; 32])),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
        .unwrap();
        let issued = other
            .issue_token(SessionId::new(), ParticipantId::new(), Role::Host, Duration::from_secs(60), None)
            .unwrap();

        assert_eq!(authority().verify(&issued.token), Err(TokenError::Invalid));
    }

    #[test]
    fn test_resigned_for_other_session_is_invalid() {
        let auth = authority();
        let session_a = SessionId::new();
        let issued = auth
            .issue_token(session_a, ParticipantId::new(), Role::Host, Duration::from_secs(60), None)
            .unwrap();

        // Swap the payload's sid for another session, keep A's signature
        let mut parts = issued.token.split('.');
        let header = parts.next().unwrap();
        let signature = parts.nth(1).unwrap();
        let mut claims = issued.claims.clone();
        claims.sid = SessionId::new();
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let forged = format!("{header}.{payload}.{signature}");

        assert_eq!(auth.verify(&forged), Err(TokenError::Invalid));
    }

    #[test]
    fn test_expired_and_tampered_is_invalid_not_expired() {
        let auth = authority();
        let issued = auth
            .issue_token(SessionId::new(), ParticipantId::new(), Role::Host, Duration::from_secs(60), None)
            .unwrap();
        let tampered = format!("{}x", issued.token);

        assert_eq!(
            auth.verify_at(&tampered, issued.claims.exp + 10),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn test_oversized_token_is_invalid() {
        let auth = authority();
        let token = "a".repeat(MAX_TOKEN_SIZE_BYTES + 1);
        assert_eq!(auth.verify(&token), Err(TokenError::Invalid));
    }

    #[test]
    fn test_descriptor_redeems_to_follower_token() {
        let auth = authority();
        let sid = SessionId::new();
        let descriptor = auth
            .create_join_descriptor(sid, vec!["10.0.0.5:7420".to_string()])
            .unwrap();

        assert!(descriptor.uri.starts_with("flowsync://join?d="));

        let bundle = auth.open_descriptor(&descriptor.uri).unwrap();
        assert_eq!(bundle.session_id, sid);
        assert_eq!(bundle.host_address_hints, vec!["10.0.0.5:7420".to_string()]);
        assert_eq!(bundle.expiry, descriptor.expires_at);

        let issued = auth
            .redeem_descriptor(&descriptor.descriptor, Some("Bo".to_string()))
            .unwrap();
        assert_eq!(issued.claims.sid, sid);
        assert_eq!(issued.claims.role, Role::Follower);
        assert_eq!(issued.claims.exp, descriptor.expires_at);
        assert_eq!(issued.claims.name.as_deref(), Some("Bo"));
    }

    #[test]
    fn test_descriptor_renders_as_svg_code() {
        let auth = authority();
        let descriptor = auth
            .create_join_descriptor(SessionId::new(), vec!["10.0.0.5:7420".to_string()])
            .unwrap();

        let svg = descriptor.qr_svg().unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("#000000"));
    }

    #[test]
    fn test_oversized_uri_cannot_be_rendered() {
        let descriptor = JoinDescriptor {
            descriptor: String::new(),
            uri: format!("flowsync://join?d={}", "x".repeat(8_000)),
            expires_at: 0,
        };
        assert!(matches!(descriptor.qr_svg(), Err(ScError::Encoding(_))));
    }

    #[test]
    fn test_expired_descriptor_fails_with_token_expired() {
        let auth = PairingAuthority::new(
            SecretBox::new(Box::new(vec![0x42; 32])),
            Duration::from_secs(3600),
            Duration::ZERO,
        )
        .unwrap();
        let descriptor = auth
            .create_join_descriptor(SessionId::new(), Vec::new())
            .unwrap();

        let result = auth.redeem_descriptor(&descriptor.uri, None);
        assert!(matches!(result, Err(ScError::Token(TokenError::Expired))));
    }

    #[test]
    fn test_descriptor_from_other_authority_is_rejected() {
        let other = PairingAuthority::new(
            SecretBox::new(Box::new(vec![0x43; 32])),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
        .unwrap();
        let descriptor = other
            .create_join_descriptor(SessionId::new(), Vec::new())
            .unwrap();

        assert!(matches!(
            authority().redeem_descriptor(&descriptor.uri, None),
            Err(ScError::Encoding(_))
        ));
    }

    #[test]
    fn test_debug_redacts_master_secret() {
        let debug = format!("{:?}", authority());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("66, 66"));
    }
}
