//! Per-session credential state: consumed nonces, revocations and the pairing PIN.
//!
//! Owned by the session actor, so no locking is needed; everything here is
//! dropped with the session.

use crate::errors::ScError;
use crate::pairing::keys::random_bytes;
use common::jwt::{SyncClaims, TokenError};
use common::secret::SecretString;
use common::types::ParticipantId;
use ring::{hmac, rand};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Number of wrong guesses after which a PIN is burned.
pub const MAX_PIN_ATTEMPTS: u32 = 5;

/// PIN space: six decimal digits.
const PIN_SPACE: u32 = 1_000_000;

/// Consumed nonces and revoked participants of one session.
///
/// Grows monotonically for the lifetime of the session.
#[derive(Debug, Default)]
pub struct CredentialLedger {
    consumed_nonces: HashSet<String>,
    revoked_participants: HashSet<ParticipantId>,
}

impl CredentialLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check `claims` against the ledger without consuming anything.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Revoked` if the nonce was used or the participant revoked.
    pub fn check(&self, claims: &SyncClaims) -> Result<(), TokenError> {
        if self.revoked_participants.contains(&claims.sub)
            || self.consumed_nonces.contains(&claims.jti)
        {
            return Err(TokenError::Revoked);
        }
        Ok(())
    }

    /// Check `claims` and mark the nonce consumed.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Revoked` if the nonce was used or the participant revoked.
    pub fn consume(&mut self, claims: &SyncClaims) -> Result<(), TokenError> {
        self.check(claims)?;
        self.consumed_nonces.insert(claims.jti.clone());
        Ok(())
    }

    /// Permanently reject every token issued to `participant_id`.
    pub fn revoke_participant(&mut self, participant_id: ParticipantId) {
        self.revoked_participants.insert(participant_id);
    }

    #[must_use]
    pub fn is_revoked(&self, participant_id: &ParticipantId) -> bool {
        self.revoked_participants.contains(participant_id)
    }

    #[must_use]
    pub fn consumed_count(&self) -> usize {
        self.consumed_nonces.len()
    }
}

/// Why a PIN redemption failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRejection {
    /// Wrong digits, or no PIN outstanding.
    Mismatch,
    Expired,
    /// Already redeemed or burned by too many wrong guesses.
    Used,
}

impl From<PinRejection> for TokenError {
    fn from(rejection: PinRejection) -> Self {
        match rejection {
            PinRejection::Mismatch => TokenError::Invalid,
            PinRejection::Expired => TokenError::Expired,
            PinRejection::Used => TokenError::Revoked,
        }
    }
}

/// An outstanding six-digit pairing PIN.
///
/// Only an HMAC tag of the PIN is stored, under a random per-PIN key, and it is
/// checked with `hmac::verify` (constant time).
pub struct PairingPin {
    key: hmac::Key,
    tag: hmac::Tag,
    expires_at: Instant,
    attempts: u32,
    used: bool,
}

impl std::fmt::Debug for PairingPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingPin")
            .field("pin", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("attempts", &self.attempts)
            .field("used", &self.used)
            .finish()
    }
}

impl PairingPin {
    /// Draw a fresh PIN valid for `ttl` from `now`.
    ///
    /// Returns the PIN to show the host together with its stored form.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the OS random source fails.
    pub fn generate(
        rng: &dyn rand::SecureRandom,
        ttl: Duration,
        now: Instant,
    ) -> Result<(SecretString, Self), ScError> {
        let pin = format!("{:06}", uniform_pin(rng)?);
        let key_bytes = random_bytes::<32>(rng)?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, &key_bytes);
        let tag = hmac::sign(&key, pin.as_bytes());

        let stored = Self {
            key,
            tag,
            expires_at: now + ttl,
            attempts: 0,
            used: false,
        };
        Ok((SecretString::from(pin), stored))
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Redeem `candidate` at `now`. A successful redemption uses the PIN up.
    ///
    /// # Errors
    ///
    /// Returns the reason the PIN was refused.
    pub fn redeem(&mut self, candidate: &str, now: Instant) -> Result<(), PinRejection> {
        if self.used {
            return Err(PinRejection::Used);
        }
        if now >= self.expires_at {
            return Err(PinRejection::Expired);
        }

        if hmac::verify(&self.key, candidate.trim().as_bytes(), self.tag.as_ref()).is_ok() {
            self.used = true;
            return Ok(());
        }

        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= MAX_PIN_ATTEMPTS {
            tracing::warn!(
                target: "sc.pairing",
                attempts = self.attempts,
                "Pairing PIN burned after repeated wrong guesses"
            );
            self.used = true;
        }
        Err(PinRejection::Mismatch)
    }
}

/// Uniform draw from `0..PIN_SPACE` by rejection sampling.
fn uniform_pin(rng: &dyn rand::SecureRandom) -> Result<u32, ScError> {
    let limit = u32::MAX - (u32::MAX % PIN_SPACE);
    loop {
        let value = u32::from_be_bytes(random_bytes::<4>(rng)?);
        if value < limit {
            return Ok(value % PIN_SPACE);
        }
    }
}
