//! Join descriptors: sealed credential bundles shared as a link or scannable code.
//!
//! ```text
//! bundle  = JSON {session_id, secret, host_address_hints, issued_at, expiry}
//! sealed  = AES-256-GCM(descriptor_key, nonce, bundle, aad = "flowsync-join")
//! payload = base64url(nonce || sealed)
//! uri     = "flowsync://join?d=" payload
//! ```
//!
//! `secret` is `HMAC-SHA256(session_key, "join" || expiry_be)`, so a bundle is
//! bound to its session and to its own expiry. Changing either invalidates it.

use crate::errors::ScError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use common::types::SessionId;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::fmt;

/// URI prefix of a rendered descriptor.
pub const DESCRIPTOR_URI_PREFIX: &str = "flowsync://join?d=";

/// Largest accepted descriptor payload (base64 characters).
pub const MAX_DESCRIPTOR_SIZE: usize = 4096;

const DESCRIPTOR_AAD: &[u8] = b"flowsync-join";
const JOIN_SECRET_LABEL: &[u8] = b"join";

/// Decrypted contents of a join descriptor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorBundle {
    pub session_id: SessionId,
    /// Hex HMAC binding the bundle to its session and expiry.
    pub secret: String,
    /// `host:port` addresses of the session server.
    pub host_address_hints: Vec<String>,
    /// Unix seconds.
    pub issued_at: i64,
    /// Unix seconds.
    pub expiry: i64,
}

impl fmt::Debug for DescriptorBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorBundle")
            .field("session_id", &self.session_id)
            .field("secret", &"[REDACTED]")
            .field("host_address_hints", &self.host_address_hints)
            .field("issued_at", &self.issued_at)
            .field("expiry", &self.expiry)
            .finish()
    }
}

fn join_secret_message(expiry: i64) -> Vec<u8> {
    let mut message = JOIN_SECRET_LABEL.to_vec();
    message.extend_from_slice(&expiry.to_be_bytes());
    message
}

/// Compute the join secret for a descriptor expiring at `expiry`.
#[must_use]
pub fn join_secret(session_key: &[u8], expiry: i64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, session_key);
    hex::encode(hmac::sign(&key, &join_secret_message(expiry)).as_ref())
}

/// Check a bundle's join secret in constant time.
#[must_use]
pub fn verify_join_secret(session_key: &[u8], bundle: &DescriptorBundle) -> bool {
    let Ok(provided) = hex::decode(&bundle.secret) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, session_key);
    hmac::verify(&key, &join_secret_message(bundle.expiry), &provided).is_ok()
}

fn sealing_key(descriptor_key: &[u8]) -> Result<LessSafeKey, ScError> {
    let unbound = UnboundKey::new(&AES_256_GCM, descriptor_key)
        .map_err(|_| ScError::Internal("invalid descriptor key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seal a bundle into a base64url payload.
///
/// # Errors
///
/// Returns `ScError::Encoding` if the bundle cannot be serialized or sealed.
pub fn seal(
    descriptor_key: &[u8],
    nonce: [u8; NONCE_LEN],
    bundle: &DescriptorBundle,
) -> Result<String, ScError> {
    let key = sealing_key(descriptor_key)?;
    let mut in_out = serde_json::to_vec(bundle)
        .map_err(|e| ScError::Encoding(format!("bundle serialization failed: {e}")))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::from(DESCRIPTOR_AAD),
        &mut in_out,
    )
    .map_err(|_| ScError::Encoding("descriptor sealing failed".to_string()))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + in_out.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&in_out);
    Ok(URL_SAFE_NO_PAD.encode(payload))
}

/// Open a descriptor given either as a `flowsync://` URI or a bare payload.
///
/// # Errors
///
/// Returns `ScError::Encoding` if the descriptor is oversized, not base64url,
/// tampered with, or sealed under another key.
pub fn open(descriptor_key: &[u8], descriptor: &str) -> Result<DescriptorBundle, ScError> {
    let trimmed = descriptor.trim();
    let payload = trimmed
        .strip_prefix(DESCRIPTOR_URI_PREFIX)
        .unwrap_or(trimmed);

    if payload.len() > MAX_DESCRIPTOR_SIZE {
        return Err(ScError::Encoding("descriptor too large".to_string()));
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ScError::Encoding(format!("descriptor base64 decode failed: {e}")))?;

    let Some((nonce, sealed)) = bytes.split_first_chunk::<NONCE_LEN>() else {
        return Err(ScError::Encoding("descriptor truncated".to_string()));
    };

    let key = sealing_key(descriptor_key)?;
    let mut in_out = sealed.to_vec();
    let plaintext = key
        .open_in_place(
            Nonce::assume_unique_for_key(*nonce),
            Aad::from(DESCRIPTOR_AAD),
            &mut in_out,
        )
        .map_err(|_| ScError::Encoding("descriptor authentication failed".to_string()))?;

    serde_json::from_slice(plaintext)
        .map_err(|e| ScError::Encoding(format!("descriptor bundle malformed: {e}")))
}

/// Render a payload as a shareable URI.
#[must_use]
pub fn to_uri(payload: &str) -> String {
    format!("{DESCRIPTOR_URI_PREFIX}{payload}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const DESCRIPTOR_KEY: [u8; 32] = [3u8; 32];
    const SESSION_KEY: [u8; 32] = [9u8; 32];

    fn bundle(expiry: i64) -> DescriptorBundle {
        DescriptorBundle {
            session_id: SessionId::new(),
            secret: join_secret(&SESSION_KEY, expiry),
            host_address_hints: vec!["192.168.1.20:7420".to_string()],
            issued_at: expiry - 300,
            expiry,
        }
    }

    #[test]
    fn test_seal_then_open_via_uri_and_payload() {
        let original = bundle(2_000_000_000);
        let payload = seal(&DESCRIPTOR_KEY, [1u8; NONCE_LEN], &original).unwrap();

        assert_eq!(open(&DESCRIPTOR_KEY, &payload).unwrap(), original);
        assert_eq!(open(&DESCRIPTOR_KEY, &to_uri(&payload)).unwrap(), original);
    }

    #[test]
    fn test_payload_does_not_leak_bundle_fields() {
        let original = bundle(2_000_000_000);
        let payload = seal(&DESCRIPTOR_KEY, [1u8; NONCE_LEN], &original).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(&payload).unwrap();
        let raw = String::from_utf8_lossy(&raw);
        assert!(!raw.contains("192.168"));
        assert!(!raw.contains(&original.session_id.to_string()));
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let payload = seal(&DESCRIPTOR_KEY, [1u8; NONCE_LEN], &bundle(2_000_000_000)).unwrap();
        assert!(matches!(
            open(&[4u8; 32], &payload),
            Err(ScError::Encoding(_))
        ));
    }

    #[test]
    fn test_open_rejects_tampered_payload() {
        let payload = seal(&DESCRIPTOR_KEY, [1u8; NONCE_LEN], &bundle(2_000_000_000)).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&payload).unwrap();
        if let Some(last) = raw.last_mut() {
            *last ^= 0x01;
        }
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(matches!(
            open(&DESCRIPTOR_KEY, &tampered),
            Err(ScError::Encoding(_))
        ));
    }

    #[test]
    fn test_open_rejects_garbage() {
        assert!(matches!(open(&DESCRIPTOR_KEY, "!!!"), Err(ScError::Encoding(_))));
        assert!(matches!(open(&DESCRIPTOR_KEY, "AAAA"), Err(ScError::Encoding(_))));
        let huge = "A".repeat(MAX_DESCRIPTOR_SIZE + 1);
        assert!(matches!(open(&DESCRIPTOR_KEY, &huge), Err(ScError::Encoding(_))));
    }

    #[test]
    fn test_join_secret_is_bound_to_expiry() {
        let mut b = bundle(2_000_000_000);
        assert!(verify_join_secret(&SESSION_KEY, &b));

        b.expiry += 3600;
        assert!(!verify_join_secret(&SESSION_KEY, &b), "Extending expiry must break the secret");
    }

    #[test]
    fn test_join_secret_is_bound_to_session_key() {
        let b = bundle(2_000_000_000);
        assert!(!verify_join_secret(&[10u8; 32], &b));
    }

    #[test]
    fn test_bundle_debug_redacts_secret() {
        let b = bundle(2_000_000_000);
        let debug = format!("{b:?}");
        assert!(!debug.contains(&b.secret));
        assert!(debug.contains("[REDACTED]"));
    }
}
