//! Key derivation and randomness for pairing.
//!
//! ```text
//! session_key    = HKDF-SHA256(master_secret, salt = session_id, info = "sync-token")
//! descriptor_key = HKDF-SHA256(master_secret, salt = "flowsync-descriptor", info = "join-descriptor")
//! ```
//!
//! Session keys are scoped by session id, so a token signed for one session never
//! verifies for another.

use crate::errors::ScError;
use common::secret::SecretBox;
use common::types::SessionId;
use ring::{hkdf, rand};

/// Length of every derived key.
pub const DERIVED_KEY_LEN: usize = 32;

const SESSION_KEY_INFO: &[u8] = b"sync-token";
const DESCRIPTOR_KEY_SALT: &[u8] = b"flowsync-descriptor";
const DESCRIPTOR_KEY_INFO: &[u8] = b"join-descriptor";

/// HKDF output key length.
struct DerivedKeyLen;

impl hkdf::KeyType for DerivedKeyLen {
    fn len(&self) -> usize {
        DERIVED_KEY_LEN
    }
}

fn derive(master_secret: &[u8], salt: &[u8], info: &[u8]) -> Result<SecretBox<Vec<u8>>, ScError> {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, salt);
    let prk = salt.extract(master_secret);
    let info = [info];
    let okm = prk
        .expand(&info, DerivedKeyLen)
        .map_err(|_| ScError::Internal("HKDF expand failed".to_string()))?;

    let mut key = vec![0u8; DERIVED_KEY_LEN];
    okm.fill(&mut key)
        .map_err(|_| ScError::Internal("HKDF fill failed".to_string()))?;
    Ok(SecretBox::new(Box::new(key)))
}

/// Derive the token signing key of one session.
///
/// # Errors
///
/// Returns `ScError::Internal` if HKDF fails.
pub fn derive_session_key(
    master_secret: &[u8],
    session_id: &SessionId,
) -> Result<SecretBox<Vec<u8>>, ScError> {
    derive(master_secret, session_id.to_string().as_bytes(), SESSION_KEY_INFO)
}

/// Derive the join descriptor sealing key.
///
/// # Errors
///
/// Returns `ScError::Internal` if HKDF fails.
pub fn derive_descriptor_key(master_secret: &[u8]) -> Result<SecretBox<Vec<u8>>, ScError> {
    derive(master_secret, DESCRIPTOR_KEY_SALT, DESCRIPTOR_KEY_INFO)
}

/// Fill a fixed-size array from the system CSPRNG.
///
/// # Errors
///
/// Returns `ScError::Internal` if the OS random source fails.
pub fn random_bytes<const N: usize>(rng: &dyn rand::SecureRandom) -> Result<[u8; N], ScError> {
    let mut bytes = [0u8; N];
    rng.fill(&mut bytes)
        .map_err(|_| ScError::Internal("CSPRNG fill failed".to_string()))?;
    Ok(bytes)
}

/// A fresh single-use token nonce (128 bits, hex).
///
/// # Errors
///
/// Returns `ScError::Internal` if the OS random source fails.
pub fn random_nonce_hex(rng: &dyn rand::SecureRandom) -> Result<String, ScError> {
    Ok(hex::encode(random_bytes::<16>(rng)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    const MASTER: [u8; 32] = [7u8; 32];

    #[test]
    fn test_session_keys_are_deterministic_and_scoped() {
        let a = SessionId::new();
        let b = SessionId::new();

        let a1 = derive_session_key(&MASTER, &a).unwrap();
        let a2 = derive_session_key(&MASTER, &a).unwrap();
        let b1 = derive_session_key(&MASTER, &b).unwrap();

        assert_eq!(a1.expose_secret(), a2.expose_secret());
        assert_ne!(a1.expose_secret(), b1.expose_secret());
        assert_eq!(a1.expose_secret().len(), DERIVED_KEY_LEN);
    }

    #[test]
    fn test_descriptor_key_differs_from_session_keys() {
        let descriptor = derive_descriptor_key(&MASTER).unwrap();
        let session = derive_session_key(&MASTER, &SessionId::new()).unwrap();
        assert_ne!(descriptor.expose_secret(), session.expose_secret());
    }

    #[test]
    fn test_different_master_secrets_give_different_keys() {
        let sid = SessionId::new();
        let k1 = derive_session_key(&MASTER, &sid).unwrap();
        let k2 = derive_session_key(&[8u8; 32], &sid).unwrap();
        assert_ne!(k1.expose_secret(), k2.expose_secret());
    }

    #[test]
    fn test_random_nonces_are_unique() {
        let rng = rand::SystemRandom::new();
        let n1 = random_nonce_hex(&rng).unwrap();
        let n2 = random_nonce_hex(&rng).unwrap();
        assert_eq!(n1.len(), 32);
        assert_ne!(n1, n2);
    }
}
