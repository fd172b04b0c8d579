//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports [`secrecy`] so every crate in the workspace wraps key material the
//! same way. The master secret, per-session signing keys, join secrets and pairing
//! PINs all travel inside these wrappers.
//!
//! `SecretBox<T>` and `SecretString` implement `Debug` with redaction, so a struct
//! that derives `Debug` while holding one cannot leak it through `{:?}` or a
//! tracing field. Values are zeroized on drop.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct PairingRequest {
//!     display_name: String,
//!     pin: SecretString,
//! }
//!
//! let req = PairingRequest {
//!     display_name: "kitchen speaker".to_string(),
//!     pin: SecretString::from("402913"),
//! };
//!
//! assert!(!format!("{req:?}").contains("402913"));
//! assert_eq!(req.pin.expose_secret(), "402913");
//! ```
//!
//! # Usage Guidelines
//!
//! Use `SecretString` for:
//! - The base64 master secret read from the environment
//! - Bearer tokens held by clients
//! - Pairing PINs
//!
//! Use `SecretBox<Vec<u8>>` for:
//! - Decoded key material (master secret bytes, derived keys)

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
