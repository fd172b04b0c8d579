//! FlowSync session wire protocol.
//!
//! Participants hold one long-lived TCP connection to the session server. Every
//! frame is a 4-byte big-endian length followed by a JSON message (see [`codec`]).
//! Message types are in [`messages`]; [`revision`] holds the receiver-side filter
//! for stale state broadcasts.

pub mod codec;
pub mod messages;
pub mod revision;

pub use codec::{ClientCodec, CodecError, ServerCodec, SyncCodec, MAX_FRAME_SIZE};
pub use messages::*;
pub use revision::RevisionGate;
