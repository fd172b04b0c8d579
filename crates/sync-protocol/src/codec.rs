//! Length-prefixed JSON framing for session connections.
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE) | JSON message (length bytes) |
//! +----------------+---------------------------+
//! ```
//!
//! [`SyncCodec`] plugs the framing into `tokio_util::codec::Framed`. The server
//! decodes [`ClientMessage`] and encodes [`ServerMessage`]; clients do the reverse.

use crate::messages::{ClientMessage, ServerMessage};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Size of the length prefix.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Declared or encoded body exceeds [`MAX_FRAME_SIZE`]
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Body is not a valid message
    #[error("Invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying transport failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode one message as a frame, appending to `dst`.
///
/// # Errors
///
/// Returns an error if serialization fails or the body exceeds [`MAX_FRAME_SIZE`].
pub fn encode_frame<T: Serialize>(message: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(body.len()));
    }
    let len = u32::try_from(body.len()).map_err(|_| CodecError::FrameTooLarge(body.len()))?;

    dst.reserve(LENGTH_PREFIX_SIZE + body.len());
    dst.put_u32(len);
    dst.extend_from_slice(&body);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a whole frame; nothing is
/// consumed in that case.
///
/// # Errors
///
/// Returns an error if the declared length exceeds [`MAX_FRAME_SIZE`] or the body
/// is not a valid message.
pub fn decode_frame<T: DeserializeOwned>(src: &mut BytesMut) -> Result<Option<T>, CodecError> {
    let Some(prefix) = src
        .get(..LENGTH_PREFIX_SIZE)
        .and_then(|b| <[u8; LENGTH_PREFIX_SIZE]>::try_from(b).ok())
    else {
        return Ok(None);
    };

    let body_len = u32::from_be_bytes(prefix) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(body_len));
    }

    let frame_len = LENGTH_PREFIX_SIZE + body_len;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    let body = src.split_to(body_len);
    let message = serde_json::from_slice(&body)?;
    Ok(Some(message))
}

/// Framed codec decoding `In` and encoding `Out`.
pub struct SyncCodec<In, Out> {
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> SyncCodec<In, Out> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for SyncCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> std::fmt::Debug for SyncCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCodec").finish()
    }
}

impl<In: DeserializeOwned, Out> Decoder for SyncCodec<In, Out> {
    type Item = In;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

impl<In, Out: Serialize> Encoder<Out> for SyncCodec<In, Out> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst)
    }
}

/// Codec used by the server side of a connection.
pub type ServerCodec = SyncCodec<ClientMessage, ServerMessage>;

/// Codec used by participants.
pub type ClientCodec = SyncCodec<ServerMessage, ClientMessage>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::messages::{
        PlaybackCommand, PlaybackState, MAX_QUEUE_LEN, MAX_TRACK_ID_BYTES,
    };
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_decode_waits_for_complete_frame() {
        let mut full = BytesMut::new();
        encode_frame(&ClientMessage::ClockProbe { t1: 99 }, &mut full).unwrap();

        // Feed all but the last byte
        let mut partial = full.clone();
        partial.truncate(full.len() - 1);
        let decoded: Option<ClientMessage> = decode_frame(&mut partial).unwrap();
        assert!(decoded.is_none());
        assert_eq!(partial.len(), full.len() - 1, "Partial frame must not be consumed");

        let decoded: Option<ClientMessage> = decode_frame(&mut full).unwrap();
        assert_eq!(decoded, Some(ClientMessage::ClockProbe { t1: 99 }));
        assert!(full.is_empty());
    }

    #[test]
    fn test_decode_short_prefix_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        let decoded: Option<ClientMessage> = decode_frame(&mut buf).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::try_from(MAX_FRAME_SIZE + 1).unwrap());
        let result: Result<Option<ClientMessage>, _> = decode_frame(&mut buf);
        assert!(matches!(result, Err(CodecError::FrameTooLarge(n)) if n == MAX_FRAME_SIZE + 1));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let mut buf = BytesMut::new();
        let msg = ClientMessage::Chat {
            text: "x".repeat(MAX_FRAME_SIZE),
        };
        assert!(matches!(
            encode_frame(&msg, &mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fullest_state_fits_one_frame() {
        // Quotes double in size once escaped
        let worst = "\"".repeat(MAX_TRACK_ID_BYTES);
        let mut state = PlaybackState::new(0);
        state.queue = vec![worst.clone(); MAX_QUEUE_LEN];
        state.current_index = Some(MAX_QUEUE_LEN - 1);
        state.track_id = Some(worst);
        state.revision = u64::MAX;

        let mut buf = BytesMut::new();
        encode_frame(&ServerMessage::broadcast(&state), &mut buf).unwrap();
        assert!(buf.len() <= LENGTH_PREFIX_SIZE + MAX_FRAME_SIZE);

        let decoded: Option<ServerMessage> = decode_frame(&mut buf).unwrap();
        assert_eq!(decoded, Some(ServerMessage::broadcast(&state)));
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.extend_from_slice(b"hello");
        let result: Result<Option<ClientMessage>, _> = decode_frame(&mut buf);
        assert!(matches!(result, Err(CodecError::Json(_))));
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode_frame(&ClientMessage::SyncRequest, &mut buf).unwrap();
        encode_frame(&ClientMessage::Leave, &mut buf).unwrap();

        let first: Option<ClientMessage> = decode_frame(&mut buf).unwrap();
        let second: Option<ClientMessage> = decode_frame(&mut buf).unwrap();
        assert_eq!(first, Some(ClientMessage::SyncRequest));
        assert_eq!(second, Some(ClientMessage::Leave));
    }

    #[tokio::test]
    async fn test_framed_client_to_server_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let mut client = FramedWrite::new(client_io, ClientCodec::new());
        let mut server = FramedRead::new(server_io, ServerCodec::new());

        let sent = ClientMessage::Command {
            command: PlaybackCommand::Pause,
            local_seq: 3,
            local_timestamp_ms: 1_000,
        };
        client.send(sent.clone()).await.unwrap();

        let received = server.next().await.unwrap().unwrap();
        assert_eq!(received, sent);
    }
}
