//! Message types exchanged on a session connection.
//!
//! All messages are internally tagged with a snake_case `type` field:
//!
//! ```text
//! {"type":"clock_probe","t1":1700000000123}
//! {"type":"command","command":{"type":"seek","position_ms":42000},"local_seq":7,"local_timestamp_ms":1700000000456}
//! ```
//!
//! Timestamps are milliseconds. `t*`, `local_timestamp_ms` and
//! `reference_host_time_ms` are Unix epoch milliseconds on the clock named by the
//! field (participant-local or host).

use common::types::{ParticipantId, Role, SessionId};
use serde::{Deserialize, Serialize};

/// Longest shared play queue.
///
/// With [`MAX_TRACK_ID_BYTES`] this keeps a full state, escaped as JSON, well
/// inside one frame.
pub const MAX_QUEUE_LEN: usize = 100;

/// Longest track identifier, in bytes.
pub const MAX_TRACK_ID_BYTES: usize = 256;

/// Whether `track_id` may enter the queue: non-empty, at most
/// [`MAX_TRACK_ID_BYTES`] bytes, no control characters.
#[must_use]
pub fn is_valid_track_id(track_id: &str) -> bool {
    !track_id.is_empty()
        && track_id.len() <= MAX_TRACK_ID_BYTES
        && !track_id.chars().any(char::is_control)
}

/// Transport state of the shared playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Playing,
    Paused,
}

/// Authoritative playback state of a session.
///
/// `position_ms` was the track position at host time `reference_host_time_ms`.
/// While playing, the position at any later host time is obtained by projection
/// (see [`PlaybackState::position_at`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackState {
    /// Current track, `None` before anything was queued.
    pub track_id: Option<String>,
    pub transport: TransportState,
    pub position_ms: u64,
    pub reference_host_time_ms: i64,
    /// Incremented on every mutation.
    pub revision: u64,
    /// Shared play queue.
    #[serde(default)]
    pub queue: Vec<String>,
    /// Index of `track_id` in `queue`.
    #[serde(default)]
    pub current_index: Option<usize>,
}

impl PlaybackState {
    /// Empty, paused state at revision 0.
    #[must_use]
    pub fn new(reference_host_time_ms: i64) -> Self {
        Self {
            track_id: None,
            transport: TransportState::Paused,
            position_ms: 0,
            reference_host_time_ms,
            revision: 0,
            queue: Vec::new(),
            current_index: None,
        }
    }

    /// Track position at `host_time_ms`.
    ///
    /// Host times earlier than the reference do not rewind the position.
    #[must_use]
    pub fn position_at(&self, host_time_ms: i64) -> u64 {
        match self.transport {
            TransportState::Paused => self.position_ms,
            TransportState::Playing => {
                let elapsed = host_time_ms.saturating_sub(self.reference_host_time_ms);
                self.position_ms
                    .saturating_add(u64::try_from(elapsed).unwrap_or(0))
            }
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.transport == TransportState::Playing
    }
}

/// A user-issued playback intent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaybackCommand {
    /// Explicit activation of a forming session (host only).
    Start,
    Play,
    Pause,
    Seek { position_ms: u64 },
    NextTrack,
    PrevTrack,
    /// Append a track to the shared queue.
    AddTrack { track_id: String },
    /// Remove the queue entry at `index`.
    RemoveTrack { index: usize },
    /// Vote to skip the current track.
    VoteSkip,
}

impl PlaybackCommand {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PlaybackCommand::Start => "start",
            PlaybackCommand::Play => "play",
            PlaybackCommand::Pause => "pause",
            PlaybackCommand::Seek { .. } => "seek",
            PlaybackCommand::NextTrack => "next_track",
            PlaybackCommand::PrevTrack => "prev_track",
            PlaybackCommand::AddTrack { .. } => "add_track",
            PlaybackCommand::RemoveTrack { .. } => "remove_track",
            PlaybackCommand::VoteSkip => "vote_skip",
        }
    }
}

/// A participant's own view of its local player, reported with heartbeats.
///
/// Used to seed the session state when this participant is elected host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPlayback {
    pub position_ms: u64,
    pub local_timestamp_ms: i64,
    pub playing: bool,
}

/// Messages sent by a participant to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on every connection: the bearer token.
    Hello { token: String },

    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        playback: Option<LocalPlayback>,
    },

    /// Clock probe, `t1` = participant send time.
    ClockProbe { t1: i64 },

    /// A completed probe round, so the server-side estimator gets the sample.
    ClockReport { t1: i64, t2: i64, t3: i64, t4: i64 },

    Command {
        command: PlaybackCommand,
        /// Per-participant sequence number, used for deduplication.
        local_seq: u64,
        local_timestamp_ms: i64,
    },

    Chat { text: String },

    /// Ask for the latest state broadcast (after a gap or a stale discard).
    SyncRequest,

    /// The host's player reached the end of `track_id`.
    TrackEnded { track_id: String },

    /// Explicit leave.
    Leave,
}

/// Why a participant left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    Voluntary,
    Timeout,
    Revoked,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The host ended the session.
    HostEnded,
    /// The last participant left.
    Empty,
    /// Host migration found no eligible participant.
    HostUnavailable,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::HostEnded => "host_ended",
            CloseReason::Empty => "empty",
            CloseReason::HostUnavailable => "host_unavailable",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Error kinds reported to participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TokenInvalid,
    TokenExpired,
    TokenRevoked,
    SessionNotFound,
    SessionFull,
    HostUnavailable,
    NotActive,
    PermissionDenied,
    /// The play queue is at its limit.
    QueueFull,
    ProtocolViolation,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TokenInvalid => "token_invalid",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::TokenRevoked => "token_revoked",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionFull => "session_full",
            ErrorKind::HostUnavailable => "host_unavailable",
            ErrorKind::NotActive => "not_active",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::ProtocolViolation => "protocol_violation",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the connection is refused with this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::TokenInvalid
                | ErrorKind::TokenExpired
                | ErrorKind::TokenRevoked
                | ErrorKind::SessionNotFound
                | ErrorKind::SessionFull
                | ErrorKind::ProtocolViolation
        )
    }
}

/// Messages sent by the server to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to a successful `hello`.
    Welcome {
        session_id: SessionId,
        participant_id: ParticipantId,
        role: Role,
        host_id: Option<ParticipantId>,
        /// Fresh token for the next reconnect (the presented one is consumed).
        resume_token: String,
        probe_interval_ms: u64,
        playback_state: PlaybackState,
    },

    Heartbeat,

    ClockProbeReply { t1: i64, t2: i64, t3: i64 },

    StateBroadcast {
        playback_state: PlaybackState,
        revision: u64,
    },

    /// `None` while host migration is in progress.
    RoleChanged { new_host_id: Option<ParticipantId> },

    ParticipantJoined {
        participant_id: ParticipantId,
        display_name: String,
    },

    ParticipantLeft {
        participant_id: ParticipantId,
        reason: LeaveReason,
    },

    Chat {
        participant_id: ParticipantId,
        text: String,
    },

    SkipVotes { votes: usize, needed: usize },

    SessionClosed { reason: CloseReason },

    Error { kind: ErrorKind, message: String },
}

impl ServerMessage {
    /// Build a state broadcast for `state`.
    #[must_use]
    pub fn broadcast(state: &PlaybackState) -> Self {
        ServerMessage::StateBroadcast {
            playback_state: state.clone(),
            revision: state.revision,
        }
    }
}
