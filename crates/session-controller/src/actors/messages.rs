//! Message types for actor communication.
//!
//! Connections and the admin API talk to a session only through these messages.
//! Request-reply messages carry a `tokio::sync::oneshot` sender.

use crate::clock_sync::{ClockSnapshot, CorrectedTime};
use crate::errors::ScError;
use crate::pairing::IssuedToken;
use common::jwt::SyncClaims;
use common::secret::SecretString;
use common::types::{ParticipantId, Role, SessionId};
use serde::Serialize;
use sync_protocol::{CloseReason, LocalPlayback, PlaybackCommand, PlaybackState, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Messages sent to a `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// A connection presented a verified token in its `hello`.
    Attach {
        claims: SyncClaims,
        /// Queue drained by the connection's write loop.
        outbound: mpsc::Sender<ServerMessage>,
        respond_to: oneshot::Sender<Result<AttachAccepted, ScError>>,
    },

    /// A connection's socket closed. The participant keeps its slot until the
    /// heartbeat timeout.
    Detach {
        participant_id: ParticipantId,
        connection_id: u64,
    },

    /// Explicit leave.
    Leave { participant_id: ParticipantId },

    Heartbeat {
        participant_id: ParticipantId,
        playback: Option<LocalPlayback>,
    },

    /// The connection's clock estimate changed.
    ClockUpdate {
        participant_id: ParticipantId,
        snapshot: ClockSnapshot,
    },

    Command {
        participant_id: ParticipantId,
        command: PlaybackCommand,
        local_seq: u64,
        corrected: CorrectedTime,
    },

    Chat {
        participant_id: ParticipantId,
        text: String,
    },

    /// Resend the current state to one participant.
    SyncRequest { participant_id: ParticipantId },

    /// A player finished `track_id`. `reporter` is `None` for the engine
    /// embedded in this process.
    TrackEnded {
        reporter: Option<ParticipantId>,
        track_id: String,
    },

    /// Sign a token for a member of this session.
    IssueToken {
        participant_id: ParticipantId,
        role: Role,
        display_name: Option<String>,
        respond_to: oneshot::Sender<Result<IssuedToken, ScError>>,
    },

    /// Host bearer check for admin operations. Does not consume the nonce.
    CheckHost {
        claims: SyncClaims,
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },

    /// Mark a verified token's nonce consumed.
    ConsumeNonce {
        claims: SyncClaims,
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },

    /// Whether the session still admits new participants.
    CheckJoinable {
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },

    /// Issue a fresh pairing PIN, replacing any previous one.
    CreatePin {
        respond_to: oneshot::Sender<Result<PinGrant, ScError>>,
    },

    /// Exchange a pairing PIN for a follower token.
    RedeemPin {
        pin: SecretString,
        display_name: Option<String>,
        respond_to: oneshot::Sender<Result<IssuedToken, ScError>>,
    },

    /// Revoke a participant's credentials and disconnect it.
    RevokeParticipant {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },

    GetState {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },

    /// Close the session.
    Close {
        reason: CloseReason,
        respond_to: oneshot::Sender<Result<(), ScError>>,
    },
}

/// Result of a successful attach.
#[derive(Debug, Clone)]
pub struct AttachAccepted {
    pub participant_id: ParticipantId,
    pub role: Role,
    /// Distinguishes this connection from an earlier one of the same participant.
    pub connection_id: u64,
    /// Cancelled when the session closes, the participant is removed or a newer
    /// connection replaces this one.
    pub cancel: CancellationToken,
}

/// A pairing PIN as shown to the host.
#[derive(Debug)]
pub struct PinGrant {
    pub pin: SecretString,
    /// Unix seconds.
    pub expires_at: i64,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, waiting for the host's first command or `start`.
    Forming,
    Active,
    /// Host lost; no participant holds the host role.
    HostMigration,
    Closing,
    Closed,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Forming => "forming",
            SessionStatus::Active => "active",
            SessionStatus::HostMigration => "host_migration",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        }
    }

    /// Closing or closed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closing | SessionStatus::Closed)
    }
}

/// Point-in-time view of a session (admin API, tests).
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub participant_count: usize,
    pub connected_count: usize,
    pub revision: u64,
    pub host_id: Option<ParticipantId>,
    pub playback_state: PlaybackState,
    /// Advertised through discovery.
    pub public: bool,
    pub chat_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_labels() {
        assert_eq!(SessionStatus::Forming.as_str(), "forming");
        assert_eq!(SessionStatus::HostMigration.as_str(), "host_migration");
        assert!(SessionStatus::Closing.is_terminal());
        assert!(SessionStatus::Closed.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
    }

    #[test]
    fn test_session_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::HostMigration).unwrap_or_default();
        assert_eq!(json, "\"host_migration\"");
    }
}
