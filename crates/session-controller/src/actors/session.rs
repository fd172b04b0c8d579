//! `SessionActor` - per-session actor that owns all session state.
//!
//! Each `SessionActor`:
//! - Owns membership, the playback state and the reconciliation queue
//! - Owns the credential ledger (consumed nonces, revocations, pairing PIN)
//! - Applies reconciled commands and broadcasts the resulting state
//! - Drives host migration and session close
//!
//! Connections never touch this state; they send [`SessionMessage`]s and
//! receive [`ServerMessage`]s through their outbound queue.
//!
//! # Participant Disconnect Handling
//!
//! When a connection drops:
//! 1. The participant keeps its slot (and its role) for the heartbeat timeout
//! 2. It may reattach with its resume token in that time
//! 3. Otherwise it is removed; removing the host starts host migration
//!
//! # Host Migration
//!
//! 1. `role_changed{new_host_id: null}`: nobody is host while electing
//! 2. Election runs on every tick and every clock update until the grace period
//!    runs out: earliest-joined participant that is connected, heartbeating and
//!    has `Good` clock quality
//! 3. The new host's reported position seeds the state, which is re-broadcast

use super::messages::{AttachAccepted, PinGrant, SessionMessage, SessionSnapshot, SessionStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::audio::TrackEndNotifier;
use crate::clock_sync::{host_now_ms, ClockSnapshot, CorrectedTime, SyncQuality};
use crate::config::SessionPolicy;
use crate::discovery::SessionAdvertiser;
use crate::errors::ScError;
use crate::follower::PlaybackRenderer;
use crate::observability::metrics;
use crate::pairing::ledger::{CredentialLedger, PairingPin};
use crate::pairing::{IssuedToken, PairingAuthority};
use crate::playback;
use crate::reconciliation::{PendingCommand, PushOutcome, ReconciliationQueue};

use common::jwt::SyncClaims;
use common::secret::{ExposeSecret, SecretString};
use common::types::{ParticipantId, Role, SessionId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use sync_protocol::{
    is_valid_track_id, CloseReason, LeaveReason, LocalPlayback, PlaybackCommand, PlaybackState,
    ServerMessage,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 500;

/// Period of the liveness / migration check.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Longest chat message relayed.
const MAX_CHAT_CHARS: usize = 1000;

/// Everything a session needs from the process around it.
pub struct SessionContext {
    pub authority: Arc<PairingAuthority>,
    pub policy: SessionPolicy,
    pub metrics: Arc<ActorMetrics>,
    /// Present when discovery is enabled.
    pub advertiser: Option<SessionAdvertiser>,
    /// Present when the host device embeds an audio engine.
    pub renderer: Option<PlaybackRenderer>,
}

/// Handle to a `SessionActor`.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: SessionId,
}

impl SessionHandle {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Bind a connection to this session.
    ///
    /// `claims` must already have passed the stateless checks of
    /// `PairingAuthority::verify`; the session checks and consumes the nonce.
    pub async fn attach(
        &self,
        claims: SyncClaims,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<AttachAccepted, ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::Attach {
            claims,
            outbound,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    /// Notify of a connection's socket closing.
    pub async fn detach(
        &self,
        participant_id: ParticipantId,
        connection_id: u64,
    ) -> Result<(), ScError> {
        self.send(SessionMessage::Detach {
            participant_id,
            connection_id,
        })
        .await
    }

    /// Participant leaves the session (explicit leave, not disconnect).
    pub async fn leave(&self, participant_id: ParticipantId) -> Result<(), ScError> {
        self.send(SessionMessage::Leave { participant_id }).await
    }

    pub async fn heartbeat(
        &self,
        participant_id: ParticipantId,
        playback: Option<LocalPlayback>,
    ) -> Result<(), ScError> {
        self.send(SessionMessage::Heartbeat {
            participant_id,
            playback,
        })
        .await
    }

    pub async fn clock_update(
        &self,
        participant_id: ParticipantId,
        snapshot: ClockSnapshot,
    ) -> Result<(), ScError> {
        self.send(SessionMessage::ClockUpdate {
            participant_id,
            snapshot,
        })
        .await
    }

    /// Submit a playback command with its timestamp already corrected to host time.
    pub async fn command(
        &self,
        participant_id: ParticipantId,
        command: PlaybackCommand,
        local_seq: u64,
        corrected: CorrectedTime,
    ) -> Result<(), ScError> {
        self.send(SessionMessage::Command {
            participant_id,
            command,
            local_seq,
            corrected,
        })
        .await
    }

    pub async fn chat(&self, participant_id: ParticipantId, text: String) -> Result<(), ScError> {
        self.send(SessionMessage::Chat {
            participant_id,
            text,
        })
        .await
    }

    pub async fn sync_request(&self, participant_id: ParticipantId) -> Result<(), ScError> {
        self.send(SessionMessage::SyncRequest { participant_id })
            .await
    }

    /// Report that `track_id` played to its end on `reporter`'s device.
    ///
    /// Only the host's report advances the queue; reports for a track that is
    /// no longer current are ignored.
    pub async fn track_ended(
        &self,
        reporter: Option<ParticipantId>,
        track_id: String,
    ) -> Result<(), ScError> {
        self.send(SessionMessage::TrackEnded { reporter, track_id })
            .await
    }

    /// Sign a token for `participant_id`. Fails with `SessionClosing` once the
    /// session is closing.
    pub async fn issue_token(
        &self,
        participant_id: ParticipantId,
        role: Role,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::IssueToken {
            participant_id,
            role,
            display_name,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    /// Verify that `claims` belong to the current host without consuming them.
    pub async fn check_host(&self, claims: SyncClaims) -> Result<(), ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::CheckHost {
            claims,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    /// Mark the nonce of verified `claims` consumed.
    pub async fn consume_nonce(&self, claims: SyncClaims) -> Result<(), ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::ConsumeNonce {
            claims,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn check_joinable(&self) -> Result<(), ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::CheckJoinable { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn create_pin(&self) -> Result<PinGrant, ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::CreatePin { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn redeem_pin(
        &self,
        pin: SecretString,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::RedeemPin {
            pin,
            display_name,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn revoke_participant(&self, participant_id: ParticipantId) -> Result<(), ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::RevokeParticipant {
            participant_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get current session state.
    pub async fn get_state(&self) -> Result<SessionSnapshot, ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::GetState { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))
    }

    /// Close the session.
    pub async fn close(&self, reason: CloseReason) -> Result<(), ScError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(SessionMessage::Close {
            reason,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| ScError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for spawning child tasks.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    async fn send(&self, message: SessionMessage) -> Result<(), ScError> {
        self.sender.send(message).await.map_err(|e| {
            debug!(
                target: "sc.actor.session",
                session_id = %self.session_id,
                error = %e,
                "Session mailbox closed"
            );
            ScError::SessionNotFound
        })
    }
}

/// Live connection of a participant.
struct ParticipantConnection {
    connection_id: u64,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

/// Participant state within a session.
struct Participant {
    participant_id: ParticipantId,
    display_name: String,
    join_order: u64,
    /// `None` while disconnected.
    connection: Option<ParticipantConnection>,
    last_seen: Instant,
    clock: ClockSnapshot,
    /// Latest local playback report, used to seed state if elected host.
    playback_report: Option<LocalPlayback>,
    /// Outbound queue drops for this participant.
    outbound_monitor: MailboxMonitor,
}

impl Participant {
    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Queue `message` on the participant's connection.
    ///
    /// A full queue means the peer is not reading; the connection is cut and
    /// the participant can resynchronize after reconnecting.
    fn deliver(&self, message: ServerMessage) {
        let Some(connection) = &self.connection else {
            return;
        };
        match connection.outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.outbound_monitor.record_drop();
                connection.cancel.cancel();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel.cancel();
        }
    }
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: SessionId,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    status: SessionStatus,
    created_at: Instant,
    authority: Arc<PairingAuthority>,
    policy: SessionPolicy,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
    /// Participants by join order.
    participants: BTreeMap<u64, Participant>,
    /// Participant id to join order.
    index: HashMap<ParticipantId, u64>,
    next_join_order: u64,
    next_connection_id: u64,
    /// Participant the session was created for; host until the first migration.
    designated_host: ParticipantId,
    host_id: Option<ParticipantId>,
    ever_attached: bool,
    state: PlaybackState,
    queue: ReconciliationQueue,
    ledger: CredentialLedger,
    pin: Option<PairingPin>,
    skip_votes: HashSet<ParticipantId>,
    migration_started: Option<Instant>,
    advertiser: Option<SessionAdvertiser>,
    renderer: Option<PlaybackRenderer>,
    /// End-of-track reports from the embedded engine.
    track_ends: Option<mpsc::Receiver<String>>,
}

impl SessionActor {
    /// Spawn a new session actor.
    ///
    /// Returns a handle and the task's `JoinHandle` for supervision.
    pub fn spawn(
        session_id: SessionId,
        designated_host: ParticipantId,
        cancel_token: CancellationToken,
        context: SessionContext,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let SessionContext {
            authority,
            policy,
            metrics,
            advertiser,
            mut renderer,
        } = context;

        let track_ends = renderer.as_mut().map(|renderer| {
            let (notifier, receiver) = TrackEndNotifier::channel();
            renderer.set_track_end_notifier(notifier);
            receiver
        });

        let actor = Self {
            session_id,
            receiver,
            cancel_token: cancel_token.clone(),
            status: SessionStatus::Forming,
            created_at: Instant::now(),
            authority,
            queue: ReconciliationQueue::new(policy.reconciliation_window, policy.host_bypass_window),
            policy,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Session, session_id.to_string()),
            participants: BTreeMap::new(),
            index: HashMap::new(),
            next_join_order: 0,
            next_connection_id: 0,
            designated_host,
            host_id: None,
            ever_attached: false,
            state: PlaybackState::new(host_now_ms()),
            ledger: CredentialLedger::new(),
            pin: None,
            skip_votes: HashSet::new(),
            migration_started: None,
            advertiser,
            renderer,
            track_ends,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            session_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sc.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.status != SessionStatus::Closed {
            // The window only runs while someone holds authority
            let deadline = if self.status == SessionStatus::Active {
                self.queue.deadline()
            } else {
                None
            };

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.actor.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    self.close(CloseReason::Shutdown);
                }

                () = sleep_until_deadline(deadline) => {
                    let batch = self.queue.drain_ready(Instant::now());
                    self.apply_batch(batch);
                }

                _ = tick.tick() => {
                    self.on_tick();
                }

                Some(track_id) = next_track_end(&mut self.track_ends) => {
                    self.track_ended(None, &track_id);
                }

                msg = self.receiver.recv() => {
                    if let Some(message) = msg {
                        self.mailbox.record_enqueue();
                        self.handle_message(message);
                        self.mailbox.record_dequeue();
                        self.metrics.record_message_processed();
                    } else {
                        info!(
                            target: "sc.actor.session",
                            session_id = %self.session_id,
                            "SessionActor channel closed, exiting"
                        );
                        self.close(CloseReason::Shutdown);
                    }
                }
            }
        }

        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            participants = self.participants.len(),
            revision = self.state.revision,
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Attach {
                claims,
                outbound,
                respond_to,
            } => {
                let result = self.attach(claims, outbound);
                let _ = respond_to.send(result);
            }

            SessionMessage::Detach {
                participant_id,
                connection_id,
            } => self.detach(participant_id, connection_id),

            SessionMessage::Leave { participant_id } => {
                self.remove_participant(participant_id, LeaveReason::Voluntary);
            }

            SessionMessage::Heartbeat {
                participant_id,
                playback,
            } => self.heartbeat(participant_id, playback),

            SessionMessage::ClockUpdate {
                participant_id,
                snapshot,
            } => self.clock_update(participant_id, snapshot),

            SessionMessage::Command {
                participant_id,
                command,
                local_seq,
                corrected,
            } => self.command(participant_id, command, local_seq, corrected),

            SessionMessage::Chat {
                participant_id,
                text,
            } => self.chat(participant_id, text),

            SessionMessage::SyncRequest { participant_id } => {
                if let Some(participant) = self.participant(&participant_id) {
                    participant.deliver(ServerMessage::broadcast(&self.state));
                }
            }

            SessionMessage::TrackEnded { reporter, track_id } => {
                self.track_ended(reporter, &track_id);
            }

            SessionMessage::IssueToken {
                participant_id,
                role,
                display_name,
                respond_to,
            } => {
                let result = self.issue_token(participant_id, role, display_name);
                let _ = respond_to.send(result);
            }

            SessionMessage::CheckHost { claims, respond_to } => {
                let result = self.check_host(&claims);
                let _ = respond_to.send(result);
            }

            SessionMessage::ConsumeNonce { claims, respond_to } => {
                let result = self.consume_nonce(&claims);
                let _ = respond_to.send(result);
            }

            SessionMessage::CheckJoinable { respond_to } => {
                let result = if self.status.is_terminal() {
                    Err(ScError::SessionClosing)
                } else {
                    Ok(())
                };
                let _ = respond_to.send(result);
            }

            SessionMessage::CreatePin { respond_to } => {
                let result = self.create_pin();
                let _ = respond_to.send(result);
            }

            SessionMessage::RedeemPin {
                pin,
                display_name,
                respond_to,
            } => {
                let result = self.redeem_pin(&pin, display_name);
                let _ = respond_to.send(result);
            }

            SessionMessage::RevokeParticipant {
                participant_id,
                respond_to,
            } => {
                let result = self.revoke_participant(participant_id);
                let _ = respond_to.send(result);
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            SessionMessage::Close { reason, respond_to } => {
                self.close(reason);
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    // ========================================================================
    // Membership
    // ========================================================================

    fn attach(
        &mut self,
        claims: SyncClaims,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<AttachAccepted, ScError> {
        if self.status.is_terminal() {
            return Err(ScError::SessionNotFound);
        }

        let participant_id = claims.sub;
        let existing = self.index.get(&participant_id).copied();

        if let Err(e) = self.ledger.check(&claims) {
            metrics::record_token_validation(e.as_str());
            return Err(e.into());
        }
        if existing.is_none() && self.participants.len() >= self.policy.max_participants {
            return Err(ScError::SessionFull);
        }

        let role = if self.is_host_identity(participant_id) {
            Role::Host
        } else {
            Role::Follower
        };
        let display_name = existing
            .and_then(|order| self.participants.get(&order))
            .map(|p| p.display_name.clone())
            .or_else(|| claims.name.clone())
            .unwrap_or_else(|| default_display_name(participant_id));
        let resume = self.authority.issue_token(
            self.session_id,
            participant_id,
            role,
            self.policy.token_ttl,
            Some(display_name.clone()),
        )?;

        // Nothing below can fail: consume only once the attach is certain
        if let Err(e) = self.ledger.consume(&claims) {
            metrics::record_token_validation(e.as_str());
            return Err(e.into());
        }
        metrics::record_token_validation("valid");

        self.next_connection_id = self.next_connection_id.wrapping_add(1);
        let connection_id = self.next_connection_id;
        let cancel = self.cancel_token.child_token();
        let connection = ParticipantConnection {
            connection_id,
            outbound,
            cancel: cancel.clone(),
        };
        let now = Instant::now();

        let join_order = if let Some(order) = existing {
            if let Some(participant) = self.participants.get_mut(&order) {
                // A newer connection replaces the old one
                participant.disconnect();
                participant.connection = Some(connection);
                participant.last_seen = now;
            }
            order
        } else {
            let order = self.next_join_order;
            self.next_join_order = self.next_join_order.saturating_add(1);
            self.participants.insert(
                order,
                Participant {
                    participant_id,
                    display_name: display_name.clone(),
                    join_order: order,
                    connection: Some(connection),
                    last_seen: now,
                    clock: ClockSnapshot::unknown(),
                    playback_report: None,
                    outbound_monitor: MailboxMonitor::new(
                        ActorType::Connection,
                        participant_id.to_string(),
                    ),
                },
            );
            self.index.insert(participant_id, order);
            order
        };

        if role == Role::Host {
            self.host_id = Some(participant_id);
        }
        self.ever_attached = true;

        if let Some(participant) = self.participants.get(&join_order) {
            participant.deliver(ServerMessage::Welcome {
                session_id: self.session_id,
                participant_id,
                role,
                host_id: self.host_id,
                resume_token: resume.token,
                probe_interval_ms: u64::try_from(self.policy.clock_probe_interval.as_millis())
                    .unwrap_or(u64::MAX),
                playback_state: self.state.clone(),
            });
        }

        if existing.is_none() {
            self.broadcast_except(
                participant_id,
                &ServerMessage::ParticipantJoined {
                    participant_id,
                    display_name,
                },
            );
        }

        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            participant_id = %participant_id,
            role = role.as_str(),
            join_order,
            reattach = existing.is_some(),
            participants = self.participants.len(),
            "Participant attached"
        );

        Ok(AttachAccepted {
            participant_id,
            role,
            connection_id,
            cancel,
        })
    }

    fn detach(&mut self, participant_id: ParticipantId, connection_id: u64) {
        let Some(participant) = self.participant_mut(&participant_id) else {
            return;
        };
        // A stale detach from a replaced connection is ignored
        if participant
            .connection
            .as_ref()
            .is_some_and(|c| c.connection_id == connection_id)
        {
            participant.connection = None;
            debug!(
                target: "sc.actor.session",
                participant_id = %participant_id,
                "Participant disconnected, slot held for heartbeat timeout"
            );
        }
    }

    fn heartbeat(&mut self, participant_id: ParticipantId, playback: Option<LocalPlayback>) {
        if let Some(participant) = self.participant_mut(&participant_id) {
            participant.last_seen = Instant::now();
            if playback.is_some() {
                participant.playback_report = playback;
            }
        }
    }

    fn clock_update(&mut self, participant_id: ParticipantId, snapshot: ClockSnapshot) {
        if let Some(participant) = self.participant_mut(&participant_id) {
            participant.clock = snapshot;
        }
        if self.status == SessionStatus::HostMigration {
            self.try_elect();
        }
    }

    /// Remove a participant and deal with the consequences for the session.
    fn remove_participant(&mut self, participant_id: ParticipantId, reason: LeaveReason) {
        let Some(order) = self.index.remove(&participant_id) else {
            return;
        };
        if let Some(mut participant) = self.participants.remove(&order) {
            participant.disconnect();
        }
        self.queue.forget_participant(&participant_id);
        self.skip_votes.remove(&participant_id);

        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            participant_id = %participant_id,
            reason = ?reason,
            remaining = self.participants.len(),
            "Participant removed"
        );
        self.broadcast(&ServerMessage::ParticipantLeft {
            participant_id,
            reason,
        });

        if self.host_id == Some(participant_id) {
            self.host_id = None;
            match self.status {
                SessionStatus::Active => self.begin_migration(),
                SessionStatus::Forming => {
                    let close_reason = if reason == LeaveReason::Voluntary {
                        CloseReason::HostEnded
                    } else {
                        CloseReason::HostUnavailable
                    };
                    self.close(close_reason);
                }
                _ => {}
            }
        }

        if self.participants.is_empty() {
            self.close(CloseReason::Empty);
        }
    }

    fn revoke_participant(&mut self, participant_id: ParticipantId) -> Result<(), ScError> {
        if self.host_id == Some(participant_id) {
            return Err(ScError::PermissionDenied(
                "The host cannot be revoked".to_string(),
            ));
        }
        self.ledger.revoke_participant(participant_id);
        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            participant_id = %participant_id,
            "Participant revoked"
        );
        self.remove_participant(participant_id, LeaveReason::Revoked);
        Ok(())
    }

    fn chat(&mut self, participant_id: ParticipantId, text: String) {
        if !self.index.contains_key(&participant_id) {
            return;
        }
        if !self.policy.chat_enabled {
            self.send_error(
                &participant_id,
                &ScError::PermissionDenied("Chat is disabled".to_string()),
            );
            return;
        }
        let text: String = text.chars().take(MAX_CHAT_CHARS).collect();
        self.broadcast(&ServerMessage::Chat {
            participant_id,
            text,
        });
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    /// Whether `participant_id` holds, or is entitled to claim, the host role.
    fn is_host_identity(&self, participant_id: ParticipantId) -> bool {
        match self.host_id {
            Some(host) => host == participant_id,
            None => {
                self.status == SessionStatus::Forming && participant_id == self.designated_host
            }
        }
    }

    fn issue_token(
        &self,
        participant_id: ParticipantId,
        role: Role,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        if self.status.is_terminal() {
            return Err(ScError::SessionClosing);
        }
        self.authority.issue_token(
            self.session_id,
            participant_id,
            role,
            self.policy.token_ttl,
            display_name,
        )
    }

    fn check_host(&self, claims: &SyncClaims) -> Result<(), ScError> {
        if self.status.is_terminal() {
            return Err(ScError::SessionNotFound);
        }
        self.ledger.check(claims)?;
        if !self.is_host_identity(claims.sub) {
            return Err(ScError::PermissionDenied(
                "Host role required".to_string(),
            ));
        }
        Ok(())
    }

    fn consume_nonce(&mut self, claims: &SyncClaims) -> Result<(), ScError> {
        if self.status.is_terminal() {
            return Err(ScError::SessionNotFound);
        }
        match self.ledger.consume(claims) {
            Ok(()) => {
                metrics::record_token_validation("valid");
                Ok(())
            }
            Err(e) => {
                metrics::record_token_validation(e.as_str());
                Err(e.into())
            }
        }
    }

    fn create_pin(&mut self) -> Result<PinGrant, ScError> {
        if self.status.is_terminal() {
            return Err(ScError::SessionClosing);
        }
        let (pin, stored) =
            PairingPin::generate(self.authority.rng(), self.policy.pin_ttl, Instant::now())?;
        self.pin = Some(stored);

        let ttl = i64::try_from(self.policy.pin_ttl.as_secs()).unwrap_or(i64::MAX);
        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            "Pairing PIN issued"
        );
        Ok(PinGrant {
            pin,
            expires_at: chrono::Utc::now().timestamp().saturating_add(ttl),
        })
    }

    fn redeem_pin(
        &mut self,
        pin: &SecretString,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        if self.status.is_terminal() {
            return Err(ScError::SessionNotFound);
        }
        // A full session leaves the PIN usable for when a slot frees up
        if self.participants.len() >= self.policy.max_participants {
            return Err(ScError::SessionFull);
        }
        let Some(stored) = self.pin.as_mut() else {
            return Err(ScError::Token(common::jwt::TokenError::Invalid));
        };
        stored
            .redeem(pin.expose_secret(), Instant::now())
            .map_err(|rejection| ScError::Token(rejection.into()))?;

        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            "Pairing PIN redeemed"
        );
        self.issue_token(ParticipantId::new(), Role::Follower, display_name)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn command(
        &mut self,
        participant_id: ParticipantId,
        command: PlaybackCommand,
        local_seq: u64,
        corrected: CorrectedTime,
    ) {
        let Some(&join_order) = self.index.get(&participant_id) else {
            return;
        };
        let is_host = self.host_id == Some(participant_id);

        match self.status {
            SessionStatus::Closing | SessionStatus::Closed => return,
            SessionStatus::Forming => {
                if !is_host {
                    self.send_error(&participant_id, &ScError::NotActive);
                    return;
                }
                self.activate();
                if command == PlaybackCommand::Start {
                    return;
                }
            }
            SessionStatus::Active | SessionStatus::HostMigration => {}
        }

        match &command {
            PlaybackCommand::Start => {
                if !is_host {
                    self.send_error(
                        &participant_id,
                        &ScError::PermissionDenied("Only the host can start".to_string()),
                    );
                }
                return;
            }
            PlaybackCommand::AddTrack { .. } | PlaybackCommand::RemoveTrack { .. }
                if !is_host && !self.policy.collaborative_queue =>
            {
                self.send_error(
                    &participant_id,
                    &ScError::PermissionDenied("The queue is host only".to_string()),
                );
                return;
            }
            PlaybackCommand::AddTrack { track_id } => {
                if !is_valid_track_id(track_id) {
                    self.send_error(
                        &participant_id,
                        &ScError::Protocol("malformed track id".to_string()),
                    );
                    return;
                }
                if !playback::queue_has_room(&self.state) {
                    self.send_error(&participant_id, &ScError::QueueFull);
                    return;
                }
            }
            PlaybackCommand::VoteSkip if !is_host && !self.policy.voting_enabled => {
                self.send_error(
                    &participant_id,
                    &ScError::PermissionDenied("Voting is disabled".to_string()),
                );
                return;
            }
            _ => {}
        }

        let pending = PendingCommand {
            participant_id,
            join_order,
            local_seq,
            corrected_time_ms: corrected.host_time_ms,
            command,
            from_host: is_host,
            degraded: corrected.degraded,
        };

        match self.queue.push(pending, Instant::now()) {
            PushOutcome::Buffered => {}
            PushOutcome::Duplicate => metrics::record_command_duplicate(),
            PushOutcome::Immediate(batch) => self.apply_batch(batch),
        }
    }

    /// Count a skip vote. Returns `true` when it completes a strict majority
    /// of connected participants.
    fn record_skip_vote(&mut self, participant_id: ParticipantId) -> bool {
        if !self.index.contains_key(&participant_id) {
            return false;
        }
        self.skip_votes.insert(participant_id);
        let connected = self
            .participants
            .values()
            .filter(|p| p.is_connected())
            .count();
        let needed = connected / 2 + 1;
        let votes = self.skip_votes.len();

        self.broadcast(&ServerMessage::SkipVotes { votes, needed });

        if votes >= needed {
            self.skip_votes.clear();
            return true;
        }
        false
    }

    fn track_ended(&mut self, reporter: Option<ParticipantId>, track_id: &str) {
        if self.status != SessionStatus::Active {
            return;
        }
        let Some(host) = self.host_id else {
            return;
        };
        if let Some(reporter) = reporter {
            if reporter != host {
                self.send_error(
                    &reporter,
                    &ScError::PermissionDenied("Only the host reports track end".to_string()),
                );
                return;
            }
        }
        // Host and embedded engine may both report the same end
        if self.state.track_id.as_deref() != Some(track_id) {
            debug!(
                target: "sc.actor.session",
                session_id = %self.session_id,
                track_id,
                "Ignoring end of a track that is not current"
            );
            return;
        }
        let join_order = self.index.get(&host).copied().unwrap_or_default();

        // Applied as a host command: everything buffered goes first
        let mut batch = self.queue.drain_all();
        batch.push(PendingCommand {
            participant_id: host,
            join_order,
            local_seq: 0,
            corrected_time_ms: host_now_ms(),
            command: PlaybackCommand::NextTrack,
            from_host: true,
            degraded: false,
        });
        self.apply_batch(batch);
    }

    /// Apply reconciled commands in order and broadcast once if anything changed.
    fn apply_batch(&mut self, batch: Vec<PendingCommand>) {
        if batch.is_empty() {
            return;
        }
        metrics::record_reconciliation_batch(batch.len());

        let now_ms = host_now_ms();
        let mut changed = false;
        for pending in batch {
            // Votes count once they survive dedup; the deciding one skips
            let command = match pending.command {
                PlaybackCommand::VoteSkip => {
                    if !self.record_skip_vote(pending.participant_id) {
                        continue;
                    }
                    PlaybackCommand::NextTrack
                }
                other => other,
            };
            let at = playback::effective_time(&self.state, pending.corrected_time_ms, now_ms);
            let track_before = self.state.current_index;

            if playback::apply_command(&mut self.state, &command, at) {
                changed = true;
                metrics::record_command_applied(command.as_str());
                if self.state.current_index != track_before {
                    self.skip_votes.clear();
                }
                debug!(
                    target: "sc.actor.session",
                    session_id = %self.session_id,
                    participant_id = %pending.participant_id,
                    command = command.as_str(),
                    local_seq = pending.local_seq,
                    degraded = pending.degraded,
                    revision = self.state.revision,
                    "Command applied"
                );
            }
        }

        if changed {
            self.publish_state();
        }
    }

    /// Broadcast the current state and actuate the embedded engine.
    fn publish_state(&mut self) {
        self.broadcast(&ServerMessage::broadcast(&self.state));
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.apply(&self.state, host_now_ms());
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn activate(&mut self) {
        self.status = SessionStatus::Active;
        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            "Session active"
        );
        if let Some(advertiser) = &self.advertiser {
            advertiser.advertise();
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let timeout = self.policy.heartbeat_timeout;

        let expired: Vec<ParticipantId> = self
            .participants
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) >= timeout)
            .map(|p| p.participant_id)
            .collect();
        for participant_id in expired {
            if self.status.is_terminal() {
                break;
            }
            self.remove_participant(participant_id, LeaveReason::Timeout);
        }

        if self.pin.as_ref().is_some_and(|pin| now >= pin.expires_at()) {
            self.pin = None;
        }

        if self.status == SessionStatus::HostMigration {
            self.try_elect();
        }
        if let (SessionStatus::HostMigration, Some(started)) = (self.status, self.migration_started)
        {
            if now.saturating_duration_since(started) >= self.policy.migration_grace {
                warn!(
                    target: "sc.actor.session",
                    session_id = %self.session_id,
                    "No eligible host within grace period"
                );
                metrics::record_host_migration("closed");
                self.close(CloseReason::HostUnavailable);
            }
        }

        // Nobody ever attached and the host token has expired
        if !self.ever_attached
            && !self.status.is_terminal()
            && now.saturating_duration_since(self.created_at) >= self.policy.token_ttl
        {
            self.close(CloseReason::Empty);
        }
    }

    fn begin_migration(&mut self) {
        self.status = SessionStatus::HostMigration;
        self.migration_started = Some(Instant::now());
        self.host_id = None;

        warn!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            "Host lost, starting host migration"
        );
        self.broadcast(&ServerMessage::RoleChanged { new_host_id: None });
        self.try_elect();
    }

    /// Elect the earliest-joined eligible participant, if any.
    fn try_elect(&mut self) {
        let now = Instant::now();
        let timeout = self.policy.heartbeat_timeout;

        let Some(candidate) = self.participants.values().find(|p| {
            p.is_connected()
                && now.saturating_duration_since(p.last_seen) < timeout
                && p.clock.quality == SyncQuality::Good
        }) else {
            debug!(
                target: "sc.actor.session",
                session_id = %self.session_id,
                "No eligible host yet"
            );
            return;
        };

        let new_host = candidate.participant_id;
        let join_order = candidate.join_order;
        let host_now = host_now_ms();
        let (position_ms, playing) = match candidate.playback_report {
            Some(report) => {
                let reported_at = candidate
                    .clock
                    .corrected_host_time(report.local_timestamp_ms)
                    .host_time_ms;
                let elapsed = u64::try_from(host_now.saturating_sub(reported_at)).unwrap_or(0);
                let position = if report.playing {
                    report.position_ms.saturating_add(elapsed)
                } else {
                    report.position_ms
                };
                (position, report.playing)
            }
            None => (self.state.position_at(host_now), self.state.is_playing()),
        };

        playback::reseed(&mut self.state, position_ms, playing, host_now);
        self.host_id = Some(new_host);
        self.status = SessionStatus::Active;
        self.migration_started = None;
        metrics::record_host_migration("elected");

        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            new_host_id = %new_host,
            join_order,
            revision = self.state.revision,
            "New host elected"
        );

        self.broadcast(&ServerMessage::RoleChanged {
            new_host_id: Some(new_host),
        });
        self.publish_state();
    }

    /// Close the session: notify, withdraw, release every connection.
    fn close(&mut self, reason: CloseReason) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SessionStatus::Closing;
        info!(
            target: "sc.actor.session",
            session_id = %self.session_id,
            reason = reason.as_str(),
            "Session closing"
        );

        self.broadcast(&ServerMessage::SessionClosed { reason });
        if let Some(advertiser) = &self.advertiser {
            advertiser.withdraw();
        }
        self.pin = None;
        for participant in self.participants.values_mut() {
            participant.disconnect();
        }
        self.cancel_token.cancel();

        self.status = SessionStatus::Closed;
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn participant(&self, participant_id: &ParticipantId) -> Option<&Participant> {
        self.index
            .get(participant_id)
            .and_then(|order| self.participants.get(order))
    }

    fn participant_mut(&mut self, participant_id: &ParticipantId) -> Option<&mut Participant> {
        self.index
            .get(participant_id)
            .and_then(|order| self.participants.get_mut(order))
    }

    fn broadcast(&self, message: &ServerMessage) {
        for participant in self.participants.values() {
            participant.deliver(message.clone());
        }
    }

    fn broadcast_except(&self, skip: ParticipantId, message: &ServerMessage) {
        for participant in self.participants.values() {
            if participant.participant_id != skip {
                participant.deliver(message.clone());
            }
        }
    }

    fn send_error(&self, participant_id: &ParticipantId, error: &ScError) {
        if let Some(participant) = self.participant(participant_id) {
            participant.deliver(ServerMessage::Error {
                kind: error.error_kind(),
                message: error.client_message(),
            });
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id,
            status: self.status,
            participant_count: self.participants.len(),
            connected_count: self
                .participants
                .values()
                .filter(|p| p.is_connected())
                .count(),
            revision: self.state.revision,
            host_id: self.host_id,
            playback_state: self.state.clone(),
            public: self.policy.public,
            chat_enabled: self.policy.chat_enabled,
        }
    }
}

/// Next report from the embedded engine; pending forever without one.
async fn next_track_end(track_ends: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match track_ends {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn default_display_name(participant_id: ParticipantId) -> String {
    let short: String = participant_id.to_string().chars().take(8).collect();
    format!("Listener {short}")
}
