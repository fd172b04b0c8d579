//! `ConnectionActor` - per-participant connection task.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one framed byte stream (normally a TCP socket)
//! - Authenticates the first frame (`hello`) and attaches to a session
//! - Owns the connection's [`ClockSyncEngine`]; clock probes are answered
//!   here and never reach the session
//! - Corrects command timestamps to host time and forwards inbound messages to
//!   the `SessionActor`
//! - Writes the session's outbound queue to the socket
//!
//! # Lifecycle
//!
//! 1. `hello{token}` must arrive within [`HELLO_TIMEOUT`]
//! 2. Runs until the socket closes, the participant leaves, or the attach
//!    cancellation token fires (session closed, participant revoked, or a newer
//!    connection replaced this one)
//! 3. On exit the session is told to detach, unless the participant left

use super::messages::AttachAccepted;
use super::metrics::{ActorMetrics, CONNECTION_MAILBOX_WARNING};
use super::registry::SessionRegistry;
use super::session::SessionHandle;
use crate::clock_sync::{host_now_ms, ClockSample, ClockSyncEngine, SampleOutcome};
use crate::errors::ScError;
use crate::observability::metrics;

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sync_protocol::{
    is_valid_track_id, ClientMessage, ErrorKind, PlaybackCommand, ServerCodec, ServerMessage,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Deadline for the first frame.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound queue between the session and this connection's writer.
const OUTBOUND_BUFFER: usize = CONNECTION_MAILBOX_WARNING;

/// Why the message loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Socket closed or failed; the participant keeps its slot.
    Disconnected,
    /// Participant sent `leave`.
    Left,
    /// Cancelled by the session or the server.
    Cancelled,
    /// Peer broke the protocol.
    Violation,
    /// Session actor is gone.
    SessionGone,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor<S> {
    framed: Framed<S, ServerCodec>,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    metrics: Arc<ActorMetrics>,
    clock: ClockSyncEngine,
    cancel_token: CancellationToken,
    /// A degraded-timestamp warning was already logged for this connection.
    warned_degraded: bool,
}

impl<S> ConnectionActor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn a connection actor over `stream`.
    ///
    /// `cancel_token` is the server's token; the session adds its own once
    /// attached.
    pub fn spawn(
        stream: S,
        peer: SocketAddr,
        registry: Arc<SessionRegistry>,
        clock_sample_window: usize,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let actor = Self {
            framed: Framed::new(stream, ServerCodec::new()),
            peer,
            metrics: Arc::clone(registry.metrics()),
            registry,
            clock: ClockSyncEngine::new(clock_sample_window),
            cancel_token,
            warned_degraded: false,
        };

        tokio::spawn(actor.run())
    }

    /// Run the connection to completion.
    #[instrument(skip_all, name = "sc.actor.connection", fields(peer = %self.peer))]
    async fn run(mut self) {
        self.metrics.connection_created();
        debug!(
            target: "sc.actor.connection",
            peer = %self.peer,
            "ConnectionActor started"
        );

        let Some((session, accepted, outbound)) = self.handshake().await else {
            self.metrics.connection_closed();
            return;
        };

        let exit = self.message_loop(&session, &accepted, outbound).await;

        if exit != Exit::Left && exit != Exit::SessionGone {
            // Best effort: the session may already be closed
            let _ = session
                .detach(accepted.participant_id, accepted.connection_id)
                .await;
        }

        info!(
            target: "sc.actor.connection",
            peer = %self.peer,
            session_id = %session.session_id(),
            participant_id = %accepted.participant_id,
            exit = ?exit,
            clock_samples = self.clock.sample_count(),
            "ConnectionActor stopped"
        );
        self.metrics.connection_closed();
    }

    /// Read `hello`, authenticate and attach. On failure the error is written
    /// to the peer and `None` returned.
    async fn handshake(
        &mut self,
    ) -> Option<(
        SessionHandle,
        AttachAccepted,
        mpsc::Receiver<ServerMessage>,
    )> {
        let first = tokio::select! {
            () = self.cancel_token.cancelled() => return None,
            result = tokio::time::timeout(HELLO_TIMEOUT, self.framed.next()) => result,
        };

        let token = match first {
            Ok(Some(Ok(ClientMessage::Hello { token }))) => token,
            Ok(Some(Ok(_))) => {
                self.refuse(&ScError::Protocol("expected hello".to_string()))
                    .await;
                return None;
            }
            Ok(Some(Err(e))) => {
                debug!(target: "sc.actor.connection", peer = %self.peer, error = %e, "Bad first frame");
                self.refuse(&ScError::Protocol("malformed frame".to_string()))
                    .await;
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                debug!(target: "sc.actor.connection", peer = %self.peer, "Hello timed out");
                self.refuse(&ScError::Protocol("hello timeout".to_string()))
                    .await;
                return None;
            }
        };

        let (claims, session) = match self.registry.authenticate(&token).await {
            Ok(found) => found,
            Err(e) => {
                self.refuse(&e).await;
                return None;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        match session.attach(claims, outbound_tx).await {
            Ok(accepted) => Some((session, accepted, outbound_rx)),
            Err(e) => {
                self.refuse(&e).await;
                None
            }
        }
    }

    async fn message_loop(
        &mut self,
        session: &SessionHandle,
        accepted: &AttachAccepted,
        mut outbound: mpsc::Receiver<ServerMessage>,
    ) -> Exit {
        loop {
            tokio::select! {
                () = accepted.cancel.cancelled() => {
                    // Flush what the session queued before cutting us off
                    while let Ok(message) = outbound.try_recv() {
                        if self.framed.feed(message).await.is_err() {
                            break;
                        }
                    }
                    let _ = self.framed.flush().await;
                    return Exit::Cancelled;
                }

                () = self.cancel_token.cancelled() => {
                    return Exit::Cancelled;
                }

                message = outbound.recv() => {
                    let Some(message) = message else {
                        return Exit::SessionGone;
                    };
                    if let Err(e) = self.framed.send(message).await {
                        debug!(
                            target: "sc.actor.connection",
                            peer = %self.peer,
                            error = %e,
                            "Write failed"
                        );
                        return Exit::Disconnected;
                    }
                }

                frame = self.framed.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            warn!(
                                target: "sc.actor.connection",
                                peer = %self.peer,
                                participant_id = %accepted.participant_id,
                                error = %e,
                                "Malformed frame"
                            );
                            self.refuse(&ScError::Protocol("malformed frame".to_string())).await;
                            return Exit::Violation;
                        }
                        None => return Exit::Disconnected,
                    };

                    match self.handle_inbound(session, accepted, message).await {
                        Ok(None) => {}
                        Ok(Some(exit)) => return exit,
                        Err(e) => {
                            debug!(
                                target: "sc.actor.connection",
                                participant_id = %accepted.participant_id,
                                error = %e,
                                "Session unavailable"
                            );
                            return Exit::SessionGone;
                        }
                    }
                }
            }
        }
    }

    /// Process one inbound message. `Ok(Some(_))` ends the loop.
    async fn handle_inbound(
        &mut self,
        session: &SessionHandle,
        accepted: &AttachAccepted,
        message: ClientMessage,
    ) -> Result<Option<Exit>, ScError> {
        let received_at = host_now_ms();
        let participant_id = accepted.participant_id;

        match message {
            ClientMessage::Hello { .. } => {
                self.refuse(&ScError::Protocol("duplicate hello".to_string()))
                    .await;
                return Ok(Some(Exit::Violation));
            }

            ClientMessage::Heartbeat { playback } => {
                session.heartbeat(participant_id, playback).await?;
                if self.framed.send(ServerMessage::Heartbeat).await.is_err() {
                    return Ok(Some(Exit::Disconnected));
                }
            }

            ClientMessage::ClockProbe { t1 } => {
                let reply = ServerMessage::ClockProbeReply {
                    t1,
                    t2: received_at,
                    t3: host_now_ms(),
                };
                if self.framed.send(reply).await.is_err() {
                    return Ok(Some(Exit::Disconnected));
                }
            }

            ClientMessage::ClockReport { t1, t2, t3, t4 } => {
                let sample = ClockSample { t1, t2, t3, t4 };
                if self.clock.record(sample) == SampleOutcome::Accepted {
                    metrics::record_clock_sample(sample.offset_ms(), sample.rtt_ms());
                    session
                        .clock_update(participant_id, self.clock.snapshot())
                        .await?;
                }
            }

            ClientMessage::Command {
                command,
                local_seq,
                local_timestamp_ms,
            } => {
                if let PlaybackCommand::AddTrack { track_id } = &command {
                    if !is_valid_track_id(track_id) {
                        self.refuse(&ScError::Protocol("malformed track id".to_string()))
                            .await;
                        return Ok(Some(Exit::Violation));
                    }
                }
                let corrected = self.clock.corrected_host_time(local_timestamp_ms);
                if corrected.degraded && !self.warned_degraded {
                    self.warned_degraded = true;
                    warn!(
                        target: "sc.actor.connection",
                        participant_id = %participant_id,
                        clock_samples = self.clock.sample_count(),
                        "Ordering commands by uncorrected timestamps"
                    );
                }
                session
                    .command(participant_id, command, local_seq, corrected)
                    .await?;
            }

            ClientMessage::Chat { text } => session.chat(participant_id, text).await?,

            ClientMessage::SyncRequest => session.sync_request(participant_id).await?,

            ClientMessage::TrackEnded { track_id } => {
                session.track_ended(Some(participant_id), track_id).await?;
            }

            ClientMessage::Leave => {
                session.leave(participant_id).await?;
                return Ok(Some(Exit::Left));
            }
        }

        Ok(None)
    }

    /// Write an error frame. Failures are ignored; the connection is ending.
    async fn refuse(&mut self, error: &ScError) {
        let kind = error.error_kind();
        if kind == ErrorKind::Internal {
            warn!(
                target: "sc.actor.connection",
                peer = %self.peer,
                error = %error,
                "Refusing connection"
            );
        } else {
            debug!(
                target: "sc.actor.connection",
                peer = %self.peer,
                kind = kind.as_str(),
                "Refusing connection"
            );
        }
        let _ = self
            .framed
            .send(ServerMessage::Error {
                kind,
                message: error.client_message(),
            })
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::registry::{CreateSessionOptions, RegistryOptions};
    use crate::config::SessionPolicy;
    use crate::pairing::PairingAuthority;
    use common::secret::SecretBox;
    use common::types::Role;
    use sync_protocol::ClientCodec;
    use tokio::io::DuplexStream;

    type Client = Framed<DuplexStream, ClientCodec>;

    fn registry() -> Arc<SessionRegistry> {
        let authority = PairingAuthority::new(
            SecretBox::new(Box::new(vec![0x42; 32])),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
        .unwrap();
        Arc::new(SessionRegistry::new(
            Arc::new(authority),
            SessionPolicy::default(),
            ActorMetrics::new(),
            RegistryOptions {
                max_sessions: 4,
                sync_address: "127.0.0.1:7420".to_string(),
                sync_port: 7420,
                default_host_name: "Test Host".to_string(),
            },
            CancellationToken::new(),
        ))
    }

    fn connect(registry: &Arc<SessionRegistry>) -> (Client, JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = ConnectionActor::spawn(
            server,
            "127.0.0.1:50000".parse().unwrap(),
            Arc::clone(registry),
            8,
            CancellationToken::new(),
        );
        (Framed::new(client, ClientCodec::new()), task)
    }

    async fn recv(client: &mut Client) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_hello_attaches_and_welcomes() {
        let registry = registry();
        let created = registry
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (mut client, _task) = connect(&registry);

        client
            .send(ClientMessage::Hello {
                token: created.host_token.token.clone(),
            })
            .await
            .unwrap();

        match recv(&mut client).await {
            ServerMessage::Welcome {
                session_id,
                role,
                resume_token,
                ..
            } => {
                assert_eq!(session_id, created.session_id);
                assert_eq!(role, Role::Host);
                assert_ne!(resume_token, created.host_token.token);
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_frame_must_be_hello() {
        let registry = registry();
        let (mut client, task) = connect(&registry);

        client.send(ClientMessage::SyncRequest).await.unwrap();
        assert!(matches!(
            recv(&mut client).await,
            ServerMessage::Error {
                kind: ErrorKind::ProtocolViolation,
                ..
            }
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_token_is_refused() {
        let registry = registry();
        let (mut client, task) = connect(&registry);

        client
            .send(ClientMessage::Hello {
                token: "garbage".to_string(),
            })
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut client).await,
            ServerMessage::Error {
                kind: ErrorKind::TokenInvalid,
                ..
            }
        ));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_timeout() {
        let registry = registry();
        let (mut client, task) = connect(&registry);

        tokio::time::advance(HELLO_TIMEOUT + Duration::from_millis(1)).await;
        assert!(matches!(
            recv(&mut client).await,
            ServerMessage::Error {
                kind: ErrorKind::ProtocolViolation,
                ..
            }
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_clock_probe_is_answered_and_heartbeat_echoed() {
        let registry = registry();
        let created = registry
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (mut client, _task) = connect(&registry);
        client
            .send(ClientMessage::Hello {
                token: created.host_token.token.clone(),
            })
            .await
            .unwrap();
        recv(&mut client).await;

        client
            .send(ClientMessage::ClockProbe { t1: 12_345 })
            .await
            .unwrap();
        match recv(&mut client).await {
            ServerMessage::ClockProbeReply { t1, t2, t3 } => {
                assert_eq!(t1, 12_345);
                assert!(t3 >= t2);
            }
            other => unreachable!("unexpected {other:?}"),
        }

        client
            .send(ClientMessage::Heartbeat { playback: None })
            .await
            .unwrap();
        assert_eq!(recv(&mut client).await, ServerMessage::Heartbeat);
    }

    #[tokio::test]
    async fn test_host_command_is_broadcast() {
        let registry = registry();
        let created = registry
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (mut client, _task) = connect(&registry);
        client
            .send(ClientMessage::Hello {
                token: created.host_token.token.clone(),
            })
            .await
            .unwrap();
        recv(&mut client).await;

        client
            .send(ClientMessage::Command {
                command: PlaybackCommand::AddTrack {
                    track_id: "song".to_string(),
                },
                local_seq: 1,
                local_timestamp_ms: host_now_ms(),
            })
            .await
            .unwrap();

        match recv(&mut client).await {
            ServerMessage::StateBroadcast {
                playback_state,
                revision,
            } => {
                assert_eq!(revision, 1);
                assert_eq!(playback_state.track_id.as_deref(), Some("song"));
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_track_id_is_refused_before_state_changes() {
        let registry = registry();
        let created = registry
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (mut client, task) = connect(&registry);
        client
            .send(ClientMessage::Hello {
                token: created.host_token.token.clone(),
            })
            .await
            .unwrap();
        recv(&mut client).await;

        client
            .send(ClientMessage::Command {
                command: PlaybackCommand::AddTrack {
                    track_id: "x".repeat(sync_protocol::MAX_TRACK_ID_BYTES + 1),
                },
                local_seq: 1,
                local_timestamp_ms: host_now_ms(),
            })
            .await
            .unwrap();

        assert!(matches!(
            recv(&mut client).await,
            ServerMessage::Error {
                kind: ErrorKind::ProtocolViolation,
                ..
            }
        ));
        task.await.unwrap();

        let state = created.handle.get_state().await.unwrap();
        assert!(state.playback_state.queue.is_empty());
        assert_eq!(state.playback_state.revision, 0);
    }

    #[tokio::test]
    async fn test_host_track_end_advances_queue() {
        let registry = registry();
        let created = registry
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let (mut client, _task) = connect(&registry);
        client
            .send(ClientMessage::Hello {
                token: created.host_token.token.clone(),
            })
            .await
            .unwrap();
        recv(&mut client).await;

        for (seq, track) in [(1, "first"), (2, "second")] {
            client
                .send(ClientMessage::Command {
                    command: PlaybackCommand::AddTrack {
                        track_id: track.to_string(),
                    },
                    local_seq: seq,
                    local_timestamp_ms: host_now_ms(),
                })
                .await
                .unwrap();
            recv(&mut client).await;
        }

        client
            .send(ClientMessage::TrackEnded {
                track_id: "first".to_string(),
            })
            .await
            .unwrap();

        match recv(&mut client).await {
            ServerMessage::StateBroadcast { playback_state, .. } => {
                assert_eq!(playback_state.track_id.as_deref(), Some("second"));
                assert_eq!(playback_state.current_index, Some(1));
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_removes_participant() {
        let registry = registry();
        let created = registry
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap();
        let follower = created
            .handle
            .issue_token(common::types::ParticipantId::new(), Role::Follower, None)
            .await
            .unwrap();

        let (mut host, _host_task) = connect(&registry);
        host.send(ClientMessage::Hello {
            token: created.host_token.token.clone(),
        })
        .await
        .unwrap();
        recv(&mut host).await;

        let (mut guest, guest_task) = connect(&registry);
        guest
            .send(ClientMessage::Hello {
                token: follower.token.clone(),
            })
            .await
            .unwrap();
        recv(&mut guest).await;
        assert!(matches!(
            recv(&mut host).await,
            ServerMessage::ParticipantJoined { .. }
        ));

        guest.send(ClientMessage::Leave).await.unwrap();
        guest_task.await.unwrap();
        assert!(matches!(
            recv(&mut host).await,
            ServerMessage::ParticipantLeft { .. }
        ));

        let state = created.handle.get_state().await.unwrap();
        assert_eq!(state.participant_count, 1);
    }
}
