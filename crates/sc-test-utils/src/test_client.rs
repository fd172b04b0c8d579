//! Participant over a real TCP connection.
//!
//! Speaks the framed sync protocol the way a device would: `hello` first,
//! then commands, heartbeats and clock probes. All local timestamps are taken
//! from the wall clock plus the client's configured offset.

use anyhow::{anyhow, bail, Context, Result};
use common::types::{ParticipantId, Role, SessionId};
use futures_util::{SinkExt, StreamExt};
use session_controller::clock_sync::{ClockSample, ClockSyncEngine};
use std::net::SocketAddr;
use std::time::Duration;
use sync_protocol::{
    ClientCodec, ClientMessage, LocalPlayback, PlaybackCommand, PlaybackState, ServerMessage,
};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// How long `recv` waits before failing the test.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected, welcomed participant.
#[derive(Debug)]
pub struct TestClient {
    framed: Framed<TcpStream, ClientCodec>,
    clock_offset_ms: i64,
    clock: ClockSyncEngine,
    next_seq: u64,
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub role: Role,
    pub host_id: Option<ParticipantId>,
    pub resume_token: String,
    pub welcome_state: PlaybackState,
}

impl TestClient {
    /// Connect with the local clock equal to the host clock.
    ///
    /// # Errors
    ///
    /// Fails if the connection is refused or the first reply is not `welcome`.
    pub async fn connect(addr: SocketAddr, token: &str) -> Result<Self> {
        Self::connect_with_offset(addr, token, 0).await
    }

    /// Connect with a local clock `clock_offset_ms` ahead of the host clock.
    ///
    /// # Errors
    ///
    /// Fails if the connection is refused or the first reply is not `welcome`.
    pub async fn connect_with_offset(
        addr: SocketAddr,
        token: &str,
        clock_offset_ms: i64,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, ClientCodec::new());

        framed
            .send(ClientMessage::Hello {
                token: token.to_string(),
            })
            .await?;

        let reply = tokio::time::timeout(RECV_TIMEOUT, framed.next())
            .await
            .context("welcome timed out")?
            .ok_or_else(|| anyhow!("connection closed before welcome"))??;

        match reply {
            ServerMessage::Welcome {
                session_id,
                participant_id,
                role,
                host_id,
                resume_token,
                playback_state,
                ..
            } => Ok(Self {
                framed,
                clock_offset_ms,
                clock: ClockSyncEngine::new(8),
                next_seq: 1,
                session_id,
                participant_id,
                role,
                host_id,
                resume_token,
                welcome_state: playback_state,
            }),
            ServerMessage::Error { kind, message } => {
                bail!("refused: {} ({message})", kind.as_str())
            }
            other => bail!("expected welcome, got {other:?}"),
        }
    }

    /// Send `hello` and return the first reply, whatever it is.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or timeout.
    pub async fn hello_reply(addr: SocketAddr, token: &str) -> Result<ServerMessage> {
        let stream = TcpStream::connect(addr).await?;
        let mut framed = Framed::new(stream, ClientCodec::new());
        framed
            .send(ClientMessage::Hello {
                token: token.to_string(),
            })
            .await?;
        tokio::time::timeout(RECV_TIMEOUT, framed.next())
            .await
            .context("reply timed out")?
            .ok_or_else(|| anyhow!("connection closed without reply"))?
            .map_err(Into::into)
    }

    #[must_use]
    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    /// This client's local wall clock.
    #[must_use]
    pub fn local_now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.clock_offset_ms
    }

    /// The client's own clock estimate.
    #[must_use]
    pub fn clock(&self) -> &ClockSyncEngine {
        &self.clock
    }

    /// # Errors
    ///
    /// Fails if the socket is closed.
    pub async fn send(&mut self, message: ClientMessage) -> Result<()> {
        self.framed.send(message).await.map_err(Into::into)
    }

    /// Send a command stamped with the local clock; returns its sequence number.
    ///
    /// # Errors
    ///
    /// Fails if the socket is closed.
    pub async fn command(&mut self, command: PlaybackCommand) -> Result<u64> {
        let local_seq = self.next_seq;
        self.next_seq += 1;
        let local_timestamp_ms = self.local_now_ms();
        self.send(ClientMessage::Command {
            command,
            local_seq,
            local_timestamp_ms,
        })
        .await?;
        Ok(local_seq)
    }

    /// Heartbeat, optionally reporting the local player.
    ///
    /// # Errors
    ///
    /// Fails if the socket is closed.
    pub async fn heartbeat(&mut self, position_ms: Option<(u64, bool)>) -> Result<()> {
        let playback = position_ms.map(|(position_ms, playing)| LocalPlayback {
            position_ms,
            local_timestamp_ms: self.local_now_ms(),
            playing,
        });
        self.send(ClientMessage::Heartbeat { playback }).await
    }

    /// Run `rounds` probe exchanges, feeding both the local estimator and the
    /// server's (via `clock_report`). Other messages arriving meanwhile are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or timeout.
    pub async fn sync_clock(&mut self, rounds: usize) -> Result<()> {
        for _ in 0..rounds {
            let t1 = self.local_now_ms();
            self.send(ClientMessage::ClockProbe { t1 }).await?;
            let (t2, t3) = loop {
                match self.recv().await? {
                    ServerMessage::ClockProbeReply { t1: echoed, t2, t3 } if echoed == t1 => {
                        break (t2, t3)
                    }
                    _ => {}
                }
            };
            let t4 = self.local_now_ms();
            self.clock.record(ClockSample { t1, t2, t3, t4 });
            self.send(ClientMessage::ClockReport { t1, t2, t3, t4 })
                .await?;
        }
        Ok(())
    }

    /// Next message from the server.
    ///
    /// # Errors
    ///
    /// Fails on timeout, decode error or closed connection.
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .context("recv timed out")?
            .ok_or_else(|| anyhow!("connection closed"))?
            .map_err(Into::into)
    }

    /// Skip messages until `select` returns `Some`.
    ///
    /// # Errors
    ///
    /// Fails if the connection ends or no match arrives in time.
    pub async fn recv_until<T>(
        &mut self,
        mut select: impl FnMut(&ServerMessage) -> Option<T>,
    ) -> Result<T> {
        loop {
            let message = self.recv().await?;
            if let Some(found) = select(&message) {
                return Ok(found);
            }
        }
    }

    /// Next state broadcast, skipping everything else.
    ///
    /// # Errors
    ///
    /// Fails if the connection ends or nothing arrives in time.
    pub async fn next_state(&mut self) -> Result<PlaybackState> {
        self.recv_until(|message| match message {
            ServerMessage::StateBroadcast { playback_state, .. } => Some(playback_state.clone()),
            _ => None,
        })
        .await
    }

    /// Whether the server closed the connection (after draining what is left).
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.framed.next()).await {
                Ok(None | Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => {}
                Err(_) => return false,
            }
        }
    }
}
