//! End-to-end session flow over real TCP connections.
//!
//! Covers pairing (descriptor and PIN), the handshake, command propagation,
//! token replay and resume tokens.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use common::jwt::TokenError;
use common::secret::{ExposeSecret, SecretString};
use common::types::{Role, SessionId};
use sc_test_utils::{
    test_config, test_config_with, AudioCall, MockAudioEngine, TestClient, TestServer,
};
use session_controller::actors::SessionStatus;
use session_controller::errors::ScError;
use sync_protocol::{CloseReason, ErrorKind, PlaybackCommand, ServerMessage, TransportState};

// ============================================================================
// Helpers
// ============================================================================

/// Follower token obtained through a join descriptor.
async fn follower_token(server: &TestServer, session_id: &SessionId, name: &str) -> String {
    let descriptor = server
        .registry
        .create_join_descriptor(session_id)
        .await
        .unwrap();
    server
        .registry
        .redeem_descriptor(&descriptor.uri, Some(name.to_string()))
        .await
        .unwrap()
        .token
}

// ============================================================================
// Pairing and handshake
// ============================================================================

#[tokio::test]
async fn test_host_and_follower_share_state() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;

    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    assert!(host.is_host());
    assert_eq!(host.participant_id, created.host_id);
    assert_eq!(host.welcome_state.revision, 0);

    // The first host command activates the session and applies immediately
    host.command(PlaybackCommand::AddTrack {
        track_id: "track-a".to_string(),
    })
    .await
    .unwrap();
    let state = host.next_state().await.unwrap();
    assert_eq!(state.revision, 1);
    assert_eq!(state.track_id.as_deref(), Some("track-a"));

    let token = follower_token(&server, &created.session_id, "Bea").await;
    let mut follower = TestClient::connect(server.sync_addr, &token).await.unwrap();
    assert_eq!(follower.role, Role::Follower);
    assert_eq!(follower.host_id, Some(created.host_id));
    assert_eq!(follower.welcome_state, state);

    let joined = host
        .recv_until(|message| match message {
            ServerMessage::ParticipantJoined {
                participant_id,
                display_name,
            } => Some((*participant_id, display_name.clone())),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(joined, (follower.participant_id, "Bea".to_string()));

    // A follower command goes through the reconciliation window, then reaches everyone
    follower.command(PlaybackCommand::Play).await.unwrap();
    let at_host = host.next_state().await.unwrap();
    let at_follower = follower.next_state().await.unwrap();
    assert_eq!(at_host, at_follower);
    assert_eq!(at_host.revision, 2);
    assert_eq!(at_host.transport, TransportState::Playing);

    let snapshot = created.handle.get_state().await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Active);
    assert_eq!(snapshot.participant_count, 2);

    server.stop().await;
}

#[tokio::test]
async fn test_replayed_token_is_refused() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let _host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();

    let reply = TestClient::hello_reply(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    assert!(matches!(
        reply,
        ServerMessage::Error {
            kind: ErrorKind::TokenRevoked,
            ..
        }
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_resume_token_reattaches_same_participant() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    let resume_token = host.resume_token.clone();
    let participant_id = host.participant_id;
    drop(host);

    // The slot survives the dropped socket until the heartbeat timeout
    let host = TestClient::connect(server.sync_addr, &resume_token)
        .await
        .unwrap();
    assert_eq!(host.participant_id, participant_id);
    assert!(host.is_host());

    let snapshot = created.handle.get_state().await.unwrap();
    assert_eq!(snapshot.participant_count, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_session_token_is_rejected() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    server
        .registry
        .close_session(&created.session_id, CloseReason::HostEnded)
        .await
        .unwrap();

    let reply = TestClient::hello_reply(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    assert!(matches!(
        reply,
        ServerMessage::Error {
            kind: ErrorKind::SessionNotFound,
            ..
        }
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_expired_descriptor_is_token_expired() {
    let server = TestServer::start(test_config_with(&[("SC_DESCRIPTOR_TTL_SECONDS", "1")])).await;
    let created = server.create_session().await;
    let descriptor = server
        .registry
        .create_join_descriptor(&created.session_id)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2_100)).await;

    let result = server
        .registry
        .redeem_descriptor(&descriptor.descriptor, None)
        .await;
    assert!(matches!(
        result,
        Err(ScError::Token(TokenError::Expired))
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_tampered_descriptor_is_rejected() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let descriptor = server
        .registry
        .create_join_descriptor(&created.session_id)
        .await
        .unwrap();

    let middle = descriptor.descriptor.len() / 2;
    let tampered: String = descriptor
        .descriptor
        .chars()
        .enumerate()
        .map(|(i, c)| match (i == middle, c) {
            (true, 'A') => 'B',
            (true, _) => 'A',
            (false, c) => c,
        })
        .collect();

    let result = server.registry.redeem_descriptor(&tampered, None).await;
    assert!(matches!(result, Err(ScError::Encoding(_))));

    server.stop().await;
}

#[tokio::test]
async fn test_pin_pairing_and_single_use() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let _host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();

    let grant = server.registry.create_pin(&created.session_id).await.unwrap();
    let pin = grant.pin.expose_secret().to_string();
    assert_eq!(pin.len(), 6);
    assert!(pin.chars().all(|c| c.is_ascii_digit()));

    let issued = server
        .registry
        .redeem_pin(
            &created.session_id,
            SecretString::from(pin.clone()),
            Some("Cam".to_string()),
        )
        .await
        .unwrap();
    let follower = TestClient::connect(server.sync_addr, &issued.token)
        .await
        .unwrap();
    assert_eq!(follower.role, Role::Follower);

    let second = server
        .registry
        .redeem_pin(&created.session_id, SecretString::from(pin), None)
        .await;
    assert!(matches!(second, Err(ScError::Token(_))));

    server.stop().await;
}

// ============================================================================
// Participant behavior
// ============================================================================

#[tokio::test]
async fn test_follower_command_before_start_is_not_active() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let _host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();

    let token = follower_token(&server, &created.session_id, "Dee").await;
    let mut follower = TestClient::connect(server.sync_addr, &token).await.unwrap();
    follower.command(PlaybackCommand::Play).await.unwrap();

    let kind = follower
        .recv_until(|message| match message {
            ServerMessage::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(kind, ErrorKind::NotActive);
    assert!(!kind.is_fatal());

    server.stop().await;
}

#[tokio::test]
async fn test_chat_reaches_other_participants() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    let token = follower_token(&server, &created.session_id, "Eli").await;
    let mut follower = TestClient::connect(server.sync_addr, &token).await.unwrap();

    follower
        .send(sync_protocol::ClientMessage::Chat {
            text: "hello there".to_string(),
        })
        .await
        .unwrap();

    let (from, text) = host
        .recv_until(|message| match message {
            ServerMessage::Chat {
                participant_id,
                text,
            } => Some((*participant_id, text.clone())),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(from, follower.participant_id);
    assert_eq!(text, "hello there");

    server.stop().await;
}

#[tokio::test]
async fn test_embedded_engine_track_end_advances_everyone() {
    let server = TestServer::start(test_config()).await;
    let engine = MockAudioEngine::new();
    let calls = engine.calls();
    let created = server
        .create_session_with_engine(Box::new(engine.clone()))
        .await;
    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    let token = follower_token(&server, &created.session_id, "Fay").await;
    let mut follower = TestClient::connect(server.sync_addr, &token).await.unwrap();

    for track in ["intro", "outro"] {
        host.command(PlaybackCommand::AddTrack {
            track_id: track.to_string(),
        })
        .await
        .unwrap();
        host.next_state().await.unwrap();
    }
    host.command(PlaybackCommand::Play).await.unwrap();
    let playing = host.next_state().await.unwrap();
    assert_eq!(playing.track_id.as_deref(), Some("intro"));

    assert!(engine.end_track("intro"));
    let advanced = follower
        .recv_until(|message| match message {
            ServerMessage::StateBroadcast { playback_state, .. }
                if playback_state.track_id.as_deref() == Some("outro") =>
            {
                Some(playback_state.clone())
            }
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(advanced.current_index, Some(1));
    assert_eq!(advanced.transport, TransportState::Playing);
    assert!(calls
        .lock()
        .unwrap()
        .contains(&AudioCall::Load("outro".to_string())));

    // Queue exhausted: the next end has nowhere to go
    let revision = advanced.revision;
    assert!(engine.end_track("outro"));
    let snapshot = created.handle.get_state().await.unwrap();
    assert_eq!(snapshot.revision, revision);

    server.stop().await;
}

#[tokio::test]
async fn test_queue_limit_reported_as_queue_full() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();

    for i in 0..sync_protocol::MAX_QUEUE_LEN {
        host.command(PlaybackCommand::AddTrack {
            track_id: format!("track-{i}"),
        })
        .await
        .unwrap();
        host.next_state().await.unwrap();
    }
    host.command(PlaybackCommand::AddTrack {
        track_id: "overflow".to_string(),
    })
    .await
    .unwrap();

    let kind = host
        .recv_until(|message| match message {
            ServerMessage::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(kind, ErrorKind::QueueFull);

    // Still connected, and the state stayed within bounds
    host.send(sync_protocol::ClientMessage::SyncRequest)
        .await
        .unwrap();
    let state = host.next_state().await.unwrap();
    assert_eq!(state.queue.len(), sync_protocol::MAX_QUEUE_LEN);

    server.stop().await;
}

#[tokio::test]
async fn test_host_close_notifies_and_disconnects() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    let token = follower_token(&server, &created.session_id, "Fay").await;
    let mut follower = TestClient::connect(server.sync_addr, &token).await.unwrap();

    host.send(sync_protocol::ClientMessage::Leave).await.unwrap();

    // Host left while forming: the session ends
    let reason = follower
        .recv_until(|message| match message {
            ServerMessage::SessionClosed { reason } => Some(*reason),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::HostEnded);
    assert!(follower.is_closed().await);

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_refuses_new_ones() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();

    let registry = std::sync::Arc::clone(&server.registry);
    registry.shutdown().await;

    let reason = host
        .recv_until(|message| match message {
            ServerMessage::SessionClosed { reason } => Some(*reason),
            _ => None,
        })
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Shutdown);
    assert_eq!(registry.session_count().await, 0);
    assert!(matches!(
        registry
            .create_session(session_controller::actors::CreateSessionOptions::default())
            .await,
        Err(ScError::CapacityExceeded)
    ));

    server.stop().await;
}
