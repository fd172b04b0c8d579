//! Devices with skewed clocks.
//!
//! A participant whose clock runs 200ms ahead of the host must still have its
//! commands ordered by host time, and must render broadcasts at the
//! host-predicted position.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use common::types::SessionId;
use sc_test_utils::{test_config, MockAudioEngine, TestClient, TestServer};
use session_controller::clock_sync::SyncQuality;
use session_controller::follower::{PlaybackRenderer, RenderOutcome};
use sync_protocol::{PlaybackCommand, TransportState};

const SKEW_MS: i64 = 200;

/// Loopback round trips are tiny; the estimate should land close to the skew.
const OFFSET_TOLERANCE_MS: i64 = 30;

async fn follower_with_offset(
    server: &TestServer,
    session_id: &SessionId,
    offset_ms: i64,
) -> TestClient {
    let descriptor = server
        .registry
        .create_join_descriptor(session_id)
        .await
        .unwrap();
    let issued = server
        .registry
        .redeem_descriptor(&descriptor.descriptor, None)
        .await
        .unwrap();
    TestClient::connect_with_offset(server.sync_addr, &issued.token, offset_ms)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_clock_estimate_converges_to_offset() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let _host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();

    let mut client = follower_with_offset(&server, &created.session_id, SKEW_MS).await;
    client.sync_clock(1).await.unwrap();
    assert_eq!(client.clock().quality(), SyncQuality::Degraded);

    client.sync_clock(5).await.unwrap();
    assert_eq!(client.clock().quality(), SyncQuality::Good);

    // Offset is host minus local: the local clock is ahead, so it is negative
    let offset = client.clock().offset_ms().unwrap();
    assert!(
        (offset + SKEW_MS).abs() <= OFFSET_TOLERANCE_MS,
        "offset {offset} not within {OFFSET_TOLERANCE_MS}ms of -{SKEW_MS}"
    );
    assert!(client.clock().rtt_ms().unwrap() >= 0);

    server.stop().await;
}

#[tokio::test]
async fn test_skewed_commands_are_ordered_by_host_time() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();
    host.command(PlaybackCommand::AddTrack {
        track_id: "track-a".to_string(),
    })
    .await
    .unwrap();
    let initial = host.next_state().await.unwrap();

    let mut ahead = follower_with_offset(&server, &created.session_id, SKEW_MS).await;
    let mut exact = follower_with_offset(&server, &created.session_id, 0).await;
    ahead.sync_clock(4).await.unwrap();
    exact.sync_clock(4).await.unwrap();

    // `ahead` acts first in real time, but its raw timestamp is 200ms later.
    // Both land in the same 100ms window.
    ahead
        .command(PlaybackCommand::Seek { position_ms: 10_000 })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    exact
        .command(PlaybackCommand::Seek { position_ms: 20_000 })
        .await
        .unwrap();

    let state = host.next_state().await.unwrap();
    assert_eq!(state.position_ms, 20_000, "The later seek in host time wins");
    assert_eq!(state.revision, initial.revision + 2);

    server.stop().await;
}

#[tokio::test]
async fn test_skewed_follower_renders_host_position() {
    let server = TestServer::start(test_config()).await;
    let created = server.create_session().await;
    let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
        .await
        .unwrap();

    let mut device = follower_with_offset(&server, &created.session_id, SKEW_MS).await;
    device.sync_clock(5).await.unwrap();

    host.command(PlaybackCommand::AddTrack {
        track_id: "track-a".to_string(),
    })
    .await
    .unwrap();
    host.command(PlaybackCommand::Seek {
        position_ms: 60_000,
    })
    .await
    .unwrap();
    host.command(PlaybackCommand::Play).await.unwrap();

    let state = device
        .recv_until(|m| match m {
            sync_protocol::ServerMessage::StateBroadcast { playback_state, .. }
                if playback_state.transport == TransportState::Playing =>
            {
                Some(playback_state.clone())
            }
            _ => None,
        })
        .await
        .unwrap();

    let engine = MockAudioEngine::new();
    let calls = engine.calls();
    let mut renderer = PlaybackRenderer::new(Box::new(engine));

    let outcome = renderer.apply_local(&state, device.clock(), device.local_now_ms());
    assert_eq!(outcome, RenderOutcome::Applied { seeked: true });
    let seeks = MockAudioEngine::seeks(&calls);
    assert_eq!(seeks.len(), 1);

    // Had the raw local clock been used, the seek would land ~200ms too far
    let host_now = chrono::Utc::now().timestamp_millis();
    let expected = state.position_at(host_now);
    let seek = seeks.first().copied().unwrap();
    let error = i64::try_from(expected).unwrap() - i64::try_from(seek).unwrap();
    assert!(
        error.abs() <= OFFSET_TOLERANCE_MS,
        "seeked to {seek}, host predicts {expected}"
    );
    assert!(renderer.engine().is_playing());

    // The same revision again is stale and touches nothing
    let before = calls.lock().unwrap().len();
    assert_eq!(
        renderer.apply_local(&state, device.clock(), device.local_now_ms()),
        RenderOutcome::Stale
    );
    assert_eq!(calls.lock().unwrap().len(), before);

    server.stop().await;
}
