//! Session and pairing handlers.
//!
//! Implements:
//!
//! - `POST /api/v1/sessions` - Create a session, returns the host token
//! - `GET /api/v1/sessions/{id}` - Session summary
//! - `POST /api/v1/sessions/{id}/descriptor` - Join descriptor (host bearer)
//! - `POST /api/v1/sessions/{id}/descriptor/qr` - Join descriptor as an SVG code (host bearer)
//! - `POST /api/v1/sessions/{id}/pin` - Pairing PIN (host bearer)
//! - `POST /api/v1/sessions/{id}/pin/redeem` - PIN to follower token
//! - `POST /api/v1/join` - Join descriptor to follower token
//! - `DELETE /api/v1/sessions/{id}` - Close the session (host bearer)
//! - `DELETE /api/v1/sessions/{id}/participants/{participant_id}` - Revoke (host bearer)
//!
//! # Security
//!
//! - Host bearer checks never consume the token's nonce
//! - Tokens, descriptors and PINs are never logged
//! - Unknown and malformed session ids both answer 404

use crate::actors::SessionStatus;
use crate::errors::ScError;
use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, StatusCode,
    },
    Json,
};
use common::jwt::TokenError;
use common::secret::{ExposeSecret, SecretString};
use common::types::{ParticipantId, SessionId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use sync_protocol::CloseReason;
use tracing::{info, instrument};

use crate::actors::CreateSessionOptions;
use crate::pairing::{IssuedToken, JoinDescriptor};

/// Longest accepted display name.
const MAX_DISPLAY_NAME_CHARS: usize = 64;

// ============================================================================
// Models
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub host_display_name: Option<String>,
    /// Advertise on the local network; server default when absent.
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub chat_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub descriptor: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
pub struct RedeemPinRequest {
    pub pin: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Credentials for connecting to the sync server.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinGrant {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub token: String,
    pub sync_address: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: String,
    pub participant_count: usize,
    pub revision: u64,
    pub host_id: Option<ParticipantId>,
    pub is_public: bool,
    pub chat_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PinResponse {
    pub pin: String,
    pub expires_at: i64,
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_session_id(raw: &str) -> Result<SessionId, ScError> {
    SessionId::from_str(raw).map_err(|_| ScError::SessionNotFound)
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ScError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "sc.routes", error = %e, "Invalid request body");
        ScError::Protocol("Invalid request body".to_string())
    })
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ScError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ScError::Token(TokenError::Invalid))
}

fn clean_display_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().chars().take(MAX_DISPLAY_NAME_CHARS).collect::<String>())
        .filter(|n| !n.is_empty())
}

fn grant(issued: IssuedToken, sync_address: &str) -> JoinGrant {
    JoinGrant {
        session_id: issued.claims.sid,
        participant_id: issued.claims.sub,
        token: issued.token,
        sync_address: sync_address.to_string(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for POST /api/v1/sessions
///
/// # Response
///
/// - 201 Created: host credentials
/// - 400 Bad Request: invalid body
/// - 503 Service Unavailable: session limit reached
#[instrument(skip_all, name = "sc.routes.create_session")]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<JoinGrant>), ScError> {
    let request: CreateSessionRequest = if body.is_empty() {
        CreateSessionRequest::default()
    } else {
        parse_body(&body)?
    };

    let created = state
        .registry
        .create_session(CreateSessionOptions {
            host_display_name: clean_display_name(request.host_display_name),
            public: request.is_public,
            chat_enabled: request.chat_enabled,
            engine: None,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(grant(created.host_token, state.registry.sync_address())),
    ))
}

/// Handler for GET /api/v1/sessions/{id}
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, ScError> {
    let session_id = parse_session_id(&session_id)?;
    let snapshot = state.registry.get(&session_id).await?.get_state().await?;

    if snapshot.status == SessionStatus::Closed {
        return Err(ScError::SessionNotFound);
    }

    Ok(Json(SessionSummary {
        session_id: snapshot.session_id,
        status: snapshot.status.as_str().to_string(),
        participant_count: snapshot.participant_count,
        revision: snapshot.revision,
        host_id: snapshot.host_id,
        is_public: snapshot.public,
        chat_enabled: snapshot.chat_enabled,
    }))
}

/// Handler for POST /api/v1/sessions/{id}/descriptor
///
/// # Response
///
/// - 200 OK: descriptor, URI for a scannable code, expiry
/// - 400 Bad Request: session no longer exists
/// - 401/403: bearer is not the current host
/// - 409 Conflict: session is closing
#[instrument(skip(state, headers))]
pub async fn create_descriptor(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<JoinDescriptor>, ScError> {
    let session_id = parse_session_id(&session_id)?;
    state
        .registry
        .authorize_host(&session_id, bearer_token(&headers)?)
        .await?;

    let descriptor = state.registry.create_join_descriptor(&session_id).await?;
    Ok(Json(descriptor))
}

/// Handler for POST /api/v1/sessions/{id}/descriptor/qr
///
/// Same checks as the descriptor route; answers `image/svg+xml`.
#[instrument(skip(state, headers))]
pub async fn create_descriptor_qr(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<([(axum::http::HeaderName, &'static str); 1], String), ScError> {
    let session_id = parse_session_id(&session_id)?;
    state
        .registry
        .authorize_host(&session_id, bearer_token(&headers)?)
        .await?;

    let svg = state
        .registry
        .create_join_descriptor(&session_id)
        .await?
        .qr_svg()?;
    Ok(([(CONTENT_TYPE, "image/svg+xml")], svg))
}

/// Handler for POST /api/v1/sessions/{id}/pin
#[instrument(skip(state, headers))]
pub async fn create_pin(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PinResponse>, ScError> {
    let session_id = parse_session_id(&session_id)?;
    let handle = state
        .registry
        .authorize_host(&session_id, bearer_token(&headers)?)
        .await?;

    let pin_grant = handle.create_pin().await?;
    Ok(Json(PinResponse {
        pin: pin_grant.pin.expose_secret().to_string(),
        expires_at: pin_grant.expires_at,
    }))
}

/// Handler for POST /api/v1/sessions/{id}/pin/redeem
#[instrument(skip(state, body))]
pub async fn redeem_pin(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<JoinGrant>, ScError> {
    let session_id = parse_session_id(&session_id)?;
    let request: RedeemPinRequest = parse_body(&body)?;

    let issued = state
        .registry
        .redeem_pin(
            &session_id,
            SecretString::from(request.pin),
            clean_display_name(request.display_name),
        )
        .await?;

    info!(
        target: "sc.routes",
        session_id = %session_id,
        participant_id = %issued.claims.sub,
        "Participant paired by PIN"
    );
    Ok(Json(grant(issued, state.registry.sync_address())))
}

/// Handler for POST /api/v1/join
///
/// # Response
///
/// - 200 OK: follower credentials
/// - 400 Bad Request: undecryptable descriptor or invalid body
/// - 401 Unauthorized: expired or forged descriptor
/// - 404 Not Found: session is gone
#[instrument(skip_all, name = "sc.routes.join")]
pub async fn join(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Json<JoinGrant>, ScError> {
    let request: JoinRequest = parse_body(&body)?;

    let issued = state
        .registry
        .redeem_descriptor(
            request.descriptor.trim(),
            clean_display_name(request.display_name),
        )
        .await?;

    Ok(Json(grant(issued, state.registry.sync_address())))
}

/// Handler for DELETE /api/v1/sessions/{id}
#[instrument(skip(state, headers))]
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ScError> {
    let session_id = parse_session_id(&session_id)?;
    let handle = state
        .registry
        .authorize_host(&session_id, bearer_token(&headers)?)
        .await?;

    handle.close(CloseReason::HostEnded).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for DELETE /api/v1/sessions/{id}/participants/{participant_id}
#[instrument(skip(state, headers))]
pub async fn revoke_participant(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ScError> {
    let session_id = parse_session_id(&session_id)?;
    let participant_id =
        ParticipantId::from_str(&participant_id).map_err(|_| ScError::ParticipantNotFound)?;
    let handle = state
        .registry
        .authorize_host(&session_id, bearer_token(&headers)?)
        .await?;

    handle.revoke_participant(participant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers).ok(), Some("abc.def"));
    }

    #[test]
    fn test_clean_display_name() {
        assert_eq!(clean_display_name(None), None);
        assert_eq!(clean_display_name(Some("   ".to_string())), None);
        assert_eq!(
            clean_display_name(Some("  Bea ".to_string())).as_deref(),
            Some("Bea")
        );
        let long = "x".repeat(200);
        assert_eq!(
            clean_display_name(Some(long)).map(|n| n.chars().count()),
            Some(MAX_DISPLAY_NAME_CHARS)
        );
    }

    #[test]
    fn test_malformed_session_id_is_not_found() {
        assert!(matches!(
            parse_session_id("not-a-uuid"),
            Err(ScError::SessionNotFound)
        ));
    }
}
