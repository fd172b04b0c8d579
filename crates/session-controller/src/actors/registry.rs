//! `SessionRegistry` - process-wide table of live sessions.
//!
//! The registry is the only shared mutable state in the process. It maps
//! session ids to [`SessionHandle`]s; all session state lives in the actors.
//!
//! - Lookup, insert and remove are the only operations under the lock, and the
//!   guard is never held across an `.await` on an actor
//! - Each session gets a supervisor task that awaits the actor's `JoinHandle`,
//!   records panics and removes the entry once the actor exits
//! - Shutdown takes the whole table out of the lock and closes every session
//!
//! Token and descriptor operations that need a live session go through here so
//! that a stateless check (signature, expiry) always happens before any session
//! is consulted.

use super::messages::PinGrant;
use super::metrics::{ActorMetrics, ActorType};
use super::session::{SessionActor, SessionContext, SessionHandle};
use crate::audio::AudioEngine;
use crate::config::{Config, SessionPolicy};
use crate::discovery::{Advertisement, DiscoveryHandle, SessionAdvertiser};
use crate::errors::ScError;
use crate::follower::PlaybackRenderer;
use crate::observability::metrics;
use crate::pairing::{IssuedToken, JoinDescriptor, PairingAuthority};

use common::jwt::{SyncClaims, TokenError};
use common::secret::SecretString;
use common::types::{ParticipantId, Role, SessionId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sync_protocol::CloseReason;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for one session to acknowledge its close.
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type SessionTable = Arc<Mutex<HashMap<SessionId, SessionHandle>>>;

/// Process-level settings for the registry.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub max_sessions: usize,
    /// `host:port` participants connect to; first address hint in descriptors.
    pub sync_address: String,
    /// Port announced in discovery records.
    pub sync_port: u16,
    /// Advertised name when the creator supplies none.
    pub default_host_name: String,
}

impl RegistryOptions {
    /// Derive options from configuration and the port the sync listener bound.
    #[must_use]
    pub fn from_config(config: &Config, sync_port: u16) -> Self {
        Self {
            max_sessions: config.max_sessions,
            sync_address: format!("{}:{sync_port}", config.advertise_host),
            sync_port,
            default_host_name: config.host_display_name.clone(),
        }
    }
}

/// Options for a new session. Unset settings take the registry's policy.
#[derive(Default)]
pub struct CreateSessionOptions {
    pub host_display_name: Option<String>,
    /// Advertise through discovery once active.
    pub public: Option<bool>,
    pub chat_enabled: Option<bool>,
    /// Audio engine on the host device, actuated on every applied command.
    pub engine: Option<Box<dyn AudioEngine>>,
}

/// A newly created session and its host credentials.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub host_id: ParticipantId,
    pub host_token: IssuedToken,
    pub handle: SessionHandle,
}

/// Process-wide table of live sessions.
pub struct SessionRegistry {
    sessions: SessionTable,
    authority: Arc<PairingAuthority>,
    policy: SessionPolicy,
    metrics: Arc<ActorMetrics>,
    options: RegistryOptions,
    discovery: Option<DiscoveryHandle>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("options", &self.options)
            .field("discovery", &self.discovery.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create an empty registry. Sessions get child tokens of `cancel_token`.
    #[must_use]
    pub fn new(
        authority: Arc<PairingAuthority>,
        policy: SessionPolicy,
        metrics: Arc<ActorMetrics>,
        options: RegistryOptions,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            authority,
            policy,
            metrics,
            options,
            discovery: None,
            cancel_token,
        }
    }

    /// Advertise sessions through `discovery` once they become active.
    #[must_use]
    pub fn with_discovery(mut self, discovery: DiscoveryHandle) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn authority(&self) -> &Arc<PairingAuthority> {
        &self.authority
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn sync_address(&self) -> &str {
        &self.options.sync_address
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Create a session and return the designated host's token.
    ///
    /// # Errors
    ///
    /// Returns `ScError::CapacityExceeded` at the session limit or during
    /// shutdown.
    pub async fn create_session(
        &self,
        options: CreateSessionOptions,
    ) -> Result<CreatedSession, ScError> {
        let session_id = SessionId::new();
        let host_id = ParticipantId::new();
        let host_display_name = options
            .host_display_name
            .unwrap_or_else(|| self.options.default_host_name.clone());

        let mut policy = self.policy.clone();
        if let Some(public) = options.public {
            policy.public = public;
        }
        if let Some(chat_enabled) = options.chat_enabled {
            policy.chat_enabled = chat_enabled;
        }

        let advertiser = self
            .discovery
            .as_ref()
            .filter(|_| policy.public)
            .map(|discovery| {
                SessionAdvertiser::new(
                    discovery.clone(),
                    Advertisement {
                        session_id,
                        host_display_name: host_display_name.clone(),
                        port: self.options.sync_port,
                        chat_enabled: policy.chat_enabled,
                        withdrawn: false,
                    },
                )
            });
        let renderer = options.engine.map(|engine| {
            PlaybackRenderer::new(engine).with_drift_tolerance(policy.drift_tolerance_ms)
        });
        let context = SessionContext {
            authority: Arc::clone(&self.authority),
            policy,
            metrics: Arc::clone(&self.metrics),
            advertiser,
            renderer,
        };

        let (handle, task) = {
            let mut sessions = self.sessions.lock().await;
            if self.cancel_token.is_cancelled() || sessions.len() >= self.options.max_sessions {
                warn!(
                    target: "sc.registry",
                    sessions = sessions.len(),
                    max_sessions = self.options.max_sessions,
                    "Refusing new session"
                );
                return Err(ScError::CapacityExceeded);
            }

            let (handle, task) = SessionActor::spawn(
                session_id,
                host_id,
                self.cancel_token.child_token(),
                context,
            );
            sessions.insert(session_id, handle.clone());
            (handle, task)
        };

        self.metrics.session_created();
        tokio::spawn(supervise(
            Arc::clone(&self.sessions),
            session_id,
            task,
            Arc::clone(&self.metrics),
        ));

        let host_token = handle
            .issue_token(host_id, Role::Host, Some(host_display_name))
            .await?;

        info!(
            target: "sc.registry",
            session_id = %session_id,
            host_id = %host_id,
            "Session created"
        );

        Ok(CreatedSession {
            session_id,
            host_id,
            host_token,
            handle,
        })
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// Returns `ScError::SessionNotFound` if it does not exist.
    pub async fn get(&self, session_id: &SessionId) -> Result<SessionHandle, ScError> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or(ScError::SessionNotFound)
    }

    /// Stateless token checks followed by the session lookup.
    ///
    /// The nonce is not consumed; attaching consumes it.
    ///
    /// # Errors
    ///
    /// Token errors first, then `ScError::SessionNotFound`.
    pub async fn authenticate(&self, token: &str) -> Result<(SyncClaims, SessionHandle), ScError> {
        // The authority records the failed check
        let claims = self.authority.verify(token)?;
        let handle = self.get(&claims.sid).await?;
        Ok((claims, handle))
    }

    /// Full validation: stateless checks, then the session's ledger, marking
    /// the nonce consumed on success.
    ///
    /// # Errors
    ///
    /// `TokenInvalid`/`TokenExpired` from the stateless checks, then
    /// `SessionNotFound`, then `TokenRevoked` from the ledger.
    pub async fn validate_token(&self, token: &str) -> Result<SyncClaims, ScError> {
        let (claims, handle) = self.authenticate(token).await?;
        handle.consume_nonce(claims.clone()).await?;
        Ok(claims)
    }

    /// Check a host bearer token for an admin operation on `session_id`.
    ///
    /// # Errors
    ///
    /// Token errors, `SessionNotFound`, or `PermissionDenied` if the subject is
    /// not the current host.
    pub async fn authorize_host(
        &self,
        session_id: &SessionId,
        token: &str,
    ) -> Result<SessionHandle, ScError> {
        let (claims, handle) = self.authenticate(token).await?;
        if claims.sid != *session_id {
            return Err(ScError::Token(TokenError::Invalid));
        }
        handle.check_host(claims).await?;
        Ok(handle)
    }

    /// Seal a join descriptor for a live session.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Encoding` if the session no longer exists and
    /// `ScError::SessionClosing` if it is closing.
    pub async fn create_join_descriptor(
        &self,
        session_id: &SessionId,
    ) -> Result<JoinDescriptor, ScError> {
        let handle = self
            .get(session_id)
            .await
            .map_err(|_| ScError::Encoding("session no longer exists".to_string()))?;
        handle.check_joinable().await.map_err(|e| match e {
            ScError::SessionNotFound => {
                ScError::Encoding("session no longer exists".to_string())
            }
            other => other,
        })?;

        self.authority
            .create_join_descriptor(*session_id, vec![self.options.sync_address.clone()])
    }

    /// Exchange a join descriptor for a follower token.
    ///
    /// # Errors
    ///
    /// Descriptor and token errors come before any session lookup; then
    /// `SessionNotFound` or `SessionClosing`.
    pub async fn redeem_descriptor(
        &self,
        descriptor: &str,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        let issued = self
            .authority
            .redeem_descriptor(descriptor, display_name)
            .inspect_err(|e| {
                if let ScError::Token(token_error) = e {
                    metrics::record_token_validation(token_error.as_str());
                }
            })?;

        let handle = self.get(&issued.claims.sid).await?;
        handle.check_joinable().await?;

        debug!(
            target: "sc.registry",
            session_id = %issued.claims.sid,
            participant_id = %issued.claims.sub,
            "Join descriptor redeemed"
        );
        Ok(issued)
    }

    /// Issue a pairing PIN for `session_id`.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, or `SessionClosing` once the session is closing.
    pub async fn create_pin(&self, session_id: &SessionId) -> Result<PinGrant, ScError> {
        self.get(session_id).await?.create_pin().await
    }

    /// Redeem a pairing PIN for a follower token.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, then the PIN's token error, then `SessionFull`.
    pub async fn redeem_pin(
        &self,
        session_id: &SessionId,
        pin: SecretString,
        display_name: Option<String>,
    ) -> Result<IssuedToken, ScError> {
        self.get(session_id)
            .await?
            .redeem_pin(pin, display_name)
            .await
    }

    /// Close a session. The supervisor removes the entry when the actor exits.
    ///
    /// # Errors
    ///
    /// Returns `ScError::SessionNotFound` if it does not exist.
    pub async fn close_session(
        &self,
        session_id: &SessionId,
        reason: CloseReason,
    ) -> Result<(), ScError> {
        self.get(session_id).await?.close(reason).await
    }

    /// Close every session and refuse new ones.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let sessions = std::mem::take(&mut *self.sessions.lock().await);

        info!(
            target: "sc.registry",
            sessions = sessions.len(),
            "Closing all sessions"
        );

        for (session_id, handle) in sessions {
            match tokio::time::timeout(
                SESSION_CLOSE_TIMEOUT,
                handle.close(CloseReason::Shutdown),
            )
            .await
            {
                Ok(Ok(())) | Ok(Err(ScError::SessionNotFound)) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "sc.registry",
                        session_id = %session_id,
                        error = %e,
                        "Session close failed"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sc.registry",
                        session_id = %session_id,
                        "Session close timed out"
                    );
                }
            }
        }
    }
}

/// Await a session actor and drop its entry once it exits.
async fn supervise(
    sessions: SessionTable,
    session_id: SessionId,
    task: JoinHandle<()>,
    actor_metrics: Arc<ActorMetrics>,
) {
    match task.await {
        Ok(()) => {
            debug!(
                target: "sc.registry",
                session_id = %session_id,
                "Session actor exited"
            );
        }
        Err(join_error) if join_error.is_panic() => {
            error!(
                target: "sc.registry",
                session_id = %session_id,
                error = ?join_error,
                "Session actor panicked"
            );
            actor_metrics.record_panic(ActorType::Session);
        }
        Err(join_error) => {
            warn!(
                target: "sc.registry",
                session_id = %session_id,
                error = ?join_error,
                "Session actor task cancelled"
            );
        }
    }

    sessions.lock().await.remove(&session_id);
    actor_metrics.session_removed();
}
