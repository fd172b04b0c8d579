//! Sync protocol server: TCP accept loop.
//!
//! Every accepted socket gets its own [`ConnectionActor`]. The server holds no
//! per-connection state; the registry and the session actors own everything
//! else.

use crate::actors::{ConnectionActor, SessionRegistry};
use crate::errors::ScError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound sync listener, not yet accepting.
#[derive(Debug)]
pub struct SyncServer {
    listener: TcpListener,
}

impl SyncServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Config` if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> Result<Self, ScError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ScError::Config(format!("failed to bind sync server to {addr}: {e}")))?;
        Ok(Self { listener })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ScError> {
        self.listener
            .local_addr()
            .map_err(|e| ScError::Internal(format!("listener has no local address: {e}")))
    }

    /// Accept connections until `cancel_token` fires.
    #[instrument(skip_all, name = "sc.server")]
    pub async fn run(
        self,
        registry: Arc<SessionRegistry>,
        clock_sample_window: usize,
        cancel_token: CancellationToken,
    ) {
        info!(
            target: "sc.server",
            addr = ?self.listener.local_addr().ok(),
            "Sync server accepting connections"
        );

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(target: "sc.server", "Sync server shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(target: "sc.server", peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                            }
                            ConnectionActor::spawn(
                                stream,
                                peer,
                                Arc::clone(&registry),
                                clock_sample_window,
                                cancel_token.child_token(),
                            );
                        }
                        Err(e) => {
                            warn!(target: "sc.server", error = %e, "Accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}
