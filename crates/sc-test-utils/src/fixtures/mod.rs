//! Pre-configured fixtures for SC testing.
//!
//! - A fixed master secret and a matching configuration
//! - `TestServer`: registry plus a sync server on an ephemeral port

use base64::Engine;
use session_controller::actors::{
    ActorMetrics, CreateSessionOptions, CreatedSession, RegistryOptions, SessionRegistry,
};
use session_controller::audio::AudioEngine;
use session_controller::config::Config;
use session_controller::pairing::PairingAuthority;
use session_controller::server::SyncServer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Base64 of 32 fixed bytes.
#[must_use]
pub fn test_master_secret() -> String {
    base64::engine::general_purpose::STANDARD.encode([0x5a_u8; 32])
}

/// Environment for a test process: loopback, ephemeral ports, no discovery,
/// short timeouts.
#[must_use]
pub fn test_vars() -> HashMap<String, String> {
    [
        ("SC_MASTER_SECRET", test_master_secret()),
        ("SC_SYNC_BIND_ADDRESS", "127.0.0.1:0".to_string()),
        ("SC_ADMIN_BIND_ADDRESS", "127.0.0.1:0".to_string()),
        ("SC_DISCOVERY_ENABLED", "false".to_string()),
        ("SC_RECONCILIATION_WINDOW_MS", "100".to_string()),
        ("SC_HEARTBEAT_TIMEOUT_SECONDS", "5".to_string()),
        ("SC_MIGRATION_GRACE_SECONDS", "3".to_string()),
        ("SC_MAX_SESSIONS", "8".to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

#[must_use]
pub fn test_config() -> Config {
    Config::from_vars(&test_vars()).unwrap()
}

/// `test_config` with some variables replaced.
#[must_use]
pub fn test_config_with(overrides: &[(&str, &str)]) -> Config {
    let mut vars = test_vars();
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }
    Config::from_vars(&vars).unwrap()
}

/// Registry and sync server running in the current runtime.
pub struct TestServer {
    pub registry: Arc<SessionRegistry>,
    pub sync_addr: SocketAddr,
    pub cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Bind `config.sync_bind_address` and start accepting.
    pub async fn start(config: Config) -> Self {
        let authority = Arc::new(PairingAuthority::from_config(&config).unwrap());
        let server = SyncServer::bind(config.sync_bind_address.parse().unwrap())
            .await
            .unwrap();
        let sync_addr = server.local_addr().unwrap();

        let cancel_token = CancellationToken::new();
        let policy = config.session_policy();
        let clock_sample_window = policy.clock_sample_window;
        let registry = Arc::new(SessionRegistry::new(
            authority,
            policy,
            ActorMetrics::new(),
            RegistryOptions::from_config(&config, sync_addr.port()),
            cancel_token.child_token(),
        ));

        let task = tokio::spawn(server.run(
            Arc::clone(&registry),
            clock_sample_window,
            cancel_token.child_token(),
        ));

        Self {
            registry,
            sync_addr,
            cancel_token,
            task,
        }
    }

    /// Create a session with default options.
    pub async fn create_session(&self) -> CreatedSession {
        self.registry
            .create_session(CreateSessionOptions::default())
            .await
            .unwrap()
    }

    /// Create a session whose host device embeds `engine`.
    pub async fn create_session_with_engine(&self, engine: Box<dyn AudioEngine>) -> CreatedSession {
        self.registry
            .create_session(CreateSessionOptions {
                engine: Some(engine),
                ..CreateSessionOptions::default()
            })
            .await
            .unwrap()
    }

    /// Drain sessions and stop accepting.
    pub async fn stop(self) {
        self.registry.shutdown().await;
        self.cancel_token.cancel();
        self.task.await.unwrap();
    }
}
