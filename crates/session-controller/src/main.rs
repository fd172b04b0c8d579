//! Session Controller
//!
//! Collaborative listening server for FlowSync sessions.
//!
//! # Servers
//!
//! - Sync protocol TCP server for participants (default: 0.0.0.0:7420)
//! - HTTP server for the admin API, health and metrics (default: 127.0.0.1:8081)
//! - UDP broadcast announcer for LAN discovery (default port: 7421)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the pairing authority from the master secret
//! 4. Bind the sync listener (its port goes into descriptors)
//! 5. Spawn the discovery announcer, if enabled
//! 6. Create the session registry
//! 7. Start the admin HTTP server and the sync server
//! 8. Wait for shutdown signal, then drain sessions

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use session_controller::actors::{ActorMetrics, RegistryOptions, SessionRegistry};
use session_controller::config::Config;
use session_controller::discovery::DiscoveryAnnouncer;
use session_controller::observability::{init_metrics_recorder, HealthState};
use session_controller::pairing::PairingAuthority;
use session_controller::routes::{build_routes, AppState};
use session_controller::server::SyncServer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on draining sessions at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let json_logs = std::env::var("SC_LOG_FORMAT").is_ok_and(|format| format == "json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_controller=debug,tower_http=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Session Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sync_bind_address = %config.sync_bind_address,
        admin_bind_address = %config.admin_bind_address,
        advertise_host = %config.advertise_host,
        discovery_enabled = config.discovery_enabled,
        max_sessions = config.max_sessions,
        max_participants = config.max_participants,
        reconciliation_window_ms = config.reconciliation_window_ms,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let authority = Arc::new(PairingAuthority::from_config(&config).map_err(|e| {
        error!(error = %e, "Failed to initialize pairing authority");
        e
    })?);

    let root_token = CancellationToken::new();

    // Bind sync listener BEFORE building the registry: descriptors carry its port
    let sync_addr: SocketAddr = config.sync_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.sync_bind_address, "Invalid sync bind address");
        format!("Invalid sync bind address: {e}")
    })?;
    let sync_server = SyncServer::bind(sync_addr).await.map_err(|e| {
        error!(error = %e, addr = %sync_addr, "Failed to bind sync server");
        e
    })?;
    let sync_port = sync_server.local_addr()?.port();
    info!(addr = %sync_addr, port = sync_port, "Sync server bound successfully");

    let policy = config.session_policy();
    let clock_sample_window = policy.clock_sample_window;
    let mut registry = SessionRegistry::new(
        authority,
        policy,
        ActorMetrics::new(),
        RegistryOptions::from_config(&config, sync_port),
        root_token.child_token(),
    );

    if config.discovery_enabled {
        let target = DiscoveryAnnouncer::broadcast_target(config.discovery_port);
        match DiscoveryAnnouncer::spawn(
            target,
            Duration::from_millis(config.discovery_interval_ms),
            root_token.child_token(),
        )
        .await
        {
            Ok((discovery, _task)) => {
                info!(target_addr = %target, "Discovery announcer started");
                registry = registry.with_discovery(discovery);
            }
            Err(e) => {
                // Sessions stay reachable by descriptor and PIN
                warn!(error = %e, "Discovery announcer unavailable, continuing without it");
            }
        }
    }

    let registry = Arc::new(registry);

    // Admin HTTP server (MUST succeed - fail startup if it doesn't)
    let admin_addr: SocketAddr = config.admin_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.admin_bind_address, "Invalid admin bind address");
        format!("Invalid admin bind address: {e}")
    })?;

    let app = build_routes(
        Arc::new(AppState {
            registry: Arc::clone(&registry),
        }),
        Arc::clone(&health_state),
        prometheus_handle,
    );

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %admin_addr, "Failed to bind admin server");
            format!("Failed to bind admin server to {admin_addr}: {e}")
        })?;
    info!(addr = %admin_addr, "Admin server bound successfully");

    let admin_shutdown_token = root_token.child_token();
    let admin_task = tokio::spawn(async move {
        info!(addr = %admin_addr, "Admin server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            admin_shutdown_token.cancelled().await;
            info!("Admin server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Admin server failed");
        }
    });

    let sync_task = tokio::spawn(sync_server.run(
        Arc::clone(&registry),
        clock_sample_window,
        root_token.child_token(),
    ));

    health_state.set_ready();
    info!("Session Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    // Sessions first, so participants see `closed` before sockets drop
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, registry.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Session drain timed out"
        );
    }
    root_token.cancel();

    for (name, task) in [("sync", sync_task), ("admin", admin_task)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Server task ended abnormally");
        }
    }

    info!("Session Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
