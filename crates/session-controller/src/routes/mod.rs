//! HTTP routes for the Session Controller.
//!
//! Defines the Axum router and application state for the admin and pairing
//! API, together with the health and metrics endpoints.

use crate::actors::SessionRegistry;
use crate::handlers;
use crate::observability::{health_router, HealthState};
use axum::{
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide session table.
    pub registry: Arc<SessionRegistry>,
}

/// Build the application routes.
///
/// - `/health`, `/ready` - probes, unversioned
/// - `/metrics` - Prometheus scrape endpoint, unversioned
/// - `/api/v1/sessions...` and `/api/v1/join` - admin and pairing API
/// - TraceLayer for request logging
/// - 30 second request timeout
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/sessions", post(handlers::create_session))
        .route(
            "/api/v1/sessions/:id",
            get(handlers::get_session).delete(handlers::close_session),
        )
        .route(
            "/api/v1/sessions/:id/descriptor",
            post(handlers::create_descriptor),
        )
        .route(
            "/api/v1/sessions/:id/descriptor/qr",
            post(handlers::create_descriptor_qr),
        )
        .route("/api/v1/sessions/:id/pin", post(handlers::create_pin))
        .route(
            "/api/v1/sessions/:id/pin/redeem",
            post(handlers::redeem_pin),
        )
        .route(
            "/api/v1/sessions/:id/participants/:participant_id",
            delete(handlers::revoke_participant),
        )
        .route("/api/v1/join", post(handlers::join))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    api_routes
        .merge(metrics_routes)
        .merge(health_router(health_state))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
