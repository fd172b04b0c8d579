//! Metrics definitions for the Session Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for Session Controller
//! - `_total` suffix for counters
//! - `_ms` suffix for clock histograms (milliseconds, matching the wire protocol)
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values (registry, session, connection)
//! - `command`: bounded by `PlaybackCommand` variants (8 values)
//! - `outcome`: bounded by code (valid, invalid, expired, revoked; elected, closed)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Clock offsets can be large (device clocks set by hand) and signed
        .set_buckets_for_metric(
            Matcher::Full("sc_clock_offset_ms".to_string()),
            &[
                -1000.0, -250.0, -100.0, -50.0, -20.0, -5.0, 0.0, 5.0, 20.0, 50.0, 100.0, 250.0,
                1000.0,
            ],
        )
        .map_err(|e| format!("Failed to set clock offset buckets: {e}"))?
        // LAN round trips, sub-150ms target
        .set_buckets_for_metric(
            Matcher::Full("sc_clock_rtt_ms".to_string()),
            &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 150.0, 250.0, 500.0, 1000.0],
        )
        .map_err(|e| format!("Failed to set clock RTT buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("sc_reconciliation".to_string()),
            &[1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 50.0],
        )
        .map_err(|e| format!("Failed to set reconciliation batch buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session & Connection Metrics (Gauges)
// ============================================================================

/// Set the number of live sessions.
///
/// Metric: `sc_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_sessions_active").set(count as f64);
}

/// Set the number of attached participant connections.
///
/// Metric: `sc_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_connections_active").set(count as f64);
}

// ============================================================================
// Command Metrics
// ============================================================================

/// Record a command applied to a session's playback state.
///
/// Metric: `sc_commands_applied_total`
/// Labels: `command`
pub fn record_command_applied(command: &'static str) {
    counter!("sc_commands_applied_total", "command" => command).increment(1);
}

/// Record a command dropped as an exact duplicate.
///
/// Metric: `sc_commands_duplicate_total`
pub fn record_command_duplicate() {
    counter!("sc_commands_duplicate_total").increment(1);
}

/// Record the size of a flushed reconciliation batch.
///
/// Metric: `sc_reconciliation_batch_size`
pub fn record_reconciliation_batch(size: usize) {
    #[allow(clippy::cast_precision_loss)]
    histogram!("sc_reconciliation_batch_size").record(size as f64);
}

// ============================================================================
// Pairing Metrics
// ============================================================================

/// Record a token validation outcome.
///
/// Metric: `sc_token_validations_total`
/// Labels: `outcome` (valid, invalid, expired, revoked)
pub fn record_token_validation(outcome: &'static str) {
    counter!("sc_token_validations_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Host Migration Metrics
// ============================================================================

/// Record the end of a host migration.
///
/// Metric: `sc_host_migrations_total`
/// Labels: `outcome` (elected, closed)
pub fn record_host_migration(outcome: &'static str) {
    counter!("sc_host_migrations_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Clock Sync Metrics (Histograms)
// ============================================================================

/// Record one accepted clock sample.
///
/// Metrics: `sc_clock_offset_ms`, `sc_clock_rtt_ms`
pub fn record_clock_sample(offset_ms: i64, rtt_ms: i64) {
    #[allow(clippy::cast_precision_loss)]
    {
        histogram!("sc_clock_offset_ms").record(offset_ms as f64);
        histogram!("sc_clock_rtt_ms").record(rtt_ms as f64);
    }
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Record an actor panic.
///
/// Metric: `sc_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("sc_actor_panics_total", "actor_type" => actor_type).increment(1);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sc_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sc_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_sessions_active(1);
        set_connections_active(3);
        record_command_applied("play");
        record_command_duplicate();
        record_reconciliation_batch(2);
        record_token_validation("valid");
        record_host_migration("elected");
        record_clock_sample(-12, 40);
        record_actor_panic("session");
        set_actor_mailbox_depth("connection", 4);
    }

    #[test]
    fn test_metric_names_and_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_sessions_active(2);
            record_command_applied("seek");
            record_command_applied("seek");
            record_token_validation("revoked");
            record_clock_sample(200, 30);
        });

        let metrics = snapshotter.snapshot().into_vec();

        let find = |name: &str| {
            metrics
                .iter()
                .find(|(key, _, _, _)| key.key().name() == name)
                .map(|(key, _, _, value)| (key.key().clone(), value.clone()))
        };

        let (_, value) = find("sc_sessions_active").expect("gauge recorded");
        assert!(matches!(value, DebugValue::Gauge(v) if v.into_inner() == 2.0));

        let (key, value) = find("sc_commands_applied_total").expect("counter recorded");
        assert!(key
            .labels()
            .any(|l| l.key() == "command" && l.value() == "seek"));
        assert!(matches!(value, DebugValue::Counter(2)));

        let (key, _) = find("sc_token_validations_total").expect("counter recorded");
        assert!(key
            .labels()
            .any(|l| l.key() == "outcome" && l.value() == "revoked"));

        assert!(find("sc_clock_offset_ms").is_some());
        assert!(find("sc_clock_rtt_ms").is_some());
    }
}
