//! Observability for the Session Controller.
//!
//! All instrumentation uses explicit field allow-listing: ids and counts are
//! logged, tokens, secrets and PINs never are.
//!
//! # Metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sc_sessions_active` | Gauge | none |
//! | `sc_connections_active` | Gauge | none |
//! | `sc_commands_applied_total` | Counter | `command` |
//! | `sc_commands_duplicate_total` | Counter | none |
//! | `sc_reconciliation_batch_size` | Histogram | none |
//! | `sc_token_validations_total` | Counter | `outcome` |
//! | `sc_host_migrations_total` | Counter | `outcome` |
//! | `sc_clock_offset_ms` | Histogram | none |
//! | `sc_clock_rtt_ms` | Histogram | none |
//! | `sc_actor_panics_total` | Counter | `actor_type` |
//! | `sc_actor_mailbox_depth` | Gauge | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
