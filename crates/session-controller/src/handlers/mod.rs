//! HTTP request handlers for the Session Controller admin API.

pub mod metrics;
pub mod sessions;

pub use metrics::metrics_handler;
pub use sessions::{
    close_session, create_descriptor, create_descriptor_qr, create_pin, create_session,
    get_session, join, redeem_pin, revoke_participant,
};
