//! Common utilities and types shared across FlowSync components.

#![warn(clippy::pedantic)]

/// Module for common data types (identifiers, roles)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for sync token claims and pre-verification helpers
pub mod jwt;
