//! Session Controller (SC) Library
//!
//! This library provides the core functionality for the FlowSync Session
//! Controller - a collaborative listening engine responsible for:
//!
//! - Session lifecycle and participant membership
//! - Authoritative playback state with monotonic revisions
//! - Bounded-window reconciliation of concurrent playback commands
//! - NTP-style clock synchronization per connection
//! - Pairing: signed tokens, join descriptors and PINs
//! - Host migration when the host disappears
//! - LAN discovery of hosted sessions
//!
//! # Architecture
//!
//! ```text
//! SessionRegistry (singleton per process)
//! ├── supervises N SessionActors
//! │   └── SessionActor (one per live session)
//! └── ConnectionActor (one per participant socket)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`clock_sync`] - Clock offset estimation
//! - [`reconciliation`] - Command ordering within a window
//! - [`playback`] - Playback state and command application
//! - [`pairing`] - Tokens, descriptors and PINs
//! - [`follower`] - Follower-side drift correction
//! - [`discovery`] - LAN advertisement and browsing
//! - [`server`] - Sync protocol TCP server
//! - [`routes`] / [`handlers`] - Admin HTTP API
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with appropriate error codes

pub mod actors;
pub mod audio;
pub mod clock_sync;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod follower;
pub mod handlers;
pub mod observability;
pub mod pairing;
pub mod playback;
pub mod reconciliation;
pub mod routes;
pub mod server;
