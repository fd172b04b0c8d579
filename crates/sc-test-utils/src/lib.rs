//! # SC Test Utilities
//!
//! Shared test utilities for the Session Controller (SC).
//!
//! ## Modules
//!
//! - `mock_audio` - Recording audio engine for renderer and host-device tests
//! - `test_client` - Framed TCP participant with a configurable clock offset
//! - `fixtures` - Master secret, configuration and a running server
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = TestServer::start(test_config()).await;
//!     let created = server.create_session().await;
//!
//!     let mut host = TestClient::connect(server.sync_addr, &created.host_token.token)
//!         .await
//!         .unwrap();
//!     assert!(host.is_host());
//! }
//! ```
//!
//! ## Clock Offsets
//!
//! `TestClient::with_clock_offset` shifts every local timestamp the client
//! produces, so one process can play devices whose clocks disagree.

pub mod fixtures;
pub mod mock_audio;
pub mod test_client;

pub use fixtures::*;
pub use mock_audio::{AudioCall, MockAudioEngine};
pub use test_client::TestClient;
