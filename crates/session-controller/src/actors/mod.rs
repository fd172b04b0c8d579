//! Actor model implementation for the Session Controller.
//!
//! ```text
//! SessionRegistry (singleton per process)
//! ├── supervises N SessionActors
//! │   └── SessionActor (one per live session)
//! │       ├── owns membership, playback state, reconciliation queue
//! │       └── owns the credential ledger (nonces, revocations, pairing PIN)
//! └── ConnectionActor (one per participant socket)
//!     ├── owns the connection's ClockSyncEngine
//!     └── attached to exactly one SessionActor
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per session**: all session state lives in its actor; the
//!   registry only maps ids to handles
//! - **CancellationToken propagation**: the registry hands each session a child
//!   of the root token; each attach gets a child of the session's token
//! - **Mailbox monitoring**: Depth thresholds with metrics (Session: 100/500, Connection: 50/200)
//! - **Message passing**: All inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`registry`] - `SessionRegistry`, the process-wide session table
//! - [`session`] - `SessionActor` per live session
//! - [`connection`] - `ConnectionActor` per participant connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session;

// Re-export primary types
pub use connection::ConnectionActor;
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{CreateSessionOptions, CreatedSession, RegistryOptions, SessionRegistry};
pub use session::{SessionActor, SessionContext, SessionHandle};
