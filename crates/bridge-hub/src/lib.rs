//! Coordinator for browser-extension workers.
//!
//! The [`registry::Registry`] is the single source of truth for worker and
//! request state. [`router`], [`heartbeat`] and [`failover`] act on it,
//! [`metrics`] observes completions, and [`coordinator::Coordinator`] wires
//! them to the websocket transport in [`transport`] and the HTTP routes in
//! [`http`].

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod failover;
pub mod heartbeat;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod status;
pub mod transport;

pub use config::{CoordinatorConfig, TransportSettings};
pub use connection::{ConnectionHandle, Outbound};
pub use coordinator::{Coordinator, RequestEvent, SubmitReceipt, Submission};
pub use error::CoordinationError;
pub use heartbeat::{HealthEvent, HeartbeatPolicy};
pub use registry::{PendingRequest, Registry, WorkerConnection, WorkerStatus};
