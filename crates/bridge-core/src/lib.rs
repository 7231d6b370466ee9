pub mod capabilities;
pub mod protocol;

pub use capabilities::Capabilities;
pub use protocol::{ClientType, ProtocolError, WireMessage};

use uuid::Uuid;

/// Generates a fresh request id for submissions that did not carry one.
pub fn new_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
