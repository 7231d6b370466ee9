use crate::registry::WorkerStatus;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    #[error("worker {worker_id} is already connected")]
    DuplicateConnection { worker_id: String },
    #[error("worker {worker_id} cannot move from {from} to {to}")]
    InvalidTransition {
        worker_id: String,
        from: WorkerStatus,
        to: WorkerStatus,
    },
    #[error("no worker available for request {request_id}")]
    NoWorkerAvailable { request_id: String },
    #[error("no worker available for request {request_id} after {attempts} failover attempts")]
    WorkerUnavailable { request_id: String, attempts: u32 },
    #[error("request {request_id} timed out")]
    RequestTimeout { request_id: String },
    #[error("unknown worker {worker_id}")]
    UnknownWorker { worker_id: String },
    #[error("unknown request {request_id}")]
    UnknownRequest { request_id: String },
    #[error("request {request_id} is already pending")]
    DuplicateRequest { request_id: String },
    #[error("request {request_id} is already assigned to {worker_id}")]
    AlreadyAssigned {
        request_id: String,
        worker_id: String,
    },
    #[error("response for {request_id} from {worker_id} does not match its assignment")]
    StaleResponse {
        request_id: String,
        worker_id: String,
    },
    #[error("request {request_id} failed on worker {worker_id}: {message}")]
    ExecutionFailed {
        request_id: String,
        worker_id: String,
        message: String,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

impl CoordinationError {
    /// Stable identifier sent as the `code` of wire `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinationError::DuplicateConnection { .. } => "duplicate_connection",
            CoordinationError::InvalidTransition { .. } => "invalid_transition",
            CoordinationError::NoWorkerAvailable { .. } => "no_worker_available",
            CoordinationError::WorkerUnavailable { .. } => "worker_unavailable",
            CoordinationError::RequestTimeout { .. } => "request_timeout",
            CoordinationError::UnknownWorker { .. } => "unknown_worker",
            CoordinationError::UnknownRequest { .. } => "unknown_request",
            CoordinationError::DuplicateRequest { .. } => "duplicate_request",
            CoordinationError::AlreadyAssigned { .. } => "already_assigned",
            CoordinationError::StaleResponse { .. } => "stale_response",
            CoordinationError::ExecutionFailed { .. } => "execution_failed",
            CoordinationError::InvalidRequest(_) => "invalid_request",
            CoordinationError::ShuttingDown => "shutting_down",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            CoordinationError::NoWorkerAvailable { request_id }
            | CoordinationError::WorkerUnavailable { request_id, .. }
            | CoordinationError::RequestTimeout { request_id }
            | CoordinationError::UnknownRequest { request_id }
            | CoordinationError::DuplicateRequest { request_id }
            | CoordinationError::AlreadyAssigned { request_id, .. }
            | CoordinationError::StaleResponse { request_id, .. }
            | CoordinationError::ExecutionFailed { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_unavailable_reports_attempts() {
        let err = CoordinationError::WorkerUnavailable {
            request_id: "req-1".to_string(),
            attempts: 2,
        };
        assert_eq!(err.code(), "worker_unavailable");
        assert_eq!(err.request_id(), Some("req-1"));
        assert!(err.to_string().contains("after 2 failover attempts"));
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = CoordinationError::InvalidTransition {
            worker_id: "w1".to_string(),
            from: WorkerStatus::Connecting,
            to: WorkerStatus::Unhealthy,
        };
        assert_eq!(
            err.to_string(),
            "worker w1 cannot move from connecting to unhealthy"
        );
        assert_eq!(err.request_id(), None);
    }
}
