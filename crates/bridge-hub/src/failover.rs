use crate::error::CoordinationError;
use crate::registry::{PendingRequest, WorkerConnection};
use crate::router::{Dispatch, Router};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// A worker that left the live set, with the requests it still held.
#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub worker: WorkerConnection,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Reassignment {
    pub request_id: String,
    pub attempts: u32,
    pub dispatch: Dispatch,
}

#[derive(Debug, Clone)]
pub struct FailedRequest {
    pub request: PendingRequest,
    pub error: CoordinationError,
}

#[derive(Debug, Clone, Default)]
pub struct FailoverReport {
    pub worker_id: String,
    pub reassigned: Vec<Reassignment>,
    pub failed: Vec<FailedRequest>,
    /// Orphans that had already finished or been picked up elsewhere.
    pub skipped: usize,
}

pub struct FailoverHandler {
    router: Arc<Router>,
    max_attempts: u32,
}

impl FailoverHandler {
    pub fn new(router: Arc<Router>, max_attempts: u32) -> Self {
        Self {
            router,
            max_attempts,
        }
    }

    pub fn handle(&self, worker: &WorkerConnection, now: Instant) -> FailoverReport {
        let registry = self.router.registry();
        let mut report = FailoverReport {
            worker_id: worker.id.clone(),
            ..FailoverReport::default()
        };

        let mut orphans = Vec::new();
        for request_id in &worker.active_request_ids {
            match registry.request(request_id) {
                Some(request) if request.assigned_worker_id.is_none() => {
                    orphans.push((request.sequence(), request.request_id))
                }
                _ => report.skipped += 1,
            }
        }
        orphans.sort();

        for (_, request_id) in orphans {
            let attempts = registry.write(|state| {
                let request = state.requests.get_mut(&request_id)?;
                if request.assigned_worker_id.is_some() {
                    return None;
                }
                request.attempts += 1;
                Some(request.attempts)
            });
            let Some(attempts) = attempts else {
                report.skipped += 1;
                continue;
            };

            let error = if attempts > self.max_attempts {
                CoordinationError::WorkerUnavailable {
                    request_id: request_id.clone(),
                    attempts,
                }
            } else {
                match self.router.route(&request_id, now) {
                    Ok(dispatch) => {
                        report.reassigned.push(Reassignment {
                            request_id,
                            attempts,
                            dispatch,
                        });
                        continue;
                    }
                    Err(CoordinationError::NoWorkerAvailable { .. }) => {
                        CoordinationError::WorkerUnavailable {
                            request_id: request_id.clone(),
                            attempts,
                        }
                    }
                    Err(err) => err,
                }
            };

            match registry.take_request(&request_id) {
                Some(request) => {
                    warn!(
                        event = "failover_request_failed",
                        worker_id = %worker.id,
                        request_id = %request_id,
                        attempts,
                        code = error.code()
                    );
                    report.failed.push(FailedRequest { request, error });
                }
                None => report.skipped += 1,
            }
        }

        info!(
            event = "failover_complete",
            worker_id = %worker.id,
            reassigned = report.reassigned.len(),
            failed = report.failed.len(),
            skipped = report.skipped
        );
        report
    }
}
