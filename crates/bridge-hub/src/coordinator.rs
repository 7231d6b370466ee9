use crate::config::CoordinatorConfig;
use crate::connection::{ConnectionHandle, CLOSE_GOING_AWAY};
use crate::error::CoordinationError;
use crate::failover::{DisconnectEvent, FailoverHandler};
use crate::heartbeat::{HealthEvent, HeartbeatMonitor};
use crate::metrics::{MetricsAggregator, RoutingStatsSnapshot};
use crate::registry::{
    HealthSummary, HeartbeatOutcome, PendingRequest, Registry, RequestPayload, WorkerConnection,
};
use crate::router::{Outcome, Router};
use crate::status::{RequestState, RequestStatus, StatusCache};
use bridge_core::protocol::{CompletionPayload, DispatchPayload, FailurePayload};
use bridge_core::{new_correlation_id, new_request_id, Capabilities, WireMessage};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Caller-facing notification for a request that reached a terminal state.
#[derive(Debug, Clone)]
pub enum RequestEvent {
    Completed {
        request_id: String,
        correlation_id: String,
        worker_id: String,
        result: Value,
        metadata: Value,
        response_time: Duration,
    },
    Failed {
        request_id: String,
        correlation_id: String,
        error: CoordinationError,
    },
}

impl RequestEvent {
    pub fn request_id(&self) -> &str {
        match self {
            RequestEvent::Completed { request_id, .. } | RequestEvent::Failed { request_id, .. } => {
                request_id
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub parameters: Value,
    pub requires: Capabilities,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
    pub origin: Option<ConnectionHandle>,
}

impl Submission {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn from_payload(payload: DispatchPayload) -> Self {
        Self {
            request_id: payload.request_id,
            correlation_id: payload.correlation_id,
            prompt: payload.prompt,
            model: payload.model,
            parameters: payload.parameters,
            requires: payload.requires,
            timeout: payload.timeout_ms.map(Duration::from_millis),
            deadline: None,
            origin: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_requires(mut self, requires: Capabilities) -> Self {
        self.requires = requires;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_origin(mut self, origin: ConnectionHandle) -> Self {
        self.origin = Some(origin);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub request_id: String,
    pub correlation_id: String,
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    #[serde(flatten)]
    pub routing: RoutingStatsSnapshot,
    pub health: HealthSummary,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<Registry>,
    router: Arc<Router>,
    monitor: HeartbeatMonitor,
    failover: FailoverHandler,
    statuses: StatusCache,
    events: broadcast::Sender<RequestEvent>,
    disconnects: mpsc::Sender<DisconnectEvent>,
    clients: RwLock<HashMap<String, ConnectionHandle>>,
    /// Deadline timers keyed by request id, tagged with the submission
    /// sequence they guard.
    deadlines: Mutex<HashMap<String, (u64, AbortHandle)>>,
    next_conn_id: AtomicU64,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    /// Builds the coordinator and spawns its failover consumer. Must be
    /// called from within a tokio runtime.
    pub fn start(config: CoordinatorConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(MetricsAggregator::new());
        let router = Arc::new(Router::new(registry.clone(), metrics));
        let (disconnect_tx, disconnect_rx) = mpsc::channel(config.disconnect_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let coordinator = Arc::new(Self {
            monitor: HeartbeatMonitor::new(registry.clone(), config.heartbeat),
            failover: FailoverHandler::new(router.clone(), config.max_failover_attempts),
            statuses: StatusCache::new(config.status_cache_size, config.status_ttl),
            config,
            registry,
            router,
            events,
            disconnects: disconnect_tx,
            clients: RwLock::new(HashMap::new()),
            deadlines: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            shutdown_tx,
        });
        spawn_failover_consumer(Arc::downgrade(&coordinator), disconnect_rx);
        coordinator
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        format!("conn-{id}")
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub async fn connect_worker(
        &self,
        worker_id: &str,
        capabilities: Capabilities,
        handle: ConnectionHandle,
    ) -> Result<WorkerConnection, CoordinationError> {
        if !self.is_accepting() {
            return Err(CoordinationError::ShuttingDown);
        }
        let conn_id = handle.conn_id().to_string();
        let registration = self
            .registry
            .register(worker_id, capabilities, handle, Instant::now())?;
        if let Some(replaced) = registration.replaced {
            self.enqueue_disconnect(DisconnectEvent {
                worker: replaced,
                reason: "replaced".to_string(),
            })
            .await;
        }
        self.monitor.spawn_watchdog(
            worker_id.to_string(),
            conn_id,
            self.disconnects.clone(),
            self.shutdown_tx.subscribe(),
        );
        Ok(registration.worker)
    }

    /// Any inbound traffic from a worker counts as a heartbeat. A worker
    /// whose grace period already ran out goes to failover instead.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
    ) -> Result<HeartbeatOutcome, CoordinationError> {
        let outcome = self.monitor.record(worker_id, Instant::now());
        if let Ok(HeartbeatOutcome::Expired(worker)) = &outcome {
            self.enqueue_disconnect(DisconnectEvent {
                worker: worker.clone(),
                reason: "heartbeat_timeout".to_string(),
            })
            .await;
        }
        outcome
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.monitor.subscribe()
    }

    /// Removes the worker record owned by `conn_id` and hands its requests to
    /// failover. A record already replaced by a newer connection is left alone.
    pub async fn disconnect_worker(&self, worker_id: &str, conn_id: &str, reason: &str) {
        match self.registry.remove_connection(worker_id, conn_id) {
            Ok(worker) => {
                self.enqueue_disconnect(DisconnectEvent {
                    worker,
                    reason: reason.to_string(),
                })
                .await;
            }
            Err(_) => {
                debug!(event = "worker_already_removed", worker_id, conn_id, reason);
            }
        }
    }

    pub fn register_client(&self, handle: ConnectionHandle) {
        let conn_id = handle.conn_id().to_string();
        self.clients.write().insert(conn_id, handle);
    }

    pub fn remove_client(&self, conn_id: &str) {
        self.clients.write().remove(conn_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub async fn submit(
        self: &Arc<Self>,
        submission: Submission,
    ) -> Result<SubmitReceipt, CoordinationError> {
        if !self.is_accepting() {
            return Err(CoordinationError::ShuttingDown);
        }
        if submission.prompt.trim().is_empty() {
            return Err(CoordinationError::InvalidRequest(
                "prompt is required".to_string(),
            ));
        }
        let request_id = submission
            .request_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_request_id);
        let correlation_id = submission
            .correlation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(new_correlation_id);
        let now = Instant::now();
        let deadline = submission.deadline.unwrap_or_else(|| {
            now + submission.timeout.unwrap_or(self.config.request_timeout)
        });

        if self.registry.request(&request_id).is_some() {
            return Err(CoordinationError::DuplicateRequest { request_id });
        }
        let request = PendingRequest::new(
            request_id.clone(),
            correlation_id.clone(),
            RequestPayload {
                prompt: submission.prompt,
                model: submission.model,
                parameters: submission.parameters,
            },
            now,
            deadline,
        )
        .with_requires(submission.requires)
        .with_origin(submission.origin);

        if deadline <= now {
            let error = CoordinationError::RequestTimeout {
                request_id: request_id.clone(),
            };
            warn!(event = "request_deadline_passed", request_id = %request_id);
            self.statuses.insert(
                RequestStatus::terminal(
                    &request,
                    RequestState::TimedOut,
                    None,
                    Some(error.to_string()),
                ),
                now,
            );
            return Err(error);
        }

        let request = self.registry.insert_request(request)?;
        let dispatch = match self.router.route(&request_id, now) {
            Ok(dispatch) => dispatch,
            Err(err) => {
                if let Some(request) = self.registry.take_request(&request_id) {
                    self.statuses.insert(
                        RequestStatus::terminal(
                            &request,
                            RequestState::Failed,
                            None,
                            Some(err.to_string()),
                        ),
                        now,
                    );
                }
                warn!(
                    event = "request_rejected",
                    request_id = %request_id,
                    code = err.code(),
                    error = %err
                );
                return Err(err);
            }
        };

        self.spawn_deadline(request_id.clone(), request.sequence(), deadline);
        if !dispatch.delivered {
            if let Some(event) = self.evict_undeliverable(&dispatch.worker) {
                self.enqueue_disconnect(event).await;
            }
        }
        Ok(SubmitReceipt {
            request_id,
            correlation_id,
            worker_id: dispatch.worker.id,
        })
    }

    pub fn complete(
        &self,
        worker_id: &str,
        payload: CompletionPayload,
    ) -> Result<(), CoordinationError> {
        let outcome = Outcome::Success {
            result: payload.result,
            metadata: payload.metadata,
        };
        let now = Instant::now();
        let completed = self
            .router
            .complete(worker_id, &payload.request_id, &outcome, now)?;
        let Outcome::Success { result, metadata } = outcome else {
            return Ok(());
        };
        let request = completed.request;
        self.cancel_deadline(&request.request_id, request.sequence());
        self.statuses.insert(
            RequestStatus::terminal(
                &request,
                RequestState::Completed,
                Some(worker_id.to_string()),
                None,
            ),
            now,
        );
        if let Some(origin) = &request.origin {
            origin.send(WireMessage::ImageGenerated(CompletionPayload {
                request_id: request.request_id.clone(),
                result: result.clone(),
                metadata: metadata.clone(),
                correlation_id: Some(request.correlation_id.clone()),
            }));
        }
        let _ = self.events.send(RequestEvent::Completed {
            request_id: request.request_id,
            correlation_id: request.correlation_id,
            worker_id: worker_id.to_string(),
            result,
            metadata,
            response_time: completed.response_time,
        });
        Ok(())
    }

    pub fn fail_from_worker(
        &self,
        worker_id: &str,
        payload: FailurePayload,
    ) -> Result<(), CoordinationError> {
        let outcome = Outcome::Failure {
            error: payload.error.clone(),
        };
        let completed =
            self.router
                .complete(worker_id, &payload.request_id, &outcome, Instant::now())?;
        let error = CoordinationError::ExecutionFailed {
            request_id: payload.request_id,
            worker_id: worker_id.to_string(),
            message: payload.error,
        };
        self.notify_failure(
            &completed.request,
            &error,
            RequestState::Failed,
            Some(worker_id.to_string()),
        );
        Ok(())
    }

    pub fn status(&self, request_id: &str) -> Option<RequestStatus> {
        if let Some(request) = self.registry.request(request_id) {
            return Some(RequestStatus::live(&request));
        }
        self.statuses.get(request_id, Instant::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsReport {
        StatsReport {
            routing: self.router.metrics().snapshot(),
            health: self.registry.health(),
        }
    }

    pub fn health(&self) -> HealthSummary {
        self.registry.health()
    }

    /// Stops intake, waits up to `drain` for in-flight requests, fails the
    /// rest as timed out and closes every connection.
    pub async fn shutdown(&self, drain: Duration) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let pending = self.registry.pending_count();
        info!(event = "shutdown_started", pending, drain_ms = drain.as_millis() as u64);

        let deadline = Instant::now() + drain;
        while self.registry.pending_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let now = Instant::now();
        let mut abandoned = 0usize;
        for request in self.registry.pending_requests() {
            let Some(expired) = self
                .router
                .expire(&request.request_id, request.sequence(), now)
            else {
                continue;
            };
            abandoned += 1;
            let error = CoordinationError::RequestTimeout {
                request_id: request.request_id.clone(),
            };
            self.notify_failure(
                &expired.request,
                &error,
                RequestState::TimedOut,
                expired.worker_id,
            );
        }

        for worker in self.registry.workers() {
            worker.handle.close(CLOSE_GOING_AWAY, "shutdown");
            let _ = self.registry.remove(&worker.id);
        }
        let clients = std::mem::take(&mut *self.clients.write());
        for handle in clients.values() {
            handle.close(CLOSE_GOING_AWAY, "shutdown");
        }
        for (_, (_, handle)) in self.deadlines.lock().drain() {
            handle.abort();
        }
        self.shutdown_tx.send_replace(true);
        info!(event = "shutdown_complete", abandoned);
    }

    fn spawn_deadline(self: &Arc<Self>, request_id: String, sequence: u64, deadline: Instant) {
        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let timer_id = request_id.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.forget_deadline(&timer_id, sequence);
                        coordinator.expire(&timer_id, sequence);
                    }
                }
                _ = shutdown.changed() => {}
            }
        });
        self.deadlines
            .lock()
            .insert(request_id.clone(), (sequence, task.abort_handle()));
        // the request may have finished before its timer was recorded
        let live = self
            .registry
            .request(&request_id)
            .is_some_and(|request| request.sequence() == sequence);
        if !live {
            self.cancel_deadline(&request_id, sequence);
        }
    }

    fn forget_deadline(&self, request_id: &str, sequence: u64) -> Option<AbortHandle> {
        let mut deadlines = self.deadlines.lock();
        match deadlines.get(request_id) {
            Some((owner, _)) if *owner == sequence => {
                deadlines.remove(request_id).map(|(_, handle)| handle)
            }
            _ => None,
        }
    }

    fn cancel_deadline(&self, request_id: &str, sequence: u64) {
        if let Some(handle) = self.forget_deadline(request_id, sequence) {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn deadline_count(&self) -> usize {
        self.deadlines.lock().len()
    }

    fn expire(&self, request_id: &str, sequence: u64) {
        let Some(expired) = self.router.expire(request_id, sequence, Instant::now()) else {
            return;
        };
        let error = CoordinationError::RequestTimeout {
            request_id: request_id.to_string(),
        };
        self.notify_failure(
            &expired.request,
            &error,
            RequestState::TimedOut,
            expired.worker_id,
        );
    }

    fn notify_failure(
        &self,
        request: &PendingRequest,
        error: &CoordinationError,
        state: RequestState,
        worker_id: Option<String>,
    ) {
        self.cancel_deadline(&request.request_id, request.sequence());
        self.statuses.insert(
            RequestStatus::terminal(request, state, worker_id, Some(error.to_string())),
            Instant::now(),
        );
        if let Some(origin) = &request.origin {
            origin.send(WireMessage::error(
                Some(&request.request_id),
                error.code(),
                error.to_string(),
            ));
        }
        let _ = self.events.send(RequestEvent::Failed {
            request_id: request.request_id.clone(),
            correlation_id: request.correlation_id.clone(),
            error: error.clone(),
        });
    }

    /// A worker whose queue rejected a dispatch is treated as gone.
    fn evict_undeliverable(&self, worker: &WorkerConnection) -> Option<DisconnectEvent> {
        let removed = self
            .registry
            .remove_connection(&worker.id, worker.conn_id())
            .ok()?;
        warn!(
            event = "dispatch_undeliverable",
            worker_id = %worker.id,
            conn_id = %worker.conn_id()
        );
        Some(DisconnectEvent {
            worker: removed,
            reason: "dispatch_failed".to_string(),
        })
    }

    async fn enqueue_disconnect(&self, event: DisconnectEvent) {
        if let Err(mpsc::error::SendError(event)) = self.disconnects.send(event).await {
            self.process_disconnect(event);
        }
    }

    pub(crate) fn process_disconnect(&self, event: DisconnectEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(DisconnectEvent { worker, reason }) = queue.pop_front() {
            worker.handle.close(CLOSE_GOING_AWAY, &reason);
            info!(
                event = "worker_disconnected",
                worker_id = %worker.id,
                conn_id = %worker.conn_id(),
                reason = %reason,
                orphaned = worker.active_count()
            );
            let report = self.failover.handle(&worker, Instant::now());
            for reassignment in &report.reassigned {
                if !reassignment.dispatch.delivered {
                    if let Some(next) = self.evict_undeliverable(&reassignment.dispatch.worker) {
                        queue.push_back(next);
                    }
                }
            }
            for failed in &report.failed {
                self.notify_failure(&failed.request, &failed.error, RequestState::Failed, None);
            }
        }
    }
}

fn spawn_failover_consumer(
    coordinator: Weak<Coordinator>,
    mut disconnects: mpsc::Receiver<DisconnectEvent>,
) {
    let mut shutdown = match coordinator.upgrade() {
        Some(coordinator) => coordinator.shutdown_signal(),
        None => return,
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = disconnects.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let Some(coordinator) = coordinator.upgrade() else {
                        break;
                    };
                    coordinator.process_disconnect(event);
                }
            }
        }
    });
}
