use crate::connection::ConnectionHandle;
use crate::error::CoordinationError;
use crate::heartbeat::{HeartbeatPolicy, Liveness};
use bridge_core::protocol::DispatchPayload;
use bridge_core::{Capabilities, WireMessage};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Connecting,
    Connected,
    Unhealthy,
    Disconnected,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Connecting => "connecting",
            WorkerStatus::Connected => "connected",
            WorkerStatus::Unhealthy => "unhealthy",
            WorkerStatus::Disconnected => "disconnected",
        }
    }

    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Unhealthy)
                | (Unhealthy, Connected)
                | (Connecting | Connected | Unhealthy, Disconnected)
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub requests_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_response_time_ms: u64,
    pub connected_at: DateTime<Utc>,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            requests_processed: 0,
            success_count: 0,
            failure_count: 0,
            total_response_time_ms: 0,
            connected_at: Utc::now(),
        }
    }

    pub fn average_response_time_ms(&self) -> f64 {
        if self.requests_processed == 0 {
            return 0.0;
        }
        self.total_response_time_ms as f64 / self.requests_processed as f64
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConnection {
    pub id: String,
    pub capabilities: Capabilities,
    pub status: WorkerStatus,
    pub last_seen: Instant,
    pub active_request_ids: BTreeSet<String>,
    pub stats: WorkerStats,
    pub handle: ConnectionHandle,
    pub(crate) connected_at: Instant,
    pub(crate) sequence: u64,
}

impl WorkerConnection {
    pub fn conn_id(&self) -> &str {
        self.handle.conn_id()
    }

    pub fn active_count(&self) -> usize {
        self.active_request_ids.len()
    }

    pub fn is_eligible(&self, requires: Option<&Capabilities>) -> bool {
        self.status == WorkerStatus::Connected
            && requires.map_or(true, |wanted| self.capabilities.satisfies(wanted))
    }
}

/// Least loaded first, then the oldest connection.
pub(crate) fn routing_order(a: &WorkerConnection, b: &WorkerConnection) -> Ordering {
    a.active_count()
        .cmp(&b.active_count())
        .then(a.connected_at.cmp(&b.connected_at))
        .then(a.sequence.cmp(&b.sequence))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestPayload {
    pub prompt: String,
    pub model: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub correlation_id: String,
    pub payload: RequestPayload,
    pub requires: Capabilities,
    pub assigned_worker_id: Option<String>,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub attempts: u32,
    pub origin: Option<ConnectionHandle>,
    pub(crate) assigned_at: Option<Instant>,
    pub(crate) sequence: u64,
}

impl PendingRequest {
    pub fn new(
        request_id: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: RequestPayload,
        submitted_at: Instant,
        deadline: Instant,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            correlation_id: correlation_id.into(),
            payload,
            requires: Capabilities::new(),
            assigned_worker_id: None,
            submitted_at,
            deadline,
            attempts: 0,
            origin: None,
            assigned_at: None,
            sequence: 0,
        }
    }

    pub fn with_requires(mut self, requires: Capabilities) -> Self {
        self.requires = requires;
        self
    }

    pub fn with_origin(mut self, origin: Option<ConnectionHandle>) -> Self {
        self.origin = origin;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn dispatch_message(&self) -> WireMessage {
        WireMessage::GenerateImage(DispatchPayload {
            request_id: Some(self.request_id.clone()),
            prompt: self.payload.prompt.clone(),
            model: self.payload.model.clone(),
            parameters: self.payload.parameters.clone(),
            correlation_id: Some(self.correlation_id.clone()),
            requires: Capabilities::new(),
            timeout_ms: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub worker: WorkerConnection,
    /// Unhealthy record of the same id that this registration displaced.
    pub replaced: Option<WorkerConnection>,
}

#[derive(Debug, Clone)]
pub enum HeartbeatOutcome {
    Alive,
    Recovered,
    /// Traffic arrived after the grace period; the record was removed.
    Expired(WorkerConnection),
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: WorkerStatus,
    pub to: WorkerStatus,
    /// Set when the transition was to `Disconnected`.
    pub removed: Option<WorkerConnection>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub connecting: usize,
    pub connected: usize,
    pub unhealthy: usize,
    pub pending_requests: usize,
    pub unassigned_requests: usize,
}

#[derive(Default)]
pub(crate) struct RegistryState {
    pub(crate) workers: HashMap<String, WorkerConnection>,
    pub(crate) requests: HashMap<String, PendingRequest>,
    next_worker_seq: u64,
    next_request_seq: u64,
}

impl RegistryState {
    pub(crate) fn eligible(&self, requires: Option<&Capabilities>) -> Vec<&WorkerConnection> {
        let mut workers = self
            .workers
            .values()
            .filter(|worker| worker.is_eligible(requires))
            .collect::<Vec<_>>();
        workers.sort_by(|a, b| routing_order(a, b));
        workers
    }

    pub(crate) fn set_status(
        &mut self,
        worker_id: &str,
        next: WorkerStatus,
    ) -> Result<WorkerStatus, CoordinationError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| CoordinationError::UnknownWorker {
                worker_id: worker_id.to_string(),
            })?;
        let from = worker.status;
        if !from.can_transition_to(next) || next == WorkerStatus::Disconnected {
            return Err(CoordinationError::InvalidTransition {
                worker_id: worker_id.to_string(),
                from,
                to: next,
            });
        }
        worker.status = next;
        Ok(from)
    }

    /// Takes the worker out of the live set and unbinds its requests in the
    /// same step, so no request points at a worker that no longer exists.
    pub(crate) fn remove_worker(
        &mut self,
        worker_id: &str,
    ) -> Result<WorkerConnection, CoordinationError> {
        let mut worker =
            self.workers
                .remove(worker_id)
                .ok_or_else(|| CoordinationError::UnknownWorker {
                    worker_id: worker_id.to_string(),
                })?;
        worker.status = WorkerStatus::Disconnected;
        for request_id in &worker.active_request_ids {
            if let Some(request) = self.requests.get_mut(request_id) {
                if request.assigned_worker_id.as_deref() == Some(worker_id) {
                    request.assigned_worker_id = None;
                    request.assigned_at = None;
                }
            }
        }
        Ok(worker)
    }

    pub(crate) fn bind(
        &mut self,
        request_id: &str,
        worker_id: &str,
        now: Instant,
    ) -> Result<(), CoordinationError> {
        let request =
            self.requests
                .get_mut(request_id)
                .ok_or_else(|| CoordinationError::UnknownRequest {
                    request_id: request_id.to_string(),
                })?;
        if let Some(current) = &request.assigned_worker_id {
            return Err(CoordinationError::AlreadyAssigned {
                request_id: request_id.to_string(),
                worker_id: current.clone(),
            });
        }
        let worker =
            self.workers
                .get_mut(worker_id)
                .ok_or_else(|| CoordinationError::UnknownWorker {
                    worker_id: worker_id.to_string(),
                })?;
        worker.active_request_ids.insert(request_id.to_string());
        request.assigned_worker_id = Some(worker_id.to_string());
        request.assigned_at = Some(now);
        Ok(())
    }

    pub(crate) fn detach(&mut self, request_id: &str) -> Option<PendingRequest> {
        let request = self.requests.remove(request_id)?;
        if let Some(worker_id) = &request.assigned_worker_id {
            if let Some(worker) = self.workers.get_mut(worker_id) {
                worker.active_request_ids.remove(request_id);
            }
        }
        Some(request)
    }

    pub(crate) fn record_outcome(&mut self, worker_id: &str, success: bool, elapsed: Duration) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.stats.requests_processed += 1;
            if success {
                worker.stats.success_count += 1;
            } else {
                worker.stats.failure_count += 1;
            }
            worker.stats.total_response_time_ms += elapsed.as_millis() as u64;
        }
    }
}

/// Worker and request tables behind one lock.
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&RegistryState) -> R) -> R {
        f(&*self.state.read())
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        f(&mut *self.state.write())
    }

    pub fn register(
        &self,
        worker_id: &str,
        capabilities: Capabilities,
        handle: ConnectionHandle,
        now: Instant,
    ) -> Result<Registration, CoordinationError> {
        let (worker, replaced) = self.write(|state| -> Result<_, CoordinationError> {
            let mut replaced = None;
            if let Some(existing) = state.workers.get(worker_id) {
                if existing.status != WorkerStatus::Unhealthy {
                    return Err(CoordinationError::DuplicateConnection {
                        worker_id: worker_id.to_string(),
                    });
                }
                replaced = Some(state.remove_worker(worker_id)?);
            }
            state.next_worker_seq += 1;
            let worker = WorkerConnection {
                id: worker_id.to_string(),
                capabilities,
                status: WorkerStatus::Connecting,
                last_seen: now,
                active_request_ids: BTreeSet::new(),
                stats: WorkerStats::new(),
                handle,
                connected_at: now,
                sequence: state.next_worker_seq,
            };
            state.workers.insert(worker_id.to_string(), worker);
            state.set_status(worker_id, WorkerStatus::Connected)?;
            let worker = state.workers.get(worker_id).cloned().ok_or_else(|| {
                CoordinationError::UnknownWorker {
                    worker_id: worker_id.to_string(),
                }
            })?;
            Ok((worker, replaced))
        })?;

        info!(
            event = "worker_registered",
            worker_id = %worker.id,
            conn_id = %worker.conn_id(),
            capabilities = %worker.capabilities,
            replaced = replaced.is_some()
        );
        Ok(Registration { worker, replaced })
    }

    /// Refreshes `last_seen`. A worker already expired under `policy` is not
    /// revived: its record is removed and returned for failover.
    pub fn mark_heartbeat(
        &self,
        worker_id: &str,
        now: Instant,
        policy: &HeartbeatPolicy,
    ) -> Result<HeartbeatOutcome, CoordinationError> {
        self.write(|state| -> Result<HeartbeatOutcome, CoordinationError> {
            let worker =
                state
                    .workers
                    .get_mut(worker_id)
                    .ok_or_else(|| CoordinationError::UnknownWorker {
                        worker_id: worker_id.to_string(),
                    })?;
            if policy.liveness(worker.last_seen, now) == Liveness::Expired {
                return state.remove_worker(worker_id).map(HeartbeatOutcome::Expired);
            }
            worker.last_seen = now;
            if worker.status == WorkerStatus::Unhealthy {
                worker.status = WorkerStatus::Connected;
                return Ok(HeartbeatOutcome::Recovered);
            }
            Ok(HeartbeatOutcome::Alive)
        })
    }

    pub fn transition(
        &self,
        worker_id: &str,
        next: WorkerStatus,
    ) -> Result<Transition, CoordinationError> {
        self.write(|state| {
            let from = state
                .workers
                .get(worker_id)
                .map(|worker| worker.status)
                .ok_or_else(|| CoordinationError::UnknownWorker {
                    worker_id: worker_id.to_string(),
                })?;
            if next == WorkerStatus::Disconnected {
                let removed = state.remove_worker(worker_id)?;
                return Ok(Transition {
                    from,
                    to: next,
                    removed: Some(removed),
                });
            }
            state.set_status(worker_id, next)?;
            Ok(Transition {
                from,
                to: next,
                removed: None,
            })
        })
    }

    pub fn remove(&self, worker_id: &str) -> Result<WorkerConnection, CoordinationError> {
        self.transition(worker_id, WorkerStatus::Disconnected)?
            .removed
            .ok_or_else(|| CoordinationError::UnknownWorker {
                worker_id: worker_id.to_string(),
            })
    }

    /// Like [`Registry::remove`], but only when the record still belongs to
    /// `conn_id`; a reconnected worker keeps its new record.
    pub fn remove_connection(
        &self,
        worker_id: &str,
        conn_id: &str,
    ) -> Result<WorkerConnection, CoordinationError> {
        self.write(|state| {
            match state.workers.get(worker_id) {
                Some(worker) if worker.conn_id() == conn_id => {}
                _ => {
                    return Err(CoordinationError::UnknownWorker {
                        worker_id: worker_id.to_string(),
                    })
                }
            }
            state.remove_worker(worker_id)
        })
    }

    pub fn list_eligible(&self, requires: Option<&Capabilities>) -> Vec<WorkerConnection> {
        self.read(|state| state.eligible(requires).into_iter().cloned().collect())
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerConnection> {
        self.read(|state| state.workers.get(worker_id).cloned())
    }

    pub fn workers(&self) -> Vec<WorkerConnection> {
        let mut workers = self.read(|state| state.workers.values().cloned().collect::<Vec<_>>());
        workers.sort_by_key(|worker| worker.sequence);
        workers
    }

    pub fn insert_request(
        &self,
        mut request: PendingRequest,
    ) -> Result<PendingRequest, CoordinationError> {
        self.write(|state| {
            if state.requests.contains_key(&request.request_id) {
                return Err(CoordinationError::DuplicateRequest {
                    request_id: request.request_id.clone(),
                });
            }
            state.next_request_seq += 1;
            request.sequence = state.next_request_seq;
            request.assigned_worker_id = None;
            request.assigned_at = None;
            state
                .requests
                .insert(request.request_id.clone(), request.clone());
            Ok(request)
        })
    }

    pub fn request(&self, request_id: &str) -> Option<PendingRequest> {
        self.read(|state| state.requests.get(request_id).cloned())
    }

    /// Pending requests in submission order.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let mut requests = self.read(|state| state.requests.values().cloned().collect::<Vec<_>>());
        requests.sort_by_key(|request| request.sequence);
        requests
    }

    pub fn pending_count(&self) -> usize {
        self.read(|state| state.requests.len())
    }

    pub fn take_request(&self, request_id: &str) -> Option<PendingRequest> {
        self.write(|state| state.detach(request_id))
    }

    pub fn health(&self) -> HealthSummary {
        self.read(|state| {
            let mut summary = HealthSummary {
                pending_requests: state.requests.len(),
                unassigned_requests: state
                    .requests
                    .values()
                    .filter(|request| request.assigned_worker_id.is_none())
                    .count(),
                ..HealthSummary::default()
            };
            for worker in state.workers.values() {
                match worker.status {
                    WorkerStatus::Connecting => summary.connecting += 1,
                    WorkerStatus::Connected => summary.connected += 1,
                    WorkerStatus::Unhealthy => summary.unhealthy += 1,
                    WorkerStatus::Disconnected => {}
                }
            }
            summary
        })
    }

    /// Verifies that request assignments and worker active sets agree.
    pub fn check_consistency(&self) -> Result<(), String> {
        self.read(|state| {
            for (request_id, request) in &state.requests {
                let holders = state
                    .workers
                    .values()
                    .filter(|worker| worker.active_request_ids.contains(request_id))
                    .map(|worker| worker.id.as_str())
                    .collect::<Vec<_>>();
                match (request.assigned_worker_id.as_deref(), holders.as_slice()) {
                    (None, []) => {}
                    (Some(assigned), [holder]) if assigned == *holder => {}
                    (assigned, holders) => {
                        return Err(format!(
                            "request {request_id} assigned to {assigned:?} but held by {holders:?}"
                        ))
                    }
                }
            }
            for worker in state.workers.values() {
                if worker.status == WorkerStatus::Disconnected {
                    return Err(format!("disconnected worker {} is still live", worker.id));
                }
                for request_id in &worker.active_request_ids {
                    let assigned = state
                        .requests
                        .get(request_id)
                        .and_then(|request| request.assigned_worker_id.as_deref());
                    if assigned != Some(worker.id.as_str()) {
                        return Err(format!(
                            "worker {} holds {request_id} assigned to {assigned:?}",
                            worker.id
                        ));
                    }
                }
            }
            Ok(())
        })
    }
}
