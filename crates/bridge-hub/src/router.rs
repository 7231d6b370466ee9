use crate::error::CoordinationError;
use crate::metrics::MetricsAggregator;
use crate::registry::{PendingRequest, Registry, WorkerConnection};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct Dispatch {
    pub request_id: String,
    pub worker: WorkerConnection,
    /// False when the worker's outbound queue was full or closed.
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { result: Value, metadata: Value },
    Failure { error: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Completed {
    pub request: PendingRequest,
    pub worker_id: Option<String>,
    pub response_time: Duration,
}

pub struct Router {
    registry: Arc<Registry>,
    metrics: Arc<MetricsAggregator>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, metrics: Arc<MetricsAggregator>) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// Assigns a pending request to the least loaded eligible worker and sends
    /// it. The assignment is committed before the send; the send itself runs
    /// outside the registry lock.
    pub fn route(&self, request_id: &str, now: Instant) -> Result<Dispatch, CoordinationError> {
        let (worker, message) = self.registry.write(|state| -> Result<_, CoordinationError> {
            let request =
                state
                    .requests
                    .get(request_id)
                    .ok_or_else(|| CoordinationError::UnknownRequest {
                        request_id: request_id.to_string(),
                    })?;
            if let Some(worker_id) = &request.assigned_worker_id {
                return Err(CoordinationError::AlreadyAssigned {
                    request_id: request_id.to_string(),
                    worker_id: worker_id.clone(),
                });
            }
            let message = request.dispatch_message();
            let worker_id = state
                .eligible(Some(&request.requires))
                .first()
                .map(|worker| worker.id.clone())
                .ok_or_else(|| CoordinationError::NoWorkerAvailable {
                    request_id: request_id.to_string(),
                })?;
            state.bind(request_id, &worker_id, now)?;
            let worker = state.workers.get(&worker_id).cloned().ok_or_else(|| {
                CoordinationError::UnknownWorker {
                    worker_id: worker_id.clone(),
                }
            })?;
            Ok((worker, message))
        })?;

        let delivered = worker.handle.send(message);
        info!(
            event = "request_routed",
            request_id,
            worker_id = %worker.id,
            conn_id = %worker.conn_id(),
            active = worker.active_count(),
            delivered
        );
        Ok(Dispatch {
            request_id: request_id.to_string(),
            worker,
            delivered,
        })
    }

    /// Records a worker's report for a request it currently holds.
    pub fn complete(
        &self,
        worker_id: &str,
        request_id: &str,
        outcome: &Outcome,
        now: Instant,
    ) -> Result<Completed, CoordinationError> {
        let success = outcome.is_success();
        let completed = self.registry.write(|state| -> Result<_, CoordinationError> {
            let request =
                state
                    .requests
                    .get(request_id)
                    .ok_or_else(|| CoordinationError::UnknownRequest {
                        request_id: request_id.to_string(),
                    })?;
            if request.assigned_worker_id.as_deref() != Some(worker_id) {
                return Err(CoordinationError::StaleResponse {
                    request_id: request_id.to_string(),
                    worker_id: worker_id.to_string(),
                });
            }
            let request =
                state
                    .detach(request_id)
                    .ok_or_else(|| CoordinationError::UnknownRequest {
                        request_id: request_id.to_string(),
                    })?;
            let started = request.assigned_at.unwrap_or(request.submitted_at);
            let response_time = now.saturating_duration_since(started);
            state.record_outcome(worker_id, success, response_time);
            Ok(Completed {
                request,
                worker_id: Some(worker_id.to_string()),
                response_time,
            })
        });

        match &completed {
            Ok(done) => {
                self.metrics.record(success, done.response_time, now);
                debug!(
                    event = "request_completed",
                    request_id,
                    worker_id,
                    success,
                    response_ms = done.response_time.as_millis() as u64
                );
            }
            Err(err) => {
                warn!(
                    event = "stray_response",
                    request_id,
                    worker_id,
                    code = err.code(),
                    error = %err
                );
            }
        }
        completed
    }

    /// Removes a request whose deadline passed. `sequence` guards against a
    /// newer request that reused the id.
    pub fn expire(&self, request_id: &str, sequence: u64, now: Instant) -> Option<Completed> {
        let expired = self.registry.write(|state| {
            if state.requests.get(request_id)?.sequence != sequence {
                return None;
            }
            let request = state.detach(request_id)?;
            let response_time = now.saturating_duration_since(request.submitted_at);
            let worker_id = request.assigned_worker_id.clone();
            if let Some(worker_id) = &worker_id {
                state.record_outcome(worker_id, false, response_time);
            }
            Some(Completed {
                request,
                worker_id,
                response_time,
            })
        })?;
        self.metrics.record(false, expired.response_time, now);
        warn!(
            event = "request_timed_out",
            request_id,
            worker_id = expired.worker_id.as_deref().unwrap_or("-"),
            waited_ms = expired.response_time.as_millis() as u64
        );
        Some(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::registry::tests::{request, test_handle};
    use bridge_core::{Capabilities, WireMessage};
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<Registry>,
        router: Router,
        receivers: Vec<mpsc::Receiver<Outbound>>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(Registry::new());
            let router = Router::new(registry.clone(), Arc::new(MetricsAggregator::new()));
            Self {
                registry,
                router,
                receivers: Vec::new(),
            }
        }

        fn connect(&mut self, worker_id: &str, caps: Capabilities, at: Instant) -> bool {
            let (handle, rx) = test_handle(&format!("conn-{worker_id}"));
            self.receivers.push(rx);
            self.registry.register(worker_id, caps, handle, at).is_ok()
        }

        fn submit(&self, request: PendingRequest) -> Result<Dispatch, CoordinationError> {
            let request_id = request.request_id.clone();
            self.registry.insert_request(request)?;
            self.router.route(&request_id, Instant::now()).map_err(|err| {
                self.registry.take_request(&request_id);
                err
            })
        }
    }

    #[test]
    fn routes_to_least_loaded_worker() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("w2", Capabilities::new(), start);
        h.connect("w1", Capabilities::new(), start + Duration::from_secs(1));
        for id in ["a", "b"] {
            h.registry.insert_request(request(id, start)).expect("insert");
            h.registry
                .write(|state| state.bind(id, "w2", start))
                .expect("bind");
        }

        let dispatch = h.submit(request("r1", start)).expect("route");
        assert_eq!(dispatch.worker.id, "w1");
        assert!(dispatch.delivered);
        assert_eq!(
            h.registry.request("r1").expect("r1").assigned_worker_id.as_deref(),
            Some("w1")
        );
    }

    #[test]
    fn ties_go_to_the_oldest_connection() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("young", Capabilities::new(), start + Duration::from_secs(5));
        h.connect("old", Capabilities::new(), start);
        let dispatch = h.submit(request("r1", start)).expect("route");
        assert_eq!(dispatch.worker.id, "old");
    }

    #[test]
    fn requirements_filter_candidates() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("w1", Capabilities::new().with("model", "a"), start);
        h.connect(
            "w2",
            Capabilities::new().with("model", json!(["b", "c"])),
            start + Duration::from_secs(1),
        );

        let needs_c = request("r1", start).with_requires(Capabilities::new().with("model", "c"));
        assert_eq!(h.submit(needs_c).expect("route").worker.id, "w2");

        let needs_z = request("r2", start).with_requires(Capabilities::new().with("model", "z"));
        let err = h.submit(needs_z).expect_err("no match");
        assert_eq!(err.code(), "no_worker_available");
        assert!(h.registry.request("r2").is_none());
    }

    #[test]
    fn dispatch_carries_ids_and_payload() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("w1", Capabilities::new(), start);
        h.submit(request("r1", start)).expect("route");
        match h.receivers[0].try_recv() {
            Ok(Outbound::Message(WireMessage::GenerateImage(payload))) => {
                assert_eq!(payload.request_id.as_deref(), Some("r1"));
                assert_eq!(payload.correlation_id.as_deref(), Some("corr-r1"));
                assert_eq!(payload.prompt, "prompt for r1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn routing_an_assigned_request_is_rejected() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("w1", Capabilities::new(), start);
        h.connect("w2", Capabilities::new(), start);
        h.submit(request("r1", start)).expect("route");
        let err = h.router.route("r1", start).expect_err("double assignment");
        assert!(matches!(err, CoordinationError::AlreadyAssigned { .. }));
        h.registry.check_consistency().expect("consistent");
    }

    #[test]
    fn completion_updates_stats_and_metrics() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("w1", Capabilities::new(), start);
        h.submit(request("r1", start)).expect("route");
        h.submit(request("r2", start)).expect("route");

        let later = Instant::now() + Duration::from_millis(40);
        let ok = Outcome::Success {
            result: json!({"url": "x"}),
            metadata: Value::Null,
        };
        let done = h.router.complete("w1", "r1", &ok, later).expect("complete");
        assert_eq!(done.worker_id.as_deref(), Some("w1"));
        assert!(done.response_time >= Duration::from_millis(40));

        let failed = Outcome::Failure {
            error: "tab crashed".to_string(),
        };
        h.router.complete("w1", "r2", &failed, later).expect("fail");

        let worker = h.registry.worker("w1").expect("worker");
        assert!(worker.active_request_ids.is_empty());
        assert_eq!(worker.stats.requests_processed, 2);
        assert_eq!(worker.stats.success_count, 1);
        assert_eq!(worker.stats.failure_count, 1);
        let snapshot = h.router.metrics().snapshot_at(later);
        assert_eq!(snapshot.throughput, 2);
        assert_eq!(snapshot.error_rate, 0.5);
    }

    #[test]
    fn stray_and_unknown_reports_are_discarded() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("w1", Capabilities::new(), start);
        h.connect("w2", Capabilities::new(), start + Duration::from_secs(1));
        h.submit(request("r1", start)).expect("route");

        let ok = Outcome::Success {
            result: Value::Null,
            metadata: Value::Null,
        };
        let err = h.router.complete("w2", "r1", &ok, start).expect_err("stale");
        assert!(matches!(err, CoordinationError::StaleResponse { .. }));
        assert!(h.registry.request("r1").is_some());

        let err = h.router.complete("w1", "nope", &ok, start).expect_err("unknown");
        assert!(matches!(err, CoordinationError::UnknownRequest { .. }));
        assert_eq!(h.router.metrics().snapshot().throughput, 0);
    }

    #[test]
    fn expire_respects_sequence_and_frees_worker() {
        let mut h = Harness::new();
        let start = Instant::now();
        h.connect("w1", Capabilities::new(), start);
        h.submit(request("r1", start)).expect("route");
        let sequence = h.registry.request("r1").expect("r1").sequence();

        assert!(h.router.expire("r1", sequence + 1, start).is_none());
        let expired = h.router.expire("r1", sequence, start).expect("expired");
        assert_eq!(expired.worker_id.as_deref(), Some("w1"));
        let worker = h.registry.worker("w1").expect("worker");
        assert!(worker.active_request_ids.is_empty());
        assert_eq!(worker.stats.failure_count, 1);
        assert!(h.router.expire("r1", sequence, start).is_none());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect(u8),
        Disconnect(u8),
        Submit,
        Complete(u8, bool),
        Unhealthy(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Connect),
            (0u8..4).prop_map(Op::Disconnect),
            Just(Op::Submit),
            (any::<u8>(), any::<bool>()).prop_map(|(i, ok)| Op::Complete(i, ok)),
            (0u8..4).prop_map(Op::Unhealthy),
        ]
    }

    proptest! {
        #[test]
        fn assignments_stay_mutually_consistent(ops in proptest::collection::vec(op(), 1..80)) {
            let mut h = Harness::new();
            let now = Instant::now();
            let mut next = 0u32;
            for op in ops {
                match op {
                    Op::Connect(w) => {
                        h.connect(&format!("w{w}"), Capabilities::new(), now);
                    }
                    Op::Disconnect(w) => {
                        if let Ok(worker) = h.registry.remove(&format!("w{w}")) {
                            for request_id in &worker.active_request_ids {
                                if h.router.route(request_id, now).is_err() {
                                    h.registry.take_request(request_id);
                                }
                            }
                        }
                    }
                    Op::Submit => {
                        next += 1;
                        let _ = h.submit(request(&format!("r{next}"), now));
                    }
                    Op::Complete(index, ok) => {
                        let pending = h.registry.pending_requests();
                        if !pending.is_empty() {
                            let request = &pending[index as usize % pending.len()];
                            if let Some(worker_id) = &request.assigned_worker_id {
                                let outcome = if ok {
                                    Outcome::Success { result: Value::Null, metadata: Value::Null }
                                } else {
                                    Outcome::Failure { error: "boom".to_string() }
                                };
                                prop_assert!(h.router.complete(worker_id, &request.request_id, &outcome, now).is_ok());
                            }
                        }
                    }
                    Op::Unhealthy(w) => {
                        let _ = h.registry.transition(&format!("w{w}"), crate::WorkerStatus::Unhealthy);
                    }
                }
                if let Err(problem) = h.registry.check_consistency() {
                    prop_assert!(false, "{}", problem);
                }
            }
        }

        #[test]
        fn routing_is_deterministic(loads in proptest::collection::vec(0usize..4, 1..6)) {
            let build = || {
                let mut h = Harness::new();
                let start = Instant::now();
                for (index, load) in loads.iter().enumerate() {
                    let worker_id = format!("w{index}");
                    h.connect(&worker_id, Capabilities::new(), start);
                    for n in 0..*load {
                        let request_id = format!("{worker_id}-busy-{n}");
                        h.registry.insert_request(request(&request_id, start)).expect("insert");
                        h.registry.write(|state| state.bind(&request_id, &worker_id, start)).expect("bind");
                    }
                }
                h
            };
            let first = build().submit(request("probe", Instant::now())).expect("route");
            let second = build().submit(request("probe", Instant::now())).expect("route");
            prop_assert_eq!(&first.worker.id, &second.worker.id);

            let min = loads.iter().copied().min().unwrap_or(0);
            let expected = loads.iter().position(|load| *load == min).unwrap_or(0);
            prop_assert_eq!(first.worker.id, format!("w{expected}"));
        }
    }
}
