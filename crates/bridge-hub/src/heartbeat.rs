use crate::error::CoordinationError;
use crate::failover::DisconnectEvent;
use crate::registry::{HeartbeatOutcome, Registry, WorkerConnection, WorkerStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_TICK: Duration = Duration::from_millis(10);
const HEALTH_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    pub missed_threshold: u32,
    pub grace_period: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            missed_threshold: 3,
            grace_period: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Missed { intervals: u32 },
    Expired,
}

impl HeartbeatPolicy {
    pub fn unhealthy_after(&self) -> Duration {
        self.interval.saturating_mul(self.missed_threshold.max(1))
    }

    pub fn disconnect_after(&self) -> Duration {
        self.unhealthy_after().saturating_add(self.grace_period)
    }

    pub fn liveness(&self, last_seen: Instant, now: Instant) -> Liveness {
        let silent = now.saturating_duration_since(last_seen);
        if silent >= self.disconnect_after() {
            Liveness::Expired
        } else if silent >= self.unhealthy_after() {
            let intervals = silent.as_millis() / self.interval.as_millis().max(1);
            Liveness::Missed {
                intervals: u32::try_from(intervals).unwrap_or(u32::MAX),
            }
        } else {
            Liveness::Alive
        }
    }

    fn tick(&self) -> Duration {
        (self.interval / 2).max(MIN_TICK)
    }
}

/// Worker health transitions, published for any subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    HeartbeatMissed { worker_id: String, missed: u32 },
    Recovered { worker_id: String },
    Expired { worker_id: String, orphaned: usize },
}

impl HealthEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            HealthEvent::HeartbeatMissed { worker_id, .. }
            | HealthEvent::Recovered { worker_id }
            | HealthEvent::Expired { worker_id, .. } => worker_id,
        }
    }
}

#[derive(Debug)]
pub enum CheckOutcome {
    Healthy,
    MarkedUnhealthy { missed: u32 },
    StillUnhealthy,
    Recovered,
    Expired(WorkerConnection),
    /// The worker id is gone or now belongs to a newer connection.
    Gone,
}

#[derive(Clone)]
pub struct HeartbeatMonitor {
    registry: Arc<Registry>,
    policy: HeartbeatPolicy,
    events: broadcast::Sender<HealthEvent>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<Registry>, policy: HeartbeatPolicy) -> Self {
        let (events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        Self {
            registry,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> HeartbeatPolicy {
        self.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: HealthEvent) {
        let _ = self.events.send(event);
    }

    /// Records inbound traffic from a worker. Traffic that arrives after the
    /// grace period does not revive the worker.
    pub fn record(
        &self,
        worker_id: &str,
        now: Instant,
    ) -> Result<HeartbeatOutcome, CoordinationError> {
        let outcome = self.registry.mark_heartbeat(worker_id, now, &self.policy);
        match &outcome {
            Ok(HeartbeatOutcome::Alive) => {}
            Ok(HeartbeatOutcome::Recovered) => {
                info!(event = "worker_recovered", worker_id);
                self.publish(HealthEvent::Recovered {
                    worker_id: worker_id.to_string(),
                });
            }
            Ok(HeartbeatOutcome::Expired(worker)) => {
                warn!(
                    event = "heartbeat_expired",
                    worker_id,
                    conn_id = %worker.conn_id(),
                    orphaned = worker.active_count(),
                    late_traffic = true
                );
                self.publish(HealthEvent::Expired {
                    worker_id: worker_id.to_string(),
                    orphaned: worker.active_count(),
                });
            }
            Err(err) => {
                debug!(event = "heartbeat_unknown_worker", worker_id, error = %err);
            }
        }
        outcome
    }

    /// Evaluates one worker generation and applies the resulting transition.
    pub fn check(&self, worker_id: &str, conn_id: &str, now: Instant) -> CheckOutcome {
        let policy = self.policy;
        self.registry.write(|state| {
            let (status, last_seen) = match state.workers.get(worker_id) {
                Some(worker) if worker.conn_id() == conn_id => (worker.status, worker.last_seen),
                _ => return CheckOutcome::Gone,
            };
            let (outcome, next) = match (policy.liveness(last_seen, now), status) {
                (Liveness::Expired, _) => {
                    return match state.remove_worker(worker_id) {
                        Ok(worker) => CheckOutcome::Expired(worker),
                        Err(_) => CheckOutcome::Gone,
                    };
                }
                (Liveness::Missed { intervals }, WorkerStatus::Connected) => (
                    CheckOutcome::MarkedUnhealthy { missed: intervals },
                    Some(WorkerStatus::Unhealthy),
                ),
                (Liveness::Missed { .. }, _) => (CheckOutcome::StillUnhealthy, None),
                (Liveness::Alive, WorkerStatus::Unhealthy) => {
                    (CheckOutcome::Recovered, Some(WorkerStatus::Connected))
                }
                (Liveness::Alive, _) => (CheckOutcome::Healthy, None),
            };
            let Some(next) = next else {
                return outcome;
            };
            match state.set_status(worker_id, next) {
                Ok(_) => outcome,
                Err(err) => {
                    warn!(
                        event = "heartbeat_transition_failed",
                        worker_id,
                        conn_id,
                        error = %err
                    );
                    match state.remove_worker(worker_id) {
                        Ok(worker) => CheckOutcome::Expired(worker),
                        Err(_) => CheckOutcome::Gone,
                    }
                }
            }
        })
    }

    /// Spawns the watchdog for one worker connection. It exits when the
    /// worker expires (after handing it to failover), when the record is
    /// gone, or on shutdown.
    pub fn spawn_watchdog(
        &self,
        worker_id: String,
        conn_id: String,
        disconnects: mpsc::Sender<DisconnectEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.policy.tick());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match monitor.check(&worker_id, &conn_id, Instant::now()) {
                            CheckOutcome::Healthy | CheckOutcome::StillUnhealthy => {}
                            CheckOutcome::MarkedUnhealthy { missed } => {
                                warn!(
                                    event = "heartbeat_missed",
                                    worker_id = %worker_id,
                                    conn_id = %conn_id,
                                    missed
                                );
                                monitor.publish(HealthEvent::HeartbeatMissed {
                                    worker_id: worker_id.clone(),
                                    missed,
                                });
                            }
                            CheckOutcome::Recovered => {
                                info!(
                                    event = "worker_recovered",
                                    worker_id = %worker_id,
                                    conn_id = %conn_id
                                );
                                monitor.publish(HealthEvent::Recovered {
                                    worker_id: worker_id.clone(),
                                });
                            }
                            CheckOutcome::Expired(worker) => {
                                warn!(
                                    event = "heartbeat_expired",
                                    worker_id = %worker_id,
                                    conn_id = %conn_id,
                                    orphaned = worker.active_count()
                                );
                                monitor.publish(HealthEvent::Expired {
                                    worker_id: worker_id.clone(),
                                    orphaned: worker.active_count(),
                                });
                                let event = DisconnectEvent {
                                    worker,
                                    reason: "heartbeat_timeout".to_string(),
                                };
                                if disconnects.send(event).await.is_err() {
                                    debug!(event = "failover_channel_closed", worker_id = %worker_id);
                                }
                                break;
                            }
                            CheckOutcome::Gone => break,
                        }
                    }
                }
            }
        })
    }
}
