use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const RATE_WINDOW: Duration = Duration::from_secs(1);
const STATS_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    response_time: Duration,
    success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStatsSnapshot {
    pub requests_per_second: f64,
    pub average_response_time_ms: f64,
    pub error_rate: f64,
    pub throughput: u64,
}

/// Completion samples for the last minute plus a lifetime counter. Holds its
/// own lock so recording never contends with the registry.
#[derive(Default)]
pub struct MetricsAggregator {
    samples: Mutex<VecDeque<Sample>>,
    completed: AtomicU64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, success: bool, response_time: Duration, now: Instant) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.samples.lock();
        samples.push_back(Sample {
            at: now,
            response_time,
            success,
        });
        prune(&mut samples, now);
    }

    pub fn snapshot(&self) -> RoutingStatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> RoutingStatsSnapshot {
        let mut samples = self.samples.lock();
        prune(&mut samples, now);

        let mut recent = 0u64;
        let mut failures = 0u64;
        let mut total_ms = 0f64;
        for sample in samples.iter() {
            if now.saturating_duration_since(sample.at) < RATE_WINDOW {
                recent += 1;
            }
            if !sample.success {
                failures += 1;
            }
            total_ms += sample.response_time.as_secs_f64() * 1000.0;
        }
        let count = samples.len() as f64;
        let (average_response_time_ms, error_rate) = if samples.is_empty() {
            (0.0, 0.0)
        } else {
            (total_ms / count, failures as f64 / count)
        };

        RoutingStatsSnapshot {
            requests_per_second: recent as f64 / RATE_WINDOW.as_secs_f64(),
            average_response_time_ms,
            error_rate,
            throughput: self.completed.load(Ordering::Relaxed),
        }
    }
}

fn prune(samples: &mut VecDeque<Sample>, now: Instant) {
    while let Some(front) = samples.front() {
        if now.saturating_duration_since(front.at) < STATS_WINDOW {
            break;
        }
        samples.pop_front();
    }
}
