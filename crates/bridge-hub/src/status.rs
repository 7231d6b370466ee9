use crate::registry::PendingRequest;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub const STATUS_CACHE_MAX: usize = 1024;
pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Assigned,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    pub request_id: String,
    pub status: RequestState,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestStatus {
    pub fn live(request: &PendingRequest) -> Self {
        let status = if request.assigned_worker_id.is_some() {
            RequestState::Assigned
        } else {
            RequestState::Pending
        };
        Self {
            request_id: request.request_id.clone(),
            status,
            timestamp: Utc::now().to_rfc3339(),
            worker_id: request.assigned_worker_id.clone(),
            attempts: request.attempts,
            error: None,
        }
    }

    pub fn terminal(
        request: &PendingRequest,
        status: RequestState,
        worker_id: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            request_id: request.request_id.clone(),
            status,
            timestamp: Utc::now().to_rfc3339(),
            worker_id,
            attempts: request.attempts,
            error,
        }
    }
}

struct CacheEntry {
    status: RequestStatus,
    stored_at: Instant,
}

/// Terminal outcomes of finished requests, bounded by count and age.
pub struct StatusCache {
    entries: Mutex<(HashMap<String, CacheEntry>, VecDeque<String>)>,
    max: usize,
    ttl: Duration,
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(STATUS_CACHE_MAX, STATUS_CACHE_TTL)
    }
}

impl StatusCache {
    pub fn new(max: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new((HashMap::new(), VecDeque::new())),
            max: max.max(1),
            ttl,
        }
    }

    pub fn insert(&self, status: RequestStatus, now: Instant) {
        let mut guard = self.entries.lock();
        let (cache, order) = &mut *guard;
        let key = status.request_id.clone();
        if cache
            .insert(
                key.clone(),
                CacheEntry {
                    status,
                    stored_at: now,
                },
            )
            .is_some()
        {
            order.retain(|existing| existing != &key);
        }
        order.push_back(key);
        while order.len() > self.max {
            if let Some(oldest) = order.pop_front() {
                cache.remove(&oldest);
            }
        }
        while let Some(oldest) = order.front() {
            let expired = cache
                .get(oldest)
                .map_or(true, |entry| now.saturating_duration_since(entry.stored_at) > self.ttl);
            if !expired {
                break;
            }
            if let Some(oldest) = order.pop_front() {
                cache.remove(&oldest);
            }
        }
    }

    pub fn get(&self, request_id: &str, now: Instant) -> Option<RequestStatus> {
        let mut guard = self.entries.lock();
        let (cache, order) = &mut *guard;
        let entry = cache.get(request_id)?;
        if now.saturating_duration_since(entry.stored_at) <= self.ttl {
            return Some(entry.status.clone());
        }
        cache.remove(request_id);
        order.retain(|existing| existing != request_id);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
