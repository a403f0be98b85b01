use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

/// Per-tenant sliding-window request counter.
///
/// A tenant is admitted only while fewer than `limit` requests fall inside
/// the trailing window; admission appends the current timestamp.
#[derive(Debug)]
pub struct TenantRateLimiter {
    limit: usize,
    window: Duration,
    buckets: DashMap<String, VecDeque<Instant>>,
}

impl TenantRateLimiter {
    /// Production window is one minute; tests shrink it.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            buckets: DashMap::new(),
        }
    }

    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.limit as u32
    }

    /// Try to admit one request for `tenant_id` right now.
    pub fn check(&self, tenant_id: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(tenant_id.to_string()).or_default();

        while let Some(oldest) = bucket.front() {
            if now.duration_since(*oldest) > self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.limit {
            warn!(tenant_id = %tenant_id, limit = self.limit, "Rate limit exceeded");
            return false;
        }

        bucket.push_back(now);
        true
    }
}
