//! Per-source sliding-window rate limiting
//!
//! Each source keeps the timestamps of its recent requests; a request is
//! rejected when the window already holds the maximum. Pruning is lazy, on
//! each check. The table is shared by every connection task, so entries are
//! individually locked and a slow source never blocks another source's
//! checks.

use dashmap::DashMap;
use hyper::HeaderMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Default window duration
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default maximum requests per window
pub const DEFAULT_MAX_REQUESTS: usize = 10;
/// Source-table cap before stale entries are swept
const MAX_SOURCES: usize = 10_000;

/// Header consulted for the source key behind proxies
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Sliding-window request counter keyed by client source
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    sources: DashMap<String, Mutex<Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_REQUESTS)
    }
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            sources: DashMap::new(),
        }
    }

    /// Check whether a request from `source` is within quota, recording it
    /// if so
    pub fn allow(&self, source: &str) -> bool {
        self.allow_at(source, Instant::now())
    }

    fn allow_at(&self, source: &str, now: Instant) -> bool {
        if self.sources.len() > MAX_SOURCES {
            self.sweep_stale(now);
        }

        let entry = self.sources.entry(source.to_string()).or_default();
        let mut stamps = entry.lock();

        // A timestamp exactly at now - window is still inside the window
        stamps.retain(|t| now.duration_since(*t) <= self.window);

        if stamps.len() >= self.max_requests {
            return false;
        }
        stamps.push(now);
        true
    }

    /// Drop sources whose every timestamp has aged out of the window
    fn sweep_stale(&self, now: Instant) {
        self.sources.retain(|_, stamps| {
            stamps
                .get_mut()
                .iter()
                .any(|t| now.duration_since(*t) <= self.window)
        });
    }

    /// Number of sources currently tracked
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}

/// Derive the rate-limit source key for a request
///
/// The first comma-separated X-Forwarded-For entry wins, trimmed; the direct
/// peer address is the fallback. This trusts the nearest proxy and is not
/// spoof-resistant.
pub fn source_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| peer.ip().to_string())
}
