//! Local fixed-window limiter.
//!
//! Used for client-side guard rails such as capping reconnect attempts. It
//! never receives server feedback.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, trace};

use super::rules::GuardRule;

/// The result of a fixed-window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatelimitCheck {
    /// Whether the action must not happen now
    pub limited: bool,
    /// Permits left in the current window after this check
    pub remaining: u64,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    remaining: u64,
    reset_at: Instant,
}

/// A keyed fixed-window limiter.
///
/// The first check for an id opens a window of `period` and grants. A window
/// that has elapsed is restarted with `limit` permits before the check is
/// evaluated. Within a window each grant takes one permit; once none remain
/// the id is limited until the window ends.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct FixedWindowLimiter<K = String>
where
    K: Eq + Hash,
{
    counters: DashMap<K, WindowCounter>,
}

impl<K> FixedWindowLimiter<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Check and take a permit for `id`.
    pub fn check_ratelimit(&self, id: &K, period: Duration, limit: u64) -> RatelimitCheck {
        self.check_ratelimit_at(id, period, limit, Instant::now())
    }

    /// Check and take a permit for `id` using a named guard rule.
    pub fn check_rule(&self, id: &K, rule: &GuardRule) -> RatelimitCheck {
        self.check_ratelimit(id, rule.period(), rule.requests_per_unit)
    }

    /// Check and take a permit for `id` as of `now`.
    pub fn check_ratelimit_at(&self, id: &K, period: Duration, limit: u64, now: Instant) -> RatelimitCheck {
        let mut entry = self.counters.entry(id.clone()).or_insert_with(|| {
            trace!(id = ?id, limit, period_ms = period.as_millis() as u64, "Opening window");
            WindowCounter {
                remaining: limit,
                reset_at: now + period,
            }
        });
        let counter = entry.value_mut();

        if counter.reset_at <= now {
            counter.remaining = limit;
            counter.reset_at = now + period;
        }
        counter.remaining = counter.remaining.min(limit);

        if counter.remaining == 0 {
            debug!(id = ?id, "Local rate limit reached");
            return RatelimitCheck {
                limited: true,
                remaining: 0,
            };
        }

        counter.remaining -= 1;
        RatelimitCheck {
            limited: false,
            remaining: counter.remaining,
        }
    }

    /// Time until the id's window ends, if it has one that is still open.
    pub fn reset_in(&self, id: &K) -> Option<Duration> {
        let now = Instant::now();
        self.counters
            .get(id)
            .map(|c| c.reset_at)
            .filter(|reset_at| *reset_at > now)
            .map(|reset_at| reset_at - now)
    }

    /// Forget the id's window.
    pub fn clear(&self, id: &K) {
        self.counters.remove(id);
    }

    /// Get the number of tracked ids.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no id is tracked.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl<K> Default for FixedWindowLimiter<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
