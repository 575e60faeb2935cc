//! Per-route bucket state and the grant decision.

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::route::Route;

/// Limit assumed for a route the server has not reported on yet.
pub const DEFAULT_LIMIT: u64 = 5;
/// Permits assumed for a route the server has not reported on yet.
///
/// One permit lets the first request through so the real values can be
/// learned from its response.
pub const DEFAULT_REMAINING: u64 = 1;

/// The locally known state of one server-side rate limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Maximum permits per window
    pub limit: u64,
    /// Permits left in the current window
    pub remaining: u64,
    /// When the current window refills
    pub reset_at: Instant,
    /// Whether `reset_at` was confirmed by a committed server report.
    ///
    /// An unsynced bucket never refills on its own: the end of its window is
    /// unknown until the next response arrives.
    pub synced: bool,
}

impl Bucket {
    /// Create an unsynced bucket whose reset lies at `now`.
    pub fn new(limit: u64, remaining: u64, now: Instant) -> Self {
        Self {
            limit,
            remaining: remaining.min(limit),
            reset_at: now,
            synced: false,
        }
    }

    /// Take one permit if the bucket allows it at `now`, ignoring any global limit.
    ///
    /// Returns `true` if a permit was granted.
    pub fn take_permit(&mut self, now: Instant) -> bool {
        if self.synced && self.reset_at <= now {
            // New window; its reset is unknown until the next commit
            self.remaining = self.limit;
            self.synced = false;
        }

        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// The outcome of evaluating a bucket for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed now
    Grant,
    /// Re-evaluate no earlier than this instant
    WaitUntil(Instant),
    /// Nothing will change until the transport commits fresh values
    AwaitCommit,
}

/// Decide whether a request against `bucket` may proceed at `now`.
///
/// The global deadline is consulted before the bucket, so a permit is never
/// spent while every route is blocked.
pub fn decide(bucket: &Bucket, global_until: Option<Instant>, now: Instant) -> Decision {
    if let Some(until) = global_until {
        if until > now {
            return Decision::WaitUntil(until);
        }
    }

    if bucket.synced && bucket.reset_at <= now {
        // A zero-limit window never opens; only a new report can change that
        if bucket.limit == 0 {
            return Decision::AwaitCommit;
        }
        return Decision::Grant;
    }

    if bucket.remaining > 0 {
        return Decision::Grant;
    }

    if bucket.synced {
        Decision::WaitUntil(bucket.reset_at)
    } else {
        Decision::AwaitCommit
    }
}

/// Route-keyed bucket storage.
///
/// Missing routes are materialized with the default bucket on first access,
/// so callers never see a missing entry. Each route's record is guarded by
/// its map shard; unrelated routes do not contend on a single lock.
pub struct BucketStore {
    buckets: DashMap<Route, Bucket>,
    default_limit: u64,
    default_remaining: u64,
}

impl BucketStore {
    /// Create a store using the built-in defaults for unseen routes.
    pub fn new() -> Self {
        Self::with_defaults(DEFAULT_LIMIT, DEFAULT_REMAINING)
    }

    /// Create a store with custom defaults for unseen routes.
    pub fn with_defaults(default_limit: u64, default_remaining: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            default_limit,
            default_remaining,
        }
    }

    /// Run `f` with exclusive access to the route's bucket.
    pub(crate) fn with_bucket<R>(&self, route: &Route, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut entry = self.buckets.entry(route.clone()).or_insert_with(|| {
            trace!(route = %route, "Materializing default bucket");
            Bucket::new(self.default_limit, self.default_remaining, Instant::now())
        });
        f(entry.value_mut())
    }

    /// Get the limit for a route.
    pub fn limit(&self, route: &Route) -> u64 {
        self.with_bucket(route, |b| b.limit)
    }

    /// Set the limit for a route.
    pub fn set_limit(&self, route: &Route, limit: u64) {
        self.with_bucket(route, |b| b.limit = limit);
    }

    /// Get the remaining permits for a route.
    pub fn remaining(&self, route: &Route) -> u64 {
        self.with_bucket(route, |b| b.remaining)
    }

    /// Set the remaining permits for a route.
    ///
    /// The value is clamped to the limit when the route is committed, since
    /// the limit may arrive after the remaining count within one report.
    pub fn set_remaining(&self, route: &Route, remaining: u64) {
        self.with_bucket(route, |b| b.remaining = remaining);
    }

    /// Get the reset instant for a route.
    pub fn reset(&self, route: &Route) -> Instant {
        self.with_bucket(route, |b| b.reset_at)
    }

    /// Set the reset instant for a route.
    pub fn set_reset(&self, route: &Route, reset_at: Instant) {
        self.with_bucket(route, |b| b.reset_at = reset_at);
    }

    /// Mark the route's current values as a consistent server report.
    pub fn commit(&self, route: &Route) -> Bucket {
        self.with_bucket(route, |b| {
            b.remaining = b.remaining.min(b.limit);
            b.synced = true;
            *b
        })
    }

    /// Get a copy of the route's bucket.
    pub fn snapshot(&self, route: &Route) -> Bucket {
        self.with_bucket(route, |b| *b)
    }

    /// Get the number of routes with a bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no route has a bucket yet.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for BucketStore {
    fn default() -> Self {
        Self::new()
    }
}
