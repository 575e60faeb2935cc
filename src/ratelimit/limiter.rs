//! Route rate limiter driven by server-reported bucket values.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::bucket::{decide, Bucket, BucketStore, Decision};
use super::global::GlobalLimitState;
use super::route::Route;
use crate::clock::instant_from_utc;
use crate::config::LimiterConfig;
use crate::error::{Result, ShardgateError};

/// Waiters registered against one route.
#[derive(Debug, Default)]
struct RouteWaiters {
    /// Fired by `update_done` for the route
    committed: Notify,
    /// Callers currently waiting for a permit
    queued: AtomicUsize,
}

/// Counts a caller as queued until it is granted or abandons its wait.
struct QueuedGuard<'a>(&'a AtomicUsize);

impl<'a> QueuedGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A caller's hold on a route's waiters.
///
/// The route's entry is removed once the last holder lets go, so the registry
/// only keeps routes that have callers in flight.
struct WaiterRegistration<'a> {
    registry: &'a DashMap<Route, Arc<RouteWaiters>>,
    route: &'a Route,
    waiters: Arc<RouteWaiters>,
}

impl<'a> WaiterRegistration<'a> {
    fn new(registry: &'a DashMap<Route, Arc<RouteWaiters>>, route: &'a Route) -> Self {
        let waiters = registry
            .entry(route.clone())
            .or_insert_with(|| Arc::new(RouteWaiters::default()))
            .clone();
        Self {
            registry,
            route,
            waiters,
        }
    }
}

impl Drop for WaiterRegistration<'_> {
    fn drop(&mut self) {
        // Two references left means the map's and ours; registering takes the
        // same shard lock, so no new holder can appear while this runs
        self.registry.remove_if(self.route, |_, waiters| {
            Arc::ptr_eq(waiters, &self.waiters) && Arc::strong_count(waiters) == 2
        });
    }
}

/// The asynchronous gate for outgoing requests.
///
/// Requests ask for a permit with [`request_execution`](Self::request_execution).
/// After executing a request the transport reports the authoritative bucket
/// values with the `update_*` methods and then calls
/// [`update_done`](Self::update_done), which is the only point where queued
/// callers for that route are re-evaluated.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RouteRateLimiter {
    /// Bucket state indexed by route
    buckets: BucketStore,
    /// Deadline blocking every route
    global: GlobalLimitState,
    /// Pending waiters indexed by route
    waiters: DashMap<Route, Arc<RouteWaiters>>,
}

impl RouteRateLimiter {
    /// Create a new rate limiter with default settings.
    pub fn new() -> Self {
        Self::with_config(&LimiterConfig::default())
    }

    /// Create a new rate limiter using the given default bucket values.
    pub fn with_config(config: &LimiterConfig) -> Self {
        Self {
            buckets: BucketStore::with_defaults(config.default_limit, config.default_remaining),
            global: GlobalLimitState::new(),
            waiters: DashMap::new(),
        }
    }

    /// Evaluate the route at `now`, taking a permit if one is granted.
    fn try_acquire(&self, route: &Route, now: Instant) -> Decision {
        let global = self.global.active_at(now);
        self.buckets.with_bucket(route, |bucket| {
            let mut decision = decide(bucket, global, now);
            if decision == Decision::Grant && !bucket.take_permit(now) {
                decision = Decision::AwaitCommit;
            }
            trace!(
                route = %route,
                decision = ?decision,
                remaining = bucket.remaining,
                "Evaluated route bucket"
            );
            decision
        })
    }

    /// Wait until a request on `route` may execute.
    ///
    /// The permit is taken at the moment of grant; dropping this future while
    /// it waits consumes nothing and leaves other waiters untouched.
    pub async fn request_execution(&self, route: &Route) {
        let registration = WaiterRegistration::new(&self.waiters, route);
        let waiters = &*registration.waiters;
        let mut queued: Option<QueuedGuard<'_>> = None;

        loop {
            // Register interest before evaluating so a racing commit is not missed
            let committed = waiters.committed.notified();
            let global_changed = self.global.changed().notified();
            tokio::pin!(committed);
            tokio::pin!(global_changed);
            committed.as_mut().enable();
            global_changed.as_mut().enable();

            let now = Instant::now();
            let decision = self.try_acquire(route, now);

            if decision != Decision::Grant && queued.is_none() {
                queued = Some(QueuedGuard::new(&waiters.queued));
            }

            match decision {
                Decision::Grant => return,
                Decision::WaitUntil(at) => {
                    debug!(
                        route = %route,
                        wait_ms = at.saturating_duration_since(now).as_millis() as u64,
                        "Request queued until window reset"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = &mut committed => {}
                        _ = &mut global_changed => {}
                    }
                }
                Decision::AwaitCommit => {
                    debug!(route = %route, "Request queued until bucket update");
                    tokio::select! {
                        _ = &mut committed => {}
                        _ = &mut global_changed => {}
                    }
                }
            }
        }
    }

    /// Wait for a permit on `route` for at most `timeout`.
    ///
    /// Expiry returns a retryable [`ShardgateError::WaitTimeout`] and consumes
    /// no permit.
    pub async fn request_execution_timeout(&self, route: &Route, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.request_execution(route)).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(route = %route, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for permit");
                Err(ShardgateError::WaitTimeout {
                    route: route.to_string(),
                    waited: timeout,
                })
            }
        }
    }

    /// Record the server-reported remaining permits for a route.
    ///
    /// Does not release waiters; call [`update_done`](Self::update_done) after
    /// the full report has been applied.
    pub fn update_remaining(&self, route: &Route, remaining: u64) {
        trace!(route = %route, remaining, "Updating remaining");
        self.buckets.set_remaining(route, remaining);
    }

    /// Record the server-reported limit for a route.
    pub fn update_limit(&self, route: &Route, limit: u64) {
        trace!(route = %route, limit, "Updating limit");
        self.buckets.set_limit(route, limit);
    }

    /// Record the server-reported window reset for a route.
    pub fn update_reset(&self, route: &Route, reset_at: Instant) {
        trace!(route = %route, "Updating reset");
        self.buckets.set_reset(route, reset_at);
    }

    /// Record a window reset given relative to now.
    pub fn update_reset_after(&self, route: &Route, after: Duration) {
        self.update_reset(route, Instant::now() + after);
    }

    /// Record a window reset given as an absolute wall-clock time.
    pub fn update_reset_at(&self, route: &Route, reset_at: DateTime<Utc>) {
        self.update_reset(route, instant_from_utc(reset_at));
    }

    /// Commit the values reported for one response and re-evaluate the
    /// route's waiters.
    pub fn update_done(&self, route: &Route) {
        let bucket = self.buckets.commit(route);
        debug!(
            route = %route,
            limit = bucket.limit,
            remaining = bucket.remaining,
            reset_in_ms = bucket.reset_at.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Bucket update committed"
        );

        if let Some(waiters) = self.waiters.get(route) {
            waiters.committed.notify_waiters();
        }
    }

    /// Block every route until `until`.
    pub fn update_global_rate_limit(&self, until: Instant) {
        info!(
            wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
            "Global rate limit set"
        );
        self.global.set(until);
    }

    /// The global deadline, if one is currently active.
    pub fn global_limit(&self) -> Option<Instant> {
        self.global.active_at(Instant::now())
    }

    /// Get a copy of the route's bucket.
    pub fn bucket(&self, route: &Route) -> Bucket {
        self.buckets.snapshot(route)
    }

    /// Get the number of callers currently waiting on a route.
    pub fn queued(&self, route: &Route) -> usize {
        self.waiters
            .get(route)
            .map(|w| w.queued.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Get the number of routes with callers in flight.
    pub fn waiting_routes(&self) -> usize {
        self.waiters.len()
    }

    /// Get the number of routes with a bucket.
    pub fn route_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RouteRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn test_route() -> Route {
        Route::new("POST", "/channels/{channel_id}/messages").with_major("42")
    }

    /// Commit a full server report for a route.
    fn report(limiter: &RouteRateLimiter, route: &Route, limit: u64, remaining: u64, reset_after: Duration) {
        limiter.update_limit(route, limit);
        limiter.update_remaining(route, remaining);
        limiter.update_reset_after(route, reset_after);
        limiter.update_done(route);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_permits_resolve_immediately() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        report(&limiter, &route, 5, 3, Duration::from_secs(10));

        let start = Instant::now();
        for _ in 0..3 {
            limiter.request_execution(&route).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.bucket(&route).remaining, 0);

        // The fourth waits for the window to reset
        limiter.request_execution(&route).await;
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_refills_to_limit() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        report(&limiter, &route, 5, 0, Duration::from_secs(1));

        let start = Instant::now();
        limiter.request_execution(&route).await;

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(limiter.bucket(&route).remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_bucket_learns_from_first_response() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();

        // The optimistic default lets the first request through
        limiter.request_execution(&route).await;
        assert_eq!(limiter.bucket(&route).remaining, 0);

        let mut second = task::spawn(limiter.request_execution(&route));
        assert_pending!(second.poll());
        assert_eq!(limiter.queued(&route), 1);

        // Field updates alone release nobody
        limiter.update_limit(&route, 5);
        limiter.update_remaining(&route, 4);
        limiter.update_reset_after(&route, Duration::from_secs(10));
        assert_pending!(second.poll());

        limiter.update_done(&route);
        assert!(second.is_woken());
        assert_ready!(second.poll());
        drop(second);

        let bucket = limiter.bucket(&route);
        assert_eq!(bucket.limit, 5);
        assert_eq!(bucket.remaining, 3);
        assert!(bucket.synced);
        assert_eq!(limiter.queued(&route), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_blocks_routes_with_capacity() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        report(&limiter, &route, 5, 3, Duration::from_secs(10));

        let start = Instant::now();
        limiter.update_global_rate_limit(start + Duration::from_secs(2));
        assert!(limiter.global_limit().is_some());

        limiter.request_execution(&route).await;

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(10));
        assert_eq!(limiter.bucket(&route).remaining, 2);
        assert!(limiter.global_limit().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_limit_blocks_unseen_routes() {
        let limiter = RouteRateLimiter::new();
        let route = Route::new("GET", "/users/@me");

        let start = Instant::now();
        limiter.update_global_rate_limit(start + Duration::from_millis(500));
        limiter.request_execution(&route).await;

        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_releases_at_most_remaining_waiters() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        limiter.request_execution(&route).await;

        let mut waiters: Vec<_> = (0..3)
            .map(|_| task::spawn(limiter.request_execution(&route)))
            .collect();
        for waiter in waiters.iter_mut() {
            assert_pending!(waiter.poll());
        }

        report(&limiter, &route, 5, 2, Duration::from_secs(10));

        let mut granted = 0;
        for waiter in waiters.iter_mut() {
            if waiter.poll().is_ready() {
                granted += 1;
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(limiter.bucket(&route).remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_wait_consumes_nothing() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        report(&limiter, &route, 5, 0, Duration::from_secs(5));

        let mut waiter = task::spawn(limiter.request_execution(&route));
        assert_pending!(waiter.poll());
        assert_eq!(limiter.queued(&route), 1);
        drop(waiter);
        assert_eq!(limiter.queued(&route), 0);

        let start = Instant::now();
        limiter.request_execution(&route).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(limiter.bucket(&route).remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_route_does_not_stall_others() {
        let limiter = RouteRateLimiter::new();
        let blocked = test_route();
        let other = Route::new("POST", "/channels/{channel_id}/messages").with_major("43");

        limiter.request_execution(&blocked).await;
        let mut stuck = task::spawn(limiter.request_execution(&blocked));
        assert_pending!(stuck.poll());

        let start = Instant::now();
        limiter.request_execution(&other).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_pending!(stuck.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_reset_at_wall_clock() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        let now = Instant::now();

        limiter.update_reset_at(&route, Utc::now() + chrono::Duration::seconds(2));
        limiter.update_done(&route);

        let reset_at = limiter.bucket(&route).reset_at;
        assert!(reset_at > now + Duration::from_secs(1));
        assert!(reset_at <= now + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_window_grants_nothing() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        report(&limiter, &route, 0, 0, Duration::ZERO);

        let err = limiter
            .request_execution_timeout(&route, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(limiter.bucket(&route).remaining, 0);

        // A later report opening the route lets callers through again
        report(&limiter, &route, 2, 2, Duration::from_secs(1));
        limiter
            .request_execution_timeout(&route, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(limiter.bucket(&route).remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_entries_released_when_idle() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();

        limiter.request_execution(&route).await;
        assert_eq!(limiter.waiting_routes(), 0);

        let mut waiter = task::spawn(limiter.request_execution(&route));
        assert_pending!(waiter.poll());
        assert_eq!(limiter.waiting_routes(), 1);

        drop(waiter);
        assert_eq!(limiter.waiting_routes(), 0);

        // A fresh waiter after cleanup is still released by a commit
        let mut waiter = task::spawn(limiter.request_execution(&route));
        assert_pending!(waiter.poll());
        report(&limiter, &route, 5, 4, Duration::from_secs(10));
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        drop(waiter);
        assert_eq!(limiter.waiting_routes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_entry_kept_while_others_wait() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        limiter.request_execution(&route).await;

        let mut first = task::spawn(limiter.request_execution(&route));
        let mut second = task::spawn(limiter.request_execution(&route));
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        drop(first);
        assert_eq!(limiter.waiting_routes(), 1);
        assert_eq!(limiter.queued(&route), 1);

        report(&limiter, &route, 5, 1, Duration::from_secs(10));
        assert_ready!(second.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_execution_timeout() {
        let limiter = RouteRateLimiter::new();
        let route = test_route();
        report(&limiter, &route, 5, 0, Duration::from_secs(30));

        let err = limiter
            .request_execution_timeout(&route, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(limiter.queued(&route), 0);

        limiter
            .request_execution_timeout(&route, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(limiter.bucket(&route).remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_not_oversold() {
        let limiter = Arc::new(RouteRateLimiter::new());
        let route = test_route();
        report(&limiter, &route, 3, 3, Duration::from_secs(1));

        let start = Instant::now();
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = limiter.clone();
                let route = route.clone();
                tokio::spawn(async move {
                    limiter.request_execution(&route).await;
                    start.elapsed()
                })
            })
            .collect();

        let mut granted = Vec::new();
        for handle in handles {
            granted.push(handle.await.unwrap());
        }

        let first_window = granted.iter().filter(|t| **t < Duration::from_secs(1)).count();
        assert_eq!(first_window, 3, "granted {:?}", granted);
        assert_eq!(limiter.bucket(&route).remaining, 0);
    }
}
