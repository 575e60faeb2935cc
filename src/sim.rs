//! Simulated remote service for exercising the route limiter.
//!
//! The server keeps its own authoritative per-route windows and reports them
//! back after each executed request, the way a real transport would relay
//! response metadata. Requests the server would have refused are counted so
//! a run shows whether the limiter kept traffic inside the announced limits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ratelimit::{Route, RouteRateLimiter};

/// Authoritative values the server reports for one executed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerReport {
    /// Whether the server accepted the request
    pub accepted: bool,
    /// The route's limit
    pub limit: u64,
    /// Permits left in the route's current window
    pub remaining: u64,
    /// When the route's current window ends
    pub reset_at: Instant,
    /// Global deadline announced with this response
    pub global_until: Option<Instant>,
}

impl ServerReport {
    /// Feed the report into the limiter as a transport would.
    pub fn apply(&self, limiter: &RouteRateLimiter, route: &Route) {
        if let Some(until) = self.global_until {
            limiter.update_global_rate_limit(until);
        }
        limiter.update_limit(route, self.limit);
        limiter.update_remaining(route, self.remaining);
        limiter.update_reset(route, self.reset_at);
        limiter.update_done(route);
    }
}

#[derive(Debug, Clone, Copy)]
struct ServerWindow {
    used: u64,
    reset_at: Instant,
}

/// Global limit the server announces after a number of requests.
#[derive(Debug, Clone, Copy)]
pub struct GlobalPause {
    /// Announce the pause on every n-th executed request
    pub every: u64,
    /// How long the pause lasts
    pub duration: Duration,
}

/// A remote service with fixed per-route windows.
#[derive(Debug)]
pub struct SimulatedServer {
    limit: u64,
    window: Duration,
    global_pause: Option<GlobalPause>,
    windows: Mutex<HashMap<Route, ServerWindow>>,
    executed: AtomicU64,
    rejected: AtomicU64,
}

impl SimulatedServer {
    /// Create a server allowing `limit` requests per route per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            global_pause: None,
            windows: Mutex::new(HashMap::new()),
            executed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Announce a global limit periodically.
    pub fn with_global_pause(mut self, pause: GlobalPause) -> Self {
        self.global_pause = Some(pause);
        self
    }

    /// Execute one request on `route`.
    pub fn execute(&self, route: &Route) -> ServerReport {
        let now = Instant::now();
        let executed = self.executed.fetch_add(1, Ordering::SeqCst) + 1;

        let (accepted, window) = {
            let mut windows = self.windows.lock();
            let window = windows.entry(route.clone()).or_insert(ServerWindow {
                used: 0,
                reset_at: now + self.window,
            });
            if window.reset_at <= now {
                window.used = 0;
                window.reset_at = now + self.window;
            }

            let accepted = window.used < self.limit;
            if accepted {
                window.used += 1;
            }
            (accepted, *window)
        };

        if !accepted {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            warn!(route = %route, "Server rejected request over limit");
        }

        let global_until = self
            .global_pause
            .filter(|pause| pause.every > 0 && executed % pause.every == 0)
            .map(|pause| now + pause.duration);

        ServerReport {
            accepted,
            limit: self.limit,
            remaining: self.limit.saturating_sub(window.used),
            reset_at: window.reset_at,
            global_until,
        }
    }

    /// Number of requests executed so far.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Number of requests the server refused.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationSummary {
    /// Requests executed against the server
    pub executed: u64,
    /// Requests the server refused
    pub rejected: u64,
    /// Wall time the run took
    pub elapsed: Duration,
}

/// Send `requests_per_route` concurrent requests on each route through the
/// limiter to the server.
pub async fn run(
    limiter: Arc<RouteRateLimiter>,
    server: Arc<SimulatedServer>,
    routes: &[Route],
    requests_per_route: usize,
) -> SimulationSummary {
    let start = Instant::now();

    let mut tasks = Vec::with_capacity(routes.len() * requests_per_route);
    for route in routes {
        for n in 0..requests_per_route {
            let limiter = limiter.clone();
            let server = server.clone();
            let route = route.clone();
            tasks.push(tokio::spawn(async move {
                limiter.request_execution(&route).await;
                let report = server.execute(&route);
                debug!(
                    route = %route,
                    request = n,
                    accepted = report.accepted,
                    remaining = report.remaining,
                    at_ms = start.elapsed().as_millis() as u64,
                    "Request executed"
                );
                report.apply(&limiter, &route);
            }));
        }
    }

    for result in join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "Simulated request task failed");
        }
    }

    let summary = SimulationSummary {
        executed: server.executed(),
        rejected: server.rejected(),
        elapsed: start.elapsed(),
    };
    info!(
        executed = summary.executed,
        rejected = summary.rejected,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Simulation finished"
    );
    summary
}
