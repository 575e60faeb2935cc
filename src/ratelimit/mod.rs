//! Rate limiting logic and state management.

pub mod bucket;
mod global;
mod limiter;
mod route;
mod rules;
mod window;

pub use bucket::{decide, Bucket, BucketStore, Decision};
pub use global::GlobalLimitState;
pub use limiter::RouteRateLimiter;
pub use route::Route;
pub use rules::{GuardRule, GuardRules, TimeUnit};
pub use window::{FixedWindowLimiter, RatelimitCheck};
