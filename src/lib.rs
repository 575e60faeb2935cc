//! Shardgate - client-side traffic shaping for sharded real-time services
//!
//! This crate gates outgoing requests against per-route buckets learned from
//! server responses and a global limit that overrides every route, offers a
//! local fixed-window limiter for client-side guard rails, and keeps each
//! shard's session id and sequence so dropped streaming connections can
//! resume.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod session;
pub mod sim;
