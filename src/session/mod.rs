//! Shard session continuity.
//!
//! A shard's streaming connection records its session id and last sequence
//! here so a dropped connection can resume instead of identifying again.

mod backend;
mod store;

pub use backend::{MemorySessionBackend, SessionBackend, ShardId, ShardSession};
pub use store::{ConnectMode, SessionStore};
