//! Session backend trait for abstracting in-memory and external storage.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Shard index within the sharded connection set.
pub type ShardId = u32;

/// What is known about one shard's streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSession {
    /// Opaque session token issued on identify
    pub session_id: Option<String>,
    /// Last sequence number received on the stream
    pub sequence: Option<u64>,
}

/// Trait for session storage implementations.
///
/// Every operation is scoped to a single field of a single shard, so
/// concurrent writers for the session id and the sequence of the same shard
/// never overwrite each other. Missing shards read as absent, never as
/// errors.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Get the shard's session id.
    async fn session_id(&self, shard: ShardId) -> Option<String>;

    /// Set the shard's session id.
    async fn set_session_id(&self, shard: ShardId, session_id: String);

    /// Remove the shard's session id.
    async fn clear_session_id(&self, shard: ShardId);

    /// Get the shard's sequence.
    async fn sequence(&self, shard: ShardId) -> Option<u64>;

    /// Set the shard's sequence.
    async fn set_sequence(&self, shard: ShardId, sequence: u64);

    /// Raise the shard's sequence to `sequence` if it is higher, returning
    /// the stored value.
    async fn advance_sequence(&self, shard: ShardId, sequence: u64) -> u64;

    /// Remove the shard's sequence.
    async fn clear_sequence(&self, shard: ShardId);
}

/// In-memory session storage.
#[derive(Debug, Default)]
pub struct MemorySessionBackend {
    sessions: DashMap<ShardId, ShardSession>,
}

impl MemorySessionBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out every shard with at least one field set.
    pub fn snapshot(&self) -> HashMap<ShardId, ShardSession> {
        self.sessions
            .iter()
            .filter(|entry| entry.session_id.is_some() || entry.sequence.is_some())
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Serialize a snapshot as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Build a backend from a JSON snapshot.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: HashMap<ShardId, ShardSession> = serde_json::from_str(json)?;
        Ok(Self {
            sessions: snapshot.into_iter().collect(),
        })
    }
}

#[async_trait]
impl SessionBackend for MemorySessionBackend {
    async fn session_id(&self, shard: ShardId) -> Option<String> {
        self.sessions.get(&shard).and_then(|s| s.session_id.clone())
    }

    async fn set_session_id(&self, shard: ShardId, session_id: String) {
        self.sessions.entry(shard).or_default().session_id = Some(session_id);
    }

    async fn clear_session_id(&self, shard: ShardId) {
        if let Some(mut session) = self.sessions.get_mut(&shard) {
            session.session_id = None;
        }
    }

    async fn sequence(&self, shard: ShardId) -> Option<u64> {
        self.sessions.get(&shard).and_then(|s| s.sequence)
    }

    async fn set_sequence(&self, shard: ShardId, sequence: u64) {
        self.sessions.entry(shard).or_default().sequence = Some(sequence);
    }

    async fn advance_sequence(&self, shard: ShardId, sequence: u64) -> u64 {
        let mut session = self.sessions.entry(shard).or_default();
        let stored = session.sequence.map_or(sequence, |current| current.max(sequence));
        session.sequence = Some(stored);
        stored
    }

    async fn clear_sequence(&self, shard: ShardId) {
        if let Some(mut session) = self.sessions.get_mut(&shard) {
            session.sequence = None;
        }
    }
}
