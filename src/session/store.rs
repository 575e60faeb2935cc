//! Per-shard session continuity.

use std::sync::Arc;

use tracing::{debug, info, trace};

use super::backend::{MemorySessionBackend, SessionBackend, ShardId};

/// How a shard should (re)connect its streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Start a fresh session
    Identify,
    /// Continue a previous session after the given sequence
    Resume {
        /// Session token to resume
        session_id: String,
        /// Last sequence seen on the previous connection
        sequence: u64,
    },
}

/// Session ids and sequence numbers for each shard.
///
/// Shards never observe each other's values. The store is cheap to clone;
/// clones share the same backend.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
}

impl SessionStore {
    /// Create a store backed by memory.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(MemorySessionBackend::new()))
    }

    /// Create a store over a custom backend.
    pub fn with_backend(backend: Arc<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    /// Record the session id issued to a shard on identify.
    pub async fn set_session(&self, shard: ShardId, session_id: impl Into<String>) {
        let session_id = session_id.into();
        debug!(shard, "Session established");
        self.backend.set_session_id(shard, session_id).await;
    }

    /// Get the shard's session id.
    pub async fn session(&self, shard: ShardId) -> Option<String> {
        self.backend.session_id(shard).await
    }

    /// Record the shard's last seen sequence.
    pub async fn set_sequence(&self, shard: ShardId, sequence: u64) {
        trace!(shard, sequence, "Sequence set");
        self.backend.set_sequence(shard, sequence).await;
    }

    /// Record a received sequence without ever moving the counter backwards.
    pub async fn advance_sequence(&self, shard: ShardId, sequence: u64) -> u64 {
        self.backend.advance_sequence(shard, sequence).await
    }

    /// Get the shard's last seen sequence.
    pub async fn sequence(&self, shard: ShardId) -> Option<u64> {
        self.backend.sequence(shard).await
    }

    /// Forget the shard's session id.
    pub async fn clear_session(&self, shard: ShardId) {
        debug!(shard, "Session cleared");
        self.backend.clear_session_id(shard).await;
    }

    /// Forget the shard's sequence.
    pub async fn clear_sequence(&self, shard: ShardId) {
        self.backend.clear_sequence(shard).await;
    }

    /// Drop everything known about the shard's session after the server
    /// rejected it.
    pub async fn invalidate(&self, shard: ShardId) {
        info!(shard, "Session invalidated, next connect will identify");
        self.backend.clear_session_id(shard).await;
        self.backend.clear_sequence(shard).await;
    }

    /// Decide between resuming and identifying for the shard.
    ///
    /// Resume needs both a session id and a sequence.
    pub async fn connect_mode(&self, shard: ShardId) -> ConnectMode {
        let session_id = self.backend.session_id(shard).await;
        let sequence = self.backend.sequence(shard).await;

        match (session_id, sequence) {
            (Some(session_id), Some(sequence)) => {
                debug!(shard, sequence, "Resuming session");
                ConnectMode::Resume { session_id, sequence }
            }
            _ => {
                debug!(shard, "Identifying");
                ConnectMode::Identify
            }
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_absent_by_default() {
        let store = SessionStore::new();
        assert_eq!(store.session(0).await, None);
        assert_eq!(store.sequence(0).await, None);
        assert_eq!(store.connect_mode(0).await, ConnectMode::Identify);
    }

    #[tokio::test]
    async fn test_resume_needs_session_and_sequence() {
        let store = SessionStore::new();

        store.set_session(2, "token").await;
        assert_eq!(store.connect_mode(2).await, ConnectMode::Identify);

        store.set_sequence(2, 41).await;
        assert_eq!(
            store.connect_mode(2).await,
            ConnectMode::Resume {
                session_id: "token".to_string(),
                sequence: 41,
            }
        );
    }

    #[tokio::test]
    async fn test_clear_session_and_sequence() {
        let store = SessionStore::new();
        store.set_session(1, "token").await;
        store.set_sequence(1, 5).await;

        store.clear_session(1).await;
        assert_eq!(store.session(1).await, None);
        assert_eq!(store.sequence(1).await, Some(5));

        store.clear_sequence(1).await;
        assert_eq!(store.sequence(1).await, None);
    }

    #[tokio::test]
    async fn test_shards_are_independent() {
        let store = SessionStore::new();
        store.set_session(0, "zero").await;
        store.set_sequence(0, 100).await;
        store.set_session(1, "one").await;

        assert_eq!(store.session(0).await.as_deref(), Some("zero"));
        assert_eq!(store.session(1).await.as_deref(), Some("one"));
        assert_eq!(store.sequence(1).await, None);

        store.invalidate(0).await;
        assert_eq!(store.connect_mode(0).await, ConnectMode::Identify);
        assert_eq!(store.session(1).await.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_concurrent_shard_workers() {
        let store = SessionStore::new();

        let handles: Vec<_> = (0..8u32)
            .map(|shard| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.set_session(shard, format!("session-{}", shard)).await;
                    for seq in 1..=50 {
                        store.advance_sequence(shard, seq).await;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        for shard in 0..8u32 {
            assert_eq!(
                store.connect_mode(shard).await,
                ConnectMode::Resume {
                    session_id: format!("session-{}", shard),
                    sequence: 50,
                }
            );
        }
    }
}
