//! In-process conversation memory.
//!
//! Every session owns a `tokio::sync::Mutex`, which is fair (FIFO), so
//! writes to one session are applied in the order they queued and sessions
//! never block each other. Turns are kept sorted by their reserved
//! `sequence`, so a slow request that arrived first still lands first.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use docrag_core::capabilities::ConversationMemory;
use docrag_core::models::ConversationTurn;
use docrag_core::Result;

#[derive(Default)]
struct SessionState {
    turns: Vec<ConversationTurn>,
    next_sequence: u64,
}

/// [`ConversationMemory`] bounded to `max_turns` per session.
pub struct InMemoryConversationMemory {
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
    max_turns: usize,
}

impl InMemoryConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_turns: max_turns.max(1),
        }
    }

    /// The session's lock, created on first use. The map guard is released
    /// before the caller awaits the lock.
    fn session(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl ConversationMemory for InMemoryConversationMemory {
    async fn next_sequence(&self, session_id: &str) -> Result<u64> {
        let session = self.session(session_id);
        let mut state = session.lock().await;
        let seq = state.next_sequence;
        state.next_sequence += 1;
        Ok(seq)
    }

    async fn append(&self, turn: ConversationTurn) -> Result<()> {
        let session = self.session(&turn.session_id);
        let mut state = session.lock().await;

        let at = state.turns.partition_point(|t| t.sequence <= turn.sequence);
        state.turns.insert(at, turn);

        let overflow = state.turns.len().saturating_sub(self.max_turns);
        if overflow > 0 {
            state.turns.drain(..overflow);
        }
        Ok(())
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationTurn>> {
        let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) else {
            return Ok(Vec::new());
        };
        let state = session.lock().await;
        let start = state.turns.len().saturating_sub(limit);
        Ok(state.turns[start..].to_vec())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        self.recent(session_id, usize::MAX).await
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        if let Some(session) = self.sessions.get(session_id).map(|s| s.clone()) {
            // the sequence counter survives so later turns still sort after
            // any request already in flight
            session.lock().await.turns.clear();
        }
        Ok(())
    }
}
