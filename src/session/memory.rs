//! In-process session store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{SessionId, SessionStore, StoredSession};
use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    session: StoredSession,
    expires_at: Instant,
}

/// Sessions held in memory, for tests and single-instance deployments.
///
/// Expired sessions are dropped when next accessed.
#[derive(Debug)]
pub struct MemorySessionStore {
    entries: DashMap<SessionId, Entry>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, id: &SessionId, session: &StoredSession) -> Result<()> {
        self.entries.insert(
            id.clone(),
            Entry {
                session: session.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<StoredSession>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(id) {
            if entry.expires_at > now {
                return Ok(Some(entry.session.clone()));
            }
        }
        self.entries.remove_if(id, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(id)
            .is_some_and(|(_, entry)| entry.expires_at > now))
    }
}
