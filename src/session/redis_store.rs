//! Session store on the shared Redis instance.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, trace};

use super::{SessionId, SessionStore, StoredSession};
use crate::config::{SessionConfig, StoreConfig};
use crate::error::{QuotaError, Result};
use crate::store::StoreConnection;

/// Sessions stored as JSON strings under `session:<id>` with a key TTL.
#[derive(Debug)]
pub struct RedisSessionStore {
    conn: StoreConnection,
    ttl: Duration,
}

impl RedisSessionStore {
    /// Create a store for an already normalized URL. Does not connect.
    pub fn new(url: &str, store: &StoreConfig, session: &SessionConfig) -> Result<Self> {
        let conn = StoreConnection::open(url, Duration::from_millis(store.timeout_ms))?
            .with_connect_timeout(Duration::from_millis(store.connect_timeout_ms));
        Ok(Self::with_connection(conn, Duration::from_secs(session.ttl_secs)))
    }

    pub fn with_connection(conn: StoreConnection, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn save(&self, id: &SessionId, session: &StoredSession) -> Result<()> {
        let key = id.to_store_key();
        let payload = serde_json::to_string(session)
            .map_err(|e| QuotaError::Session(format!("cannot encode session {}: {}", id, e)))?;
        let seconds = self.ttl.as_secs().max(1);

        trace!(key = %key, ttl = seconds, "Saving session");
        self.conn
            .run(|mut conn| async move { conn.set_ex::<_, _, ()>(key, payload, seconds).await })
            .await?;
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<StoredSession>> {
        let key = id.to_store_key();
        let payload: Option<String> = self
            .conn
            .run(|mut conn| async move { conn.get(key).await })
            .await?;

        match payload {
            Some(payload) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| QuotaError::Session(format!("corrupt session {}: {}", id, e))),
            None => {
                debug!(session_id = %id, "Session not found or expired");
                Ok(None)
            }
        }
    }

    async fn delete(&self, id: &SessionId) -> Result<bool> {
        let key = id.to_store_key();
        let removed: u64 = self
            .conn
            .run(|mut conn| async move { conn.del(key).await })
            .await?;
        Ok(removed > 0)
    }
}
