//! Session persistence.
//!
//! Sessions share the counter store's infrastructure but live in their own
//! `session:` namespace, which never overlaps the `quota:` counters.

mod memory;
mod redis_store;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuotaError, Result};

pub use memory::MemorySessionStore;
pub use redis_store::RedisSessionStore;

/// Prefix of every session key in the store.
pub const SESSION_KEY_PREFIX: &str = "session";

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(QuotaError::Session(format!("invalid session id '{}'", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_store_key(&self) -> String {
        format!("{}:{}", SESSION_KEY_PREFIX, self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A persisted session payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            created_at: Utc::now(),
        }
    }
}

/// Storage for sessions. Entries expire on their own after the store's TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create or replace a session, restarting its lifetime.
    async fn save(&self, id: &SessionId, session: &StoredSession) -> Result<()>;

    async fn load(&self, id: &SessionId) -> Result<Option<StoredSession>>;

    /// Remove a session. Returns whether it existed.
    async fn delete(&self, id: &SessionId) -> Result<bool>;
}
