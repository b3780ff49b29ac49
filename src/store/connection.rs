//! Lazily established, shared connection to the counter store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use super::url::redact;
use crate::error::{QuotaError, Result, StoreError};

/// A handle to the store that connects on first use and reconnects after a
/// connectivity failure.
///
/// Commands are bounded by the command timeout. Connecting runs in its own
/// task under a separate, usually longer, timeout: a caller that stops waiting
/// does not abort the handshake, and the finished connection is cached for the
/// next call.
pub struct StoreConnection {
    client: redis::Client,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    timeout: Duration,
    connect_timeout: Duration,
    display_url: String,
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnection")
            .field("url", &self.display_url)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl StoreConnection {
    /// Create a handle without connecting. The connect timeout defaults to the
    /// command timeout.
    pub fn open(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| QuotaError::Config(format!("invalid store url: {}", e)))?;
        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(None)),
            timeout,
            connect_timeout: timeout,
            display_url: redact(url),
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// URL of the store with credentials masked.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    /// Whether a connection is currently cached.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn connection(&self) -> std::result::Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.conn.lock().await.as_ref() {
            return Ok(conn.clone());
        }

        let slot = self.conn.clone();
        let client = self.client.clone();
        let connect_timeout = self.connect_timeout;
        let display_url = self.display_url.clone();

        let handshake = tokio::spawn(async move {
            let mut guard = slot.lock_owned().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }

            debug!(url = %display_url, "Connecting to counter store");
            let conn = match timeout(connect_timeout, client.get_multiplexed_async_connection())
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(StoreError::from(e)),
                Err(_) => return Err(StoreError::Timeout(connect_timeout)),
            };
            info!(url = %display_url, "Connected to counter store");

            *guard = Some(conn.clone());
            Ok(conn)
        });

        handshake
            .await
            .map_err(|e| StoreError::Unreachable(format!("connect task failed: {}", e)))?
    }

    /// Drop the cached connection so the next call reconnects.
    pub async fn invalidate(&self) {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            debug!(url = %self.display_url, "Dropped counter store connection");
        }
    }

    /// Run one round trip against the store.
    pub async fn run<T, F, Fut>(&self, op: F) -> std::result::Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        let result = match timeout(self.timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::from(e)),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        if let Err(ref e) = result {
            if e.is_connectivity() {
                self.invalidate().await;
            }
        }
        result
    }
}
