//! Redis-backed counter store.
//!
//! Quota counters live under `quota:<user_id>:<window>` and expire through the
//! store's native key TTL. Nothing here deletes a counter.

use std::time::Duration;

use async_trait::async_trait;
use redis::{Script, Value};
use tracing::{debug, error, trace};

use super::connection::StoreConnection;
use crate::config::{AtomicityMode, StoreConfig};
use crate::error::{Result, StoreError};
use crate::quota::{
    first_exhausted, first_overshoot, BackendKind, BatchOutcome, CounterBackend, CounterReading,
    WindowSpec,
};

/// CHARGE_SCRIPT checks and charges every window of one user atomically.
///
/// KEYS[i]: counter key of window i, in check order
/// ARGV[2i-1]: limit of window i
/// ARGV[2i]: lifetime of window i in seconds
///
/// Returns: {admitted (0/1), blocking window (1-based, 0 if admitted),
///           count_1, ttl_1, ..., count_n, ttl_n}
///
/// Counts are pre-check values on rejection and post-increment values on
/// admission. A key's TTL is only set when it has none, so the window restarts
/// a fixed time after its first increment.
const CHARGE_SCRIPT: &str = r#"
local n = #KEYS
local counts = {}
for i = 1, n do
  counts[i] = tonumber(redis.call('GET', KEYS[i]) or '0')
end

for i = 1, n do
  if counts[i] >= tonumber(ARGV[2 * i - 1]) then
    local out = {0, i}
    for j = 1, n do
      table.insert(out, counts[j])
      table.insert(out, redis.call('TTL', KEYS[j]))
    end
    return out
  end
end

local out = {1, 0}
for i = 1, n do
  local count = redis.call('INCR', KEYS[i])
  local ttl = redis.call('TTL', KEYS[i])
  if ttl < 0 then
    ttl = tonumber(ARGV[2 * i])
    redis.call('EXPIRE', KEYS[i], ttl)
  end
  table.insert(out, count)
  table.insert(out, ttl)
end
return out
"#;

/// The shared counter store.
pub struct RedisCounterStore {
    conn: StoreConnection,
    charge_script: Script,
    mode: AtomicityMode,
}

impl RedisCounterStore {
    /// Create a store for an already normalized URL. Does not connect.
    pub fn new(url: &str, config: &StoreConfig) -> Result<Self> {
        let conn = StoreConnection::open(url, Duration::from_millis(config.timeout_ms))?
            .with_connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        Ok(Self::with_connection(conn, config.atomicity))
    }

    pub fn with_connection(conn: StoreConnection, mode: AtomicityMode) -> Self {
        Self {
            conn,
            charge_script: Script::new(CHARGE_SCRIPT),
            mode,
        }
    }

    pub fn mode(&self) -> AtomicityMode {
        self.mode
    }

    pub fn connection(&self) -> &StoreConnection {
        &self.conn
    }

    async fn charge_with_script(
        &self,
        specs: &[WindowSpec],
    ) -> std::result::Result<BatchOutcome, StoreError> {
        let mut invocation = self.charge_script.prepare_invoke();
        for spec in specs {
            invocation
                .key(spec.key.to_store_key())
                .arg(spec.limit)
                .arg(ttl_arg(spec));
        }

        let reply: Vec<i64> = self
            .conn
            .run(|mut conn| async move { invocation.invoke_async(&mut conn).await })
            .await?;

        parse_charge_reply(&reply, specs.len())
    }

    async fn charge_with_pipeline(
        &self,
        specs: &[WindowSpec],
    ) -> std::result::Result<BatchOutcome, StoreError> {
        let readings = self.read(specs).await?;
        if let Some(index) = first_exhausted(specs, &readings) {
            return Ok(BatchOutcome::Rejected { index, readings });
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for spec in specs {
            let key = spec.key.to_store_key();
            pipe.cmd("INCR")
                .arg(&key)
                .cmd("EXPIRE")
                .arg(&key)
                .arg(ttl_arg(spec))
                .arg("NX")
                .ignore()
                .cmd("TTL")
                .arg(&key);
        }

        let values: Vec<Value> = self
            .conn
            .run(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        let readings = parse_pairs(&values, specs.len()).map_err(|index| {
            let window = specs[index.min(specs.len() - 1)].key.window;
            StoreError::PartialWrite {
                window,
                detail: format!(
                    "increment batch returned {} replies for {} windows",
                    values.len(),
                    specs.len()
                ),
            }
        })?;

        Ok(settle_pipeline_charge(specs, readings))
    }
}

/// Decide a pipelined charge from the post-increment readings.
///
/// Another instance may have charged between our read and our increment;
/// deny rather than admit past the limit.
fn settle_pipeline_charge(specs: &[WindowSpec], readings: Vec<CounterReading>) -> BatchOutcome {
    match first_overshoot(specs, &readings) {
        Some(index) => {
            debug!(
                key = %specs[index].key,
                count = readings[index].count,
                limit = specs[index].limit,
                "Concurrent charge pushed counter past its limit; denying"
            );
            BatchOutcome::Rejected { index, readings }
        }
        None => BatchOutcome::Admitted { readings },
    }
}

#[async_trait]
impl CounterBackend for RedisCounterStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Store
    }

    async fn read(
        &self,
        specs: &[WindowSpec],
    ) -> std::result::Result<Vec<CounterReading>, StoreError> {
        let mut pipe = redis::pipe();
        for spec in specs {
            let key = spec.key.to_store_key();
            pipe.cmd("GET").arg(&key).cmd("TTL").arg(&key);
        }

        let values: Vec<Value> = self
            .conn
            .run(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        parse_pairs(&values, specs.len()).map_err(|_| {
            StoreError::Protocol(format!(
                "read returned {} replies for {} windows",
                values.len(),
                specs.len()
            ))
        })
    }

    async fn check_and_increment(
        &self,
        specs: &[WindowSpec],
    ) -> std::result::Result<BatchOutcome, StoreError> {
        trace!(mode = ?self.mode, windows = specs.len(), "Charging counter store");
        let outcome = match self.mode {
            AtomicityMode::Script => self.charge_with_script(specs).await,
            AtomicityMode::Pipeline => self.charge_with_pipeline(specs).await,
        };

        if let Err(StoreError::PartialWrite { window, detail }) = &outcome {
            error!(
                window = %window,
                detail = %detail,
                "Counter store charge only partly confirmed"
            );
        }
        outcome
    }

    async fn ping(&self) -> std::result::Result<(), StoreError> {
        let _: String = self
            .conn
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }
}

fn ttl_arg(spec: &WindowSpec) -> u64 {
    spec.ttl.as_secs().max(1)
}

/// Store TTL replies: -2 (no key) and -1 (no expiry) carry no lifetime.
fn ttl_from_reply(ttl: i64) -> Option<Duration> {
    u64::try_from(ttl).ok().filter(|t| *t > 0).map(Duration::from_secs)
}

fn parse_charge_reply(
    reply: &[i64],
    windows: usize,
) -> std::result::Result<BatchOutcome, StoreError> {
    if reply.len() != 2 + 2 * windows {
        return Err(StoreError::Protocol(format!(
            "charge script returned {} values for {} windows",
            reply.len(),
            windows
        )));
    }

    let readings: Vec<CounterReading> = reply[2..]
        .chunks_exact(2)
        .map(|pair| CounterReading::new(pair[0].max(0) as u64, ttl_from_reply(pair[1])))
        .collect();

    match (reply[0], reply[1]) {
        (1, _) => Ok(BatchOutcome::Admitted { readings }),
        (0, blocked) if blocked >= 1 && (blocked as usize) <= windows => Ok(BatchOutcome::Rejected {
            index: blocked as usize - 1,
            readings,
        }),
        (status, blocked) => Err(StoreError::Protocol(format!(
            "charge script returned status {} with blocking window {}",
            status, blocked
        ))),
    }
}

/// Parse `(count, ttl)` reply pairs. On failure returns the index of the
/// first window whose pair is missing or unreadable.
fn parse_pairs(
    values: &[Value],
    windows: usize,
) -> std::result::Result<Vec<CounterReading>, usize> {
    let mut readings = Vec::with_capacity(windows);
    for index in 0..windows {
        let (Some(count), Some(ttl)) = (values.get(2 * index), values.get(2 * index + 1)) else {
            return Err(index);
        };
        let count: Option<u64> = redis::from_redis_value(count).map_err(|_| index)?;
        let ttl: i64 = redis::from_redis_value(ttl).map_err(|_| index)?;
        readings.push(CounterReading::new(count.unwrap_or(0), ttl_from_reply(ttl)));
    }
    if values.len() != 2 * windows {
        return Err(windows.min(values.len() / 2));
    }
    Ok(readings)
}
