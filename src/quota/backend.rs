//! Counter backend trait for abstracting the remote store and the local fallback.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::key::QuotaKey;
use super::window::QuotaWindow;
use crate::error::StoreError;

/// Which backend produced a reading or decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The shared counter store
    Store,
    /// The in-process fallback counter
    Fallback,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Store => f.write_str("store"),
            BackendKind::Fallback => f.write_str("fallback"),
        }
    }
}

/// One counter to check and charge: its key, limit and lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub key: QuotaKey,
    pub limit: u64,
    pub ttl: Duration,
}

impl WindowSpec {
    pub fn new(key: QuotaKey, window: &QuotaWindow) -> Self {
        Self {
            key,
            limit: window.limit(),
            ttl: window.ttl(),
        }
    }
}

/// The state of one counter as seen by a backend.
///
/// A missing or expired counter reads as `count = 0, ttl = None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterReading {
    pub count: u64,
    pub ttl: Option<Duration>,
}

impl CounterReading {
    pub fn new(count: u64, ttl: Option<Duration>) -> Self {
        Self { count, ttl }
    }
}

/// Result of a conditional batch charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every counter was incremented; readings are taken after the increment.
    Admitted { readings: Vec<CounterReading> },
    /// The counter at `index` is exhausted; readings describe the state that
    /// caused the rejection.
    Rejected {
        index: usize,
        readings: Vec<CounterReading>,
    },
}

/// Trait for counter backends.
///
/// This trait abstracts over the shared counter store and the in-process
/// fallback counter so the tracker's admission logic works with either.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Which kind of backend this is.
    fn kind(&self) -> BackendKind;

    /// Read the counters without modifying them.
    async fn read(&self, specs: &[WindowSpec]) -> Result<Vec<CounterReading>, StoreError>;

    /// Check every counter in order and, if none is exhausted, increment all
    /// of them as one unit.
    ///
    /// A counter is exhausted when `count >= limit`. Nothing is written when
    /// the batch is rejected. A counter's lifetime starts at its first
    /// increment and is not extended by later ones.
    async fn check_and_increment(&self, specs: &[WindowSpec]) -> Result<BatchOutcome, StoreError>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Index of the first exhausted counter, in check order.
pub fn first_exhausted(specs: &[WindowSpec], readings: &[CounterReading]) -> Option<usize> {
    specs
        .iter()
        .zip(readings)
        .position(|(spec, reading)| reading.count >= spec.limit)
}

/// Index of the first counter above its limit, in check order.
pub fn first_overshoot(specs: &[WindowSpec], readings: &[CounterReading]) -> Option<usize> {
    specs
        .iter()
        .zip(readings)
        .position(|(spec, reading)| reading.count > spec.limit)
}
