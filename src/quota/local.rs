//! In-process fallback counter.
//!
//! Counters live in local memory only: they are not shared with other
//! instances and do not survive a restart. Expired entries are treated as
//! absent on access; an optional sweeper reclaims their memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{
    first_exhausted, BackendKind, BatchOutcome, CounterBackend, CounterReading, WindowSpec,
};
use super::key::QuotaKey;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn reading(&self, now: Instant) -> CounterReading {
        CounterReading::new(self.count, Some(self.expires_at - now))
    }
}

/// The in-process fallback counter.
///
/// A single lock guards all slots so a batch of window checks and increments
/// for one user is applied as one unit within this process.
#[derive(Debug, Default)]
pub struct LocalCounter {
    slots: Mutex<HashMap<QuotaKey, Slot>>,
}

impl LocalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries and return how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.is_live(now));
        before - slots.len()
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically sweep expired entries.
    ///
    /// The task holds a weak reference and exits once the counter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let counter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(counter) = counter.upgrade() else {
                    break;
                };
                let removed = counter.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired fallback counters");
                }
            }
        })
    }

    fn read_locked(
        slots: &HashMap<QuotaKey, Slot>,
        specs: &[WindowSpec],
        now: Instant,
    ) -> Vec<CounterReading> {
        specs
            .iter()
            .map(|spec| match slots.get(&spec.key) {
                Some(slot) if slot.is_live(now) => slot.reading(now),
                _ => CounterReading::default(),
            })
            .collect()
    }
}

#[async_trait]
impl CounterBackend for LocalCounter {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn read(&self, specs: &[WindowSpec]) -> Result<Vec<CounterReading>, StoreError> {
        let now = Instant::now();
        let slots = self.slots.lock();
        Ok(Self::read_locked(&slots, specs, now))
    }

    async fn check_and_increment(&self, specs: &[WindowSpec]) -> Result<BatchOutcome, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();

        let readings = Self::read_locked(&slots, specs, now);
        if let Some(index) = first_exhausted(specs, &readings) {
            trace!(
                key = %specs[index].key,
                count = readings[index].count,
                "Fallback counter exhausted"
            );
            return Ok(BatchOutcome::Rejected { index, readings });
        }

        let mut updated = Vec::with_capacity(specs.len());
        for spec in specs {
            let slot = slots
                .entry(spec.key.clone())
                .and_modify(|slot| {
                    if !slot.is_live(now) {
                        *slot = Slot {
                            count: 0,
                            expires_at: now + spec.ttl,
                        };
                    }
                })
                .or_insert(Slot {
                    count: 0,
                    expires_at: now + spec.ttl,
                });
            slot.count += 1;
            updated.push(slot.reading(now));
        }

        Ok(BatchOutcome::Admitted { readings: updated })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
