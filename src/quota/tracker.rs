//! Per-user quota tracking across the minute, hour and day windows.
//!
//! The shared counter store is authoritative. When it cannot be reached the
//! tracker keeps answering from an in-process counter, logging a single
//! warning when it enters that degraded state and a notice when it leaves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use super::backend::{BackendKind, BatchOutcome, CounterBackend, CounterReading, WindowSpec};
use super::decision::{AdmissionDecision, QuotaStatus, UsageSnapshot};
use super::key::{QuotaKey, UserId};
use super::local::LocalCounter;
use super::policy::QuotaPolicy;
use crate::config::{QuotaguardConfig, StoreConfig};
use crate::error::{QuotaError, Result, StoreError};
use crate::store::{normalize_store_url, RedisCounterStore};

/// Timing knobs for store access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerOptions {
    /// Upper bound on one store call, including any reconnect
    pub store_timeout: Duration,
    /// Minimum delay between store probes while degraded
    pub retry_interval: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

impl From<&StoreConfig> for TrackerOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            store_timeout: Duration::from_millis(config.timeout_ms),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StoreHealth {
    Healthy,
    Degraded { last_probe: Instant },
}

#[derive(Debug, Default)]
struct TrackerStats {
    store_decisions: AtomicU64,
    fallback_decisions: AtomicU64,
    degraded_transitions: AtomicU64,
}

/// Point-in-time copy of the tracker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerStatsSnapshot {
    pub store_decisions: u64,
    pub fallback_decisions: u64,
    pub degraded_transitions: u64,
    pub degraded: bool,
}

/// Admits or denies requests per user against the quota policy.
pub struct QuotaTracker {
    policy: QuotaPolicy,
    store: Option<Arc<dyn CounterBackend>>,
    fallback: Arc<LocalCounter>,
    options: TrackerOptions,
    health: Mutex<StoreHealth>,
    stats: TrackerStats,
}

impl QuotaTracker {
    /// Create a tracker. Without a store every decision comes from the
    /// in-process counter.
    pub fn new(
        policy: QuotaPolicy,
        store: Option<Arc<dyn CounterBackend>>,
        options: TrackerOptions,
    ) -> Self {
        Self::with_fallback(policy, store, Arc::new(LocalCounter::new()), options)
    }

    pub fn with_fallback(
        policy: QuotaPolicy,
        store: Option<Arc<dyn CounterBackend>>,
        fallback: Arc<LocalCounter>,
        options: TrackerOptions,
    ) -> Self {
        Self {
            policy,
            store,
            fallback,
            options,
            health: Mutex::new(StoreHealth::Healthy),
            stats: TrackerStats::default(),
        }
    }

    /// Build a tracker from configuration.
    ///
    /// The store URL is validated and upgraded to TLS where required, but no
    /// connection is made until the first request.
    pub fn from_config(config: &QuotaguardConfig) -> Result<Self> {
        let policy = QuotaPolicy::from_config(&config.quota)?;

        let url = config
            .store
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());

        let store: Option<Arc<dyn CounterBackend>> = match url {
            Some(raw) => {
                let url = normalize_store_url(
                    raw,
                    config.store.require_tls,
                    &config.store.tls_host_suffixes,
                )?;
                let store = RedisCounterStore::new(&url, &config.store)?;
                info!(
                    url = %store.connection().display_url(),
                    mode = ?store.mode(),
                    "Counter store configured"
                );
                let store: Arc<dyn CounterBackend> = Arc::new(store);
                Some(store)
            }
            None => {
                info!("No counter store configured; quotas are tracked in process only");
                None
            }
        };

        Ok(Self::new(policy, store, TrackerOptions::from(&config.store)))
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn fallback(&self) -> &Arc<LocalCounter> {
        &self.fallback
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Whether decisions are currently coming from the fallback counter
    /// because the store is unreachable.
    pub fn is_degraded(&self) -> bool {
        matches!(*self.health.lock(), StoreHealth::Degraded { .. })
    }

    pub fn stats(&self) -> TrackerStatsSnapshot {
        TrackerStatsSnapshot {
            store_decisions: self.stats.store_decisions.load(Ordering::Relaxed),
            fallback_decisions: self.stats.fallback_decisions.load(Ordering::Relaxed),
            degraded_transitions: self.stats.degraded_transitions.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
        }
    }

    /// Start the background task that reclaims expired fallback counters.
    pub fn spawn_fallback_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.fallback.spawn_sweeper(every)
    }

    /// Check the user's three windows and, if none is exhausted, charge all
    /// three by one.
    ///
    /// A denied request changes no counter.
    pub async fn check_and_record(&self, user_id: &str) -> Result<AdmissionDecision> {
        let user = UserId::parse(user_id)?;
        if !self.policy.is_enabled() {
            return Ok(AdmissionDecision::admitted(
                UsageSnapshot::empty(&self.policy),
                None,
            ));
        }

        let specs = self.specs(&user);

        if let Some(store) = self.store.as_ref().filter(|_| self.should_try_store()) {
            match self.bounded(store.check_and_increment(&specs)).await {
                Ok(outcome) => {
                    self.mark_healthy();
                    self.stats.store_decisions.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.decide(&user, outcome, BackendKind::Store));
                }
                Err(e) if e.is_connectivity() => self.mark_degraded(&e),
                Err(e) => {
                    // The store answered, so it is reachable, but we cannot tell
                    // whether this request was counted.
                    self.mark_healthy();
                    self.stats.store_decisions.fetch_add(1, Ordering::Relaxed);
                    error!(user_id = %user, error = %e, "Quota charge not confirmed; denying");
                    let window = match &e {
                        StoreError::PartialWrite { window, .. } => Some(*window),
                        _ => None,
                    };
                    return Ok(AdmissionDecision::unconfirmed(
                        window,
                        UsageSnapshot::empty(&self.policy),
                    ));
                }
            }
        }

        let outcome = self.fallback.check_and_increment(&specs).await?;
        self.stats.fallback_decisions.fetch_add(1, Ordering::Relaxed);
        Ok(self.decide(&user, outcome, BackendKind::Fallback))
    }

    /// Report the user's current usage of each window without charging.
    pub async fn get_usage(&self, user_id: &str) -> Result<UsageSnapshot> {
        let user = UserId::parse(user_id)?;
        if !self.policy.is_enabled() {
            return Ok(UsageSnapshot::empty(&self.policy));
        }

        let specs = self.specs(&user);

        if let Some(store) = self.store.as_ref().filter(|_| self.should_try_store()) {
            match self.bounded(store.read(&specs)).await {
                Ok(readings) => {
                    self.mark_healthy();
                    return Ok(UsageSnapshot::from_readings(&self.policy, &readings));
                }
                Err(e) if e.is_connectivity() => self.mark_degraded(&e),
                Err(e) => return Err(QuotaError::Store(e)),
            }
        }

        let readings = self.fallback.read(&specs).await?;
        Ok(UsageSnapshot::from_readings(&self.policy, &readings))
    }

    /// Usage of each window plus whether quotas are enforced.
    pub async fn status(&self, user_id: &str) -> Result<QuotaStatus> {
        Ok(QuotaStatus {
            enabled: self.policy.is_enabled(),
            usage: self.get_usage(user_id).await?,
        })
    }

    /// Ping the store, if one is configured.
    pub async fn ping_store(&self) -> Option<std::result::Result<(), StoreError>> {
        let store = self.store.as_ref()?;
        Some(self.bounded(store.ping()).await)
    }

    fn specs(&self, user: &UserId) -> Vec<WindowSpec> {
        self.policy
            .windows()
            .iter()
            .map(|window| WindowSpec::new(QuotaKey::new(user, window.name()), window))
            .collect()
    }

    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        match timeout(self.options.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.options.store_timeout)),
        }
    }

    /// While degraded, let one request through to probe the store once per
    /// retry interval.
    fn should_try_store(&self) -> bool {
        let mut health = self.health.lock();
        match *health {
            StoreHealth::Healthy => true,
            StoreHealth::Degraded { last_probe } => {
                let now = Instant::now();
                if now.duration_since(last_probe) >= self.options.retry_interval {
                    *health = StoreHealth::Degraded { last_probe: now };
                    true
                } else {
                    false
                }
            }
        }
    }

    fn mark_degraded(&self, err: &StoreError) {
        let was_healthy = {
            let mut health = self.health.lock();
            let was_healthy = matches!(*health, StoreHealth::Healthy);
            *health = StoreHealth::Degraded {
                last_probe: Instant::now(),
            };
            was_healthy
        };

        if was_healthy {
            self.stats
                .degraded_transitions
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                error = %err,
                "Counter store unreachable; using in-process fallback counters"
            );
        } else {
            debug!(error = %err, "Counter store still unreachable");
        }
    }

    fn mark_healthy(&self) {
        let was_degraded = {
            let mut health = self.health.lock();
            let was_degraded = matches!(*health, StoreHealth::Degraded { .. });
            *health = StoreHealth::Healthy;
            was_degraded
        };

        if was_degraded {
            info!("Counter store reachable again; leaving fallback counters");
        }
    }

    fn decide(
        &self,
        user: &UserId,
        outcome: BatchOutcome,
        source: BackendKind,
    ) -> AdmissionDecision {
        match outcome {
            BatchOutcome::Admitted { readings } => {
                let usage = self.snapshot(&readings);
                trace!(user_id = %user, source = %source, "Request admitted");
                AdmissionDecision::admitted(usage, Some(source))
            }
            BatchOutcome::Rejected { index, readings } => {
                let window = self.policy.windows()[index].name();
                let usage = self.snapshot(&readings);
                debug!(
                    user_id = %user,
                    window = %window,
                    current = usage.window(window).used,
                    limit = usage.window(window).limit,
                    source = %source,
                    "Quota exceeded"
                );
                AdmissionDecision::denied(window, usage, source)
            }
        }
    }

    fn snapshot(&self, readings: &[CounterReading]) -> UsageSnapshot {
        UsageSnapshot::from_readings(&self.policy, readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use crate::quota::WindowName;

    /// A store that can be switched off, backed by a local counter.
    struct FlakyStore {
        inner: LocalCounter,
        reachable: AtomicBool,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: LocalCounter::new(),
                reachable: AtomicBool::new(reachable),
                calls: AtomicUsize::new(0),
            })
        }

        fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn gate(&self) -> std::result::Result<(), StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unreachable("connection refused".to_string()))
            }
        }
    }

    #[async_trait]
    impl CounterBackend for FlakyStore {
        fn kind(&self) -> BackendKind {
            BackendKind::Store
        }

        async fn read(
            &self,
            specs: &[WindowSpec],
        ) -> std::result::Result<Vec<CounterReading>, StoreError> {
            self.gate()?;
            self.inner.read(specs).await
        }

        async fn check_and_increment(
            &self,
            specs: &[WindowSpec],
        ) -> std::result::Result<BatchOutcome, StoreError> {
            self.gate()?;
            self.inner.check_and_increment(specs).await
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            self.gate()
        }
    }

    /// A store whose charges are never fully confirmed.
    struct HalfWrittenStore;

    #[async_trait]
    impl CounterBackend for HalfWrittenStore {
        fn kind(&self) -> BackendKind {
            BackendKind::Store
        }

        async fn read(
            &self,
            specs: &[WindowSpec],
        ) -> std::result::Result<Vec<CounterReading>, StoreError> {
            Ok(vec![CounterReading::default(); specs.len()])
        }

        async fn check_and_increment(
            &self,
            _specs: &[WindowSpec],
        ) -> std::result::Result<BatchOutcome, StoreError> {
            Err(StoreError::PartialWrite {
                window: WindowName::Hour,
                detail: "EXEC aborted".to_string(),
            })
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    /// A store that never answers.
    struct HangingStore;

    #[async_trait]
    impl CounterBackend for HangingStore {
        fn kind(&self) -> BackendKind {
            BackendKind::Store
        }

        async fn read(
            &self,
            _specs: &[WindowSpec],
        ) -> std::result::Result<Vec<CounterReading>, StoreError> {
            std::future::pending().await
        }

        async fn check_and_increment(
            &self,
            _specs: &[WindowSpec],
        ) -> std::result::Result<BatchOutcome, StoreError> {
            std::future::pending().await
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            std::future::pending().await
        }
    }

    /// Counts WARN events emitted by this crate.
    #[derive(Clone, Default)]
    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let meta = event.metadata();
            if *meta.level() == Level::WARN && meta.target().starts_with("quotaguard") {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn eager_retry() -> TrackerOptions {
        TrackerOptions {
            store_timeout: Duration::from_millis(250),
            retry_interval: Duration::ZERO,
        }
    }

    fn tracker_with(store: &Arc<FlakyStore>, options: TrackerOptions) -> QuotaTracker {
        let store: Arc<dyn CounterBackend> = store.clone();
        QuotaTracker::new(QuotaPolicy::default(), Some(store), options)
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_limit_then_reset() {
        let store = FlakyStore::new(true);
        let tracker = tracker_with(&store, TrackerOptions::default());

        for _ in 0..4 {
            let decision = tracker.check_and_record("u1").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.source, Some(BackendKind::Store));
        }

        let denied = tracker.check_and_record("u1").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.blocking_window, Some(WindowName::Minute));
        assert_eq!(denied.current, 4);
        assert_eq!(denied.limit, 4);
        assert_eq!(denied.retry_after_secs, Some(60));

        tokio::time::advance(Duration::from_secs(61)).await;

        let decision = tracker.check_and_record("u1").await.unwrap();
        assert!(decision.allowed);
        let usage = tracker.get_usage("u1").await.unwrap();
        assert_eq!(usage.minute.used, 1);
        assert_eq!(usage.hour.used, 5);
        assert_eq!(usage.day.used, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_only_tracker_enforces_limits() {
        let tracker = QuotaTracker::new(QuotaPolicy::default(), None, TrackerOptions::default());

        for _ in 0..4 {
            let decision = tracker.check_and_record("solo").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.source, Some(BackendKind::Fallback));
        }
        assert!(!tracker.check_and_record("solo").await.unwrap().allowed);
        assert!(!tracker.is_degraded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hour_limit_blocks_before_day() {
        let policy = QuotaPolicy::from_limits([(10, 60), (2, 3600), (5, 86400)]).unwrap();
        let tracker = QuotaTracker::new(policy, None, TrackerOptions::default());

        tracker.check_and_record("u1").await.unwrap();
        tracker.check_and_record("u1").await.unwrap();
        let denied = tracker.check_and_record("u1").await.unwrap();

        assert_eq!(denied.blocking_window, Some(WindowName::Hour));
        assert_eq!(denied.current, 2);
        assert_eq!(denied.limit, 2);
        assert_eq!(
            denied.message().unwrap(),
            "Rate limit exceeded for the hour window, resets in 3600 seconds"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_increments_every_window_once() {
        let store = FlakyStore::new(true);
        let tracker = tracker_with(&store, TrackerOptions::default());

        let before = tracker.get_usage("u2").await.unwrap();
        let decision = tracker.check_and_record("u2").await.unwrap();
        let after = tracker.get_usage("u2").await.unwrap();

        assert!(decision.allowed);
        for name in WindowName::ALL {
            assert_eq!(after.window(name).used, before.window(name).used + 1);
        }
        assert_eq!(decision.usage, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admitted_decision_reports_tightest_window() {
        let policy = QuotaPolicy::from_limits([(10, 60), (3, 3600), (50, 86400)]).unwrap();
        let tracker = QuotaTracker::new(policy, None, TrackerOptions::default());

        let decision = tracker.check_and_record("u1").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current, 1);
        assert_eq!(decision.limit, 3);
        assert!(decision.message().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_does_not_change_usage() {
        let store = FlakyStore::new(true);
        let tracker = tracker_with(&store, TrackerOptions::default());

        for _ in 0..4 {
            tracker.check_and_record("u3").await.unwrap();
        }
        let before = tracker.get_usage("u3").await.unwrap();
        for _ in 0..3 {
            assert!(!tracker.check_and_record("u3").await.unwrap().allowed);
        }
        let after = tracker.get_usage("u3").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_usage_is_read_only() {
        let store = FlakyStore::new(true);
        let tracker = tracker_with(&store, TrackerOptions::default());
        tracker.check_and_record("u4").await.unwrap();

        let first = tracker.get_usage("u4").await.unwrap();
        let second = tracker.get_usage("u4").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.minute.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_window_reads_as_zero() {
        let store = FlakyStore::new(true);
        let tracker = tracker_with(&store, TrackerOptions::default());
        tracker.check_and_record("u5").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        let usage = tracker.get_usage("u5").await.unwrap();
        assert_eq!(usage.minute.used, 0);
        assert_eq!(usage.minute.resets_in_secs, None);
        assert_eq!(usage.hour.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_user_is_rejected_without_store_access() {
        let store = FlakyStore::new(true);
        let tracker = tracker_with(&store, TrackerOptions::default());

        for bad in ["", "   ", "has space"] {
            assert!(matches!(
                tracker.check_and_record(bad).await,
                Err(QuotaError::InvalidUserId(_))
            ));
            assert!(matches!(
                tracker.get_usage(bad).await,
                Err(QuotaError::InvalidUserId(_))
            ));
        }
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_policy_admits_without_counting() {
        let store = FlakyStore::new(true);
        let store_dyn: Arc<dyn CounterBackend> = store.clone();
        let policy = QuotaPolicy::default().with_enabled(false);
        let tracker = QuotaTracker::new(policy, Some(store_dyn), TrackerOptions::default());

        for _ in 0..10 {
            let decision = tracker.check_and_record("u6").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.source, None);
        }
        assert_eq!(tracker.get_usage("u6").await.unwrap().minute.used, 0);
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_enabled_flag() {
        let tracker = QuotaTracker::new(QuotaPolicy::default(), None, TrackerOptions::default());
        tracker.check_and_record("u11").await.unwrap();

        let status = tracker.status("u11").await.unwrap();
        assert!(status.enabled);
        assert_eq!(status.usage.minute.used, 1);

        let disabled = QuotaTracker::new(
            QuotaPolicy::default().with_enabled(false),
            None,
            TrackerOptions::default(),
        );
        let status = disabled.status("u11").await.unwrap();
        assert!(!status.enabled);
        assert_eq!(status.usage.minute.used, 0);
        assert_eq!(status.usage.minute.limit, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_warns_once() {
        let warnings = WarnCounter::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = FlakyStore::new(false);
        let tracker = tracker_with(&store, eager_retry());

        let mut admitted = 0;
        for _ in 0..100 {
            let decision = tracker.check_and_record("u2").await.unwrap();
            assert_eq!(decision.source, Some(BackendKind::Fallback));
            if decision.allowed {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 4);
        assert_eq!(warnings.0.load(Ordering::SeqCst), 1);
        assert!(tracker.is_degraded());

        let stats = tracker.stats();
        assert_eq!(stats.degraded_transitions, 1);
        assert_eq!(stats.fallback_decisions, 100);
        assert_eq!(stats.store_decisions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_returns_to_store() {
        let warnings = WarnCounter::default();
        let subscriber = tracing_subscriber::registry().with(warnings.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = FlakyStore::new(false);
        let tracker = tracker_with(&store, eager_retry());

        tracker.check_and_record("u7").await.unwrap();
        assert!(tracker.is_degraded());

        store.set_reachable(true);
        let decision = tracker.check_and_record("u7").await.unwrap();
        assert_eq!(decision.source, Some(BackendKind::Store));
        assert!(!tracker.is_degraded());

        store.set_reachable(false);
        tracker.check_and_record("u7").await.unwrap();

        assert_eq!(tracker.stats().degraded_transitions, 2);
        assert_eq!(warnings.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_store_probed_once_per_interval() {
        let store = FlakyStore::new(false);
        let tracker = tracker_with(
            &store,
            TrackerOptions {
                store_timeout: Duration::from_millis(250),
                retry_interval: Duration::from_secs(1),
            },
        );

        for _ in 0..10 {
            tracker.check_and_record("u8").await.unwrap();
        }
        assert_eq!(store.calls(), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        tracker.check_and_record("u8").await.unwrap();
        tracker.check_and_record("u8").await.unwrap();
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_falls_back_when_store_unreachable() {
        let store = FlakyStore::new(false);
        let tracker = tracker_with(&store, eager_retry());

        tracker.check_and_record("u9").await.unwrap();
        tracker.check_and_record("u9").await.unwrap();

        let usage = tracker.get_usage("u9").await.unwrap();
        assert_eq!(usage.minute.used, 2);
        assert_eq!(usage.minute.resets_in_secs, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_uses_fallback() {
        let store: Arc<dyn CounterBackend> = Arc::new(HangingStore);
        let tracker = QuotaTracker::new(QuotaPolicy::default(), Some(store), eager_retry());

        let decision = tracker.check_and_record("slow").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.source, Some(BackendKind::Fallback));
        assert!(tracker.is_degraded());

        let usage = tracker.get_usage("slow").await.unwrap();
        assert_eq!(usage.minute.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_charge_is_denied() {
        let store: Arc<dyn CounterBackend> = Arc::new(HalfWrittenStore);
        let tracker = QuotaTracker::new(QuotaPolicy::default(), Some(store), eager_retry());

        let decision = tracker.check_and_record("u10").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.blocking_window, Some(WindowName::Hour));
        assert_eq!(decision.source, Some(BackendKind::Store));
        assert!(!tracker.is_degraded());
        assert_eq!(tracker.fallback().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_store() {
        let tracker = QuotaTracker::new(QuotaPolicy::default(), None, TrackerOptions::default());
        assert!(tracker.ping_store().await.is_none());

        let store = FlakyStore::new(false);
        let tracker = tracker_with(&store, TrackerOptions::default());
        assert!(matches!(
            tracker.ping_store().await,
            Some(Err(StoreError::Unreachable(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_instances_sharing_a_store_respect_limit() {
        let store = FlakyStore::new(true);
        let first = Arc::new(tracker_with(&store, TrackerOptions::default()));
        let second = Arc::new(tracker_with(&store, TrackerOptions::default()));

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let tracker = if i % 2 == 0 { first.clone() } else { second.clone() };
                tokio::spawn(async move { tracker.check_and_record("shared").await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().allowed)
            .count();
        assert_eq!(admitted, 4);
    }

    #[test]
    fn test_from_config_without_store() {
        let config = QuotaguardConfig::default();
        let tracker = QuotaTracker::from_config(&config).unwrap();
        assert!(!tracker.has_store());
        assert_eq!(tracker.policy(), &QuotaPolicy::default());
    }

    #[test]
    fn test_from_config_rejects_bad_store_url() {
        let mut config = QuotaguardConfig::default();
        config.store.url = Some("http://cache.internal".to_string());
        assert!(matches!(
            QuotaTracker::from_config(&config),
            Err(QuotaError::Config(_))
        ));
    }

    #[test]
    fn test_from_config_with_store() {
        let mut config = QuotaguardConfig::default();
        config.store.url = Some("redis://127.0.0.1:6379".to_string());
        let tracker = QuotaTracker::from_config(&config).unwrap();
        assert!(tracker.has_store());
        assert!(!tracker.is_degraded());
    }
}
