//! Admission decisions and usage snapshots.

use serde::Serialize;

use super::backend::{BackendKind, CounterReading};
use super::policy::QuotaPolicy;
use super::window::WindowName;

/// Usage of a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub used: u64,
    pub limit: u64,
    /// Seconds until the window's counter expires, when known
    #[serde(rename = "resets_in", skip_serializing_if = "Option::is_none")]
    pub resets_in_secs: Option<u64>,
}

impl WindowUsage {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Usage of all three windows for one user.
///
/// Serialises as `{"minute": {...}, "hour": {...}, "day": {...}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub minute: WindowUsage,
    pub hour: WindowUsage,
    pub day: WindowUsage,
}

impl UsageSnapshot {
    /// Zero usage against the policy's limits.
    pub fn empty(policy: &QuotaPolicy) -> Self {
        Self::from_readings(policy, &[CounterReading::default(); 3])
    }

    /// Build a snapshot from readings given in check order.
    pub fn from_readings(policy: &QuotaPolicy, readings: &[CounterReading]) -> Self {
        let usage = |name: WindowName| {
            let reading = readings.get(name.index()).copied().unwrap_or_default();
            WindowUsage {
                used: reading.count,
                limit: policy.window(name).limit(),
                resets_in_secs: reading.ttl.map(|ttl| ttl.as_secs().max(1)),
            }
        };
        Self {
            minute: usage(WindowName::Minute),
            hour: usage(WindowName::Hour),
            day: usage(WindowName::Day),
        }
    }

    pub fn window(&self, name: WindowName) -> &WindowUsage {
        match name {
            WindowName::Minute => &self.minute,
            WindowName::Hour => &self.hour,
            WindowName::Day => &self.day,
        }
    }

    /// Window with the least remaining headroom; the earliest wins ties.
    pub fn tightest(&self) -> WindowName {
        WindowName::ALL
            .into_iter()
            .min_by_key(|name| self.window(*name).remaining())
            .unwrap_or(WindowName::Minute)
    }
}

/// A user's usage together with whether quotas are enforced at all.
///
/// Serialises as `{"enabled": true, "minute": {...}, "hour": {...}, "day": {...}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub enabled: bool,
    #[serde(flatten)]
    pub usage: UsageSnapshot,
}

/// The verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// First exhausted window; `None` when admitted, or when the charge could
    /// not be confirmed by the store
    pub blocking_window: Option<WindowName>,
    /// Count of the blocking window, or of the tightest window when admitted
    pub current: u64,
    pub limit: u64,
    /// Seconds until the blocking window resets, when known
    pub retry_after_secs: Option<u64>,
    pub usage: UsageSnapshot,
    /// Backend that produced the decision; `None` when quotas are disabled
    pub source: Option<BackendKind>,
}

impl AdmissionDecision {
    pub(crate) fn admitted(usage: UsageSnapshot, source: Option<BackendKind>) -> Self {
        let tightest = usage.window(usage.tightest());
        Self {
            allowed: true,
            blocking_window: None,
            current: tightest.used,
            limit: tightest.limit,
            retry_after_secs: None,
            usage,
            source,
        }
    }

    pub(crate) fn denied(window: WindowName, usage: UsageSnapshot, source: BackendKind) -> Self {
        let blocking = usage.window(window);
        Self {
            allowed: false,
            blocking_window: Some(window),
            current: blocking.used,
            limit: blocking.limit,
            retry_after_secs: blocking.resets_in_secs,
            usage,
            source: Some(source),
        }
    }

    /// A denial for a charge the store could not confirm.
    pub(crate) fn unconfirmed(window: Option<WindowName>, usage: UsageSnapshot) -> Self {
        let limit = window.map(|w| usage.window(w).limit).unwrap_or(0);
        Self {
            allowed: false,
            blocking_window: window,
            current: 0,
            limit,
            retry_after_secs: None,
            usage,
            source: Some(BackendKind::Store),
        }
    }

    /// User-facing explanation of a denial; `None` when admitted.
    pub fn message(&self) -> Option<String> {
        if self.allowed {
            return None;
        }
        let message = match (self.blocking_window, self.retry_after_secs) {
            (Some(window), Some(secs)) => format!(
                "Rate limit exceeded for the {} window, resets in {} seconds",
                window, secs
            ),
            (Some(window), None) => format!(
                "Rate limit exceeded for the {} window, please wait before retrying",
                window
            ),
            (None, _) => "Request could not be metered, please try again shortly".to_string(),
        };
        Some(message)
    }
}
