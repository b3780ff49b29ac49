//! Quota windows.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of one of the fixed quota windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowName {
    /// Per-minute quota
    Minute,
    /// Per-hour quota
    Hour,
    /// Per-day quota
    Day,
}

impl WindowName {
    /// All windows, in the order they are checked.
    pub const ALL: [WindowName; 3] = [WindowName::Minute, WindowName::Hour, WindowName::Day];

    /// Get the default lifetime of a counter in this window.
    pub fn default_ttl(&self) -> Duration {
        match self {
            WindowName::Minute => Duration::from_secs(60),
            WindowName::Hour => Duration::from_secs(3600),
            WindowName::Day => Duration::from_secs(86400),
        }
    }

    /// Get the default request limit for this window.
    pub fn default_limit(&self) -> u64 {
        match self {
            WindowName::Minute => 4,
            WindowName::Hour => 100,
            WindowName::Day => 500,
        }
    }

    /// Position of this window in the check order.
    pub fn index(&self) -> usize {
        match self {
            WindowName::Minute => 0,
            WindowName::Hour => 1,
            WindowName::Day => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowName::Minute => "minute",
            WindowName::Hour => "hour",
            WindowName::Day => "day",
        }
    }
}

impl fmt::Display for WindowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A window with its limit and counter lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    name: WindowName,
    limit: u64,
    ttl: Duration,
}

impl QuotaWindow {
    /// Create a window. Callers validate `limit > 0` and `ttl >= 1s`.
    pub(crate) fn new(name: WindowName, limit: u64, ttl: Duration) -> Self {
        Self { name, limit, ttl }
    }

    /// The default window for a name.
    pub fn default_for(name: WindowName) -> Self {
        Self::new(name, name.default_limit(), name.default_ttl())
    }

    pub fn name(&self) -> WindowName {
        self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Counter lifetime in whole seconds, as the store expects it.
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }
}
