//! Quota policy: the fixed set of windows and their limits.
//!
//! The policy is built once at startup from configuration and never changes
//! afterwards. Changing limits requires a restart with new configuration.

use std::time::Duration;

use tracing::info;

use super::window::{QuotaWindow, WindowName};
use crate::config::{QuotaConfig, WindowConfig};
use crate::error::{QuotaError, Result};

/// Immutable quota policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPolicy {
    enabled: bool,
    windows: [QuotaWindow; 3],
}

impl QuotaPolicy {
    /// Build a policy from `(limit, ttl_seconds)` pairs for minute, hour and day.
    pub fn from_limits(limits: [(u64, u64); 3]) -> Result<Self> {
        let mut windows = [
            QuotaWindow::default_for(WindowName::Minute),
            QuotaWindow::default_for(WindowName::Hour),
            QuotaWindow::default_for(WindowName::Day),
        ];
        for (name, (limit, ttl_secs)) in WindowName::ALL.into_iter().zip(limits) {
            windows[name.index()] = build_window(name, limit, ttl_secs)?;
        }
        Ok(Self {
            enabled: true,
            windows,
        })
    }

    /// Build a policy from configuration, filling unset values with defaults.
    pub fn from_config(config: &QuotaConfig) -> Result<Self> {
        let resolve = |name: WindowName, window: &WindowConfig| {
            (
                window.limit.unwrap_or_else(|| name.default_limit()),
                window
                    .ttl_secs
                    .unwrap_or_else(|| name.default_ttl().as_secs()),
            )
        };

        let policy = Self::from_limits([
            resolve(WindowName::Minute, &config.minute),
            resolve(WindowName::Hour, &config.hour),
            resolve(WindowName::Day, &config.day),
        ])?
        .with_enabled(config.enabled);

        info!(
            enabled = policy.enabled,
            per_minute = policy.window(WindowName::Minute).limit(),
            per_hour = policy.window(WindowName::Hour).limit(),
            per_day = policy.window(WindowName::Day).limit(),
            "Quota policy loaded"
        );

        Ok(policy)
    }

    /// Return the policy with quota enforcement switched on or off.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// All windows, in check order.
    pub fn windows(&self) -> &[QuotaWindow; 3] {
        &self.windows
    }

    pub fn window(&self, name: WindowName) -> &QuotaWindow {
        &self.windows[name.index()]
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            windows: WindowName::ALL.map(QuotaWindow::default_for),
        }
    }
}

fn build_window(name: WindowName, limit: u64, ttl_secs: u64) -> Result<QuotaWindow> {
    if limit == 0 {
        return Err(QuotaError::Config(format!(
            "{} window limit must be greater than zero",
            name
        )));
    }
    if ttl_secs == 0 {
        return Err(QuotaError::Config(format!(
            "{} window ttl_secs must be greater than zero",
            name
        )));
    }
    Ok(QuotaWindow::new(name, limit, Duration::from_secs(ttl_secs)))
}
