//! Quotaguard - Per-User Request Quotas
//!
//! This crate meters requests per user across fixed minute, hour and day
//! windows. Counters live in a shared Redis-compatible store so every
//! instance enforces the same limits; when the store is unreachable each
//! instance falls back to in-process counters until it recovers.

pub mod config;
pub mod error;
pub mod quota;
pub mod session;
pub mod store;
