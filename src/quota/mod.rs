//! Per-user quota windows, counters and admission decisions.

mod backend;
mod decision;
mod key;
mod local;
mod policy;
mod tracker;
mod window;

pub use backend::{
    first_exhausted, first_overshoot, BackendKind, BatchOutcome, CounterBackend,
    CounterReading, WindowSpec,
};
pub use decision::{AdmissionDecision, QuotaStatus, UsageSnapshot, WindowUsage};
pub use key::{QuotaKey, UserId, QUOTA_KEY_PREFIX};
pub use local::LocalCounter;
pub use policy::QuotaPolicy;
pub use tracker::{QuotaTracker, TrackerOptions, TrackerStatsSnapshot};
pub use window::{QuotaWindow, WindowName};
