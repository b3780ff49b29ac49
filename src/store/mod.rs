//! Shared counter store access over the Redis protocol.

mod connection;
mod counter_store;
mod url;

pub use connection::StoreConnection;
pub use counter_store::RedisCounterStore;
pub use url::{normalize_store_url, redact};
