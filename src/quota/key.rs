//! User identifiers and quota counter keys.

use std::fmt;

use crate::error::{QuotaError, Result};

use super::window::WindowName;

/// Prefix of every quota counter key in the store.
pub const QUOTA_KEY_PREFIX: &str = "quota";

const MAX_USER_ID_LEN: usize = 256;

/// A validated, non-empty user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    /// Validate a raw user id.
    ///
    /// Empty ids, ids containing whitespace or control characters, and ids
    /// longer than 256 bytes are rejected so that no request can fall onto a
    /// shared or ambiguous counter.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(QuotaError::InvalidUserId("user id is empty".to_string()));
        }
        if raw.len() > MAX_USER_ID_LEN {
            return Err(QuotaError::InvalidUserId(format!(
                "user id is longer than {} bytes",
                MAX_USER_ID_LEN
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(QuotaError::InvalidUserId(
                "user id contains whitespace or control characters".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one counter: a user in one window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub user_id: UserId,
    pub window: WindowName,
}

impl QuotaKey {
    pub fn new(user_id: &UserId, window: WindowName) -> Self {
        Self {
            user_id: user_id.clone(),
            window,
        }
    }

    /// Render the store key.
    /// Format: "quota:{user_id}:{window}"
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:{}", QUOTA_KEY_PREFIX, self.user_id, self.window)
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
