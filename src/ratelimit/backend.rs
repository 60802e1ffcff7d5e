//! Backend trait shared by every counter store.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::counter::{WindowCounter, WindowLimit};
use crate::error::Result;

/// One interchangeable implementation of the window counter, ordered by
/// preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Shared low-latency key/value store
    Cache,
    /// Shared relational database
    Relational,
    /// Process-local map; no cross-process guarantee
    InProcess,
}

impl Tier {
    /// All tiers in call order.
    pub const ORDER: [Tier; 3] = [Tier::Cache, Tier::Relational, Tier::InProcess];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cache => "cache",
            Tier::Relational => "relational",
            Tier::InProcess => "in_process",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for window counter stores.
///
/// `hit` must be a single atomic operation per key: create-or-restart the
/// window when it has ended, otherwise increment, and return the post-hit
/// state. Implementations report infrastructure problems as
/// [`WindowguardError::BackendUnavailable`](crate::error::WindowguardError::BackendUnavailable)
/// and never decide admission themselves.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// The tier this backend serves.
    fn tier(&self) -> Tier;

    /// Atomically apply one hit to `key` under `limit`.
    ///
    /// `now_ms` is the caller's view of the current time; backends that
    /// keep time server-side may ignore it for window arithmetic.
    async fn hit(&self, key: &str, limit: &WindowLimit, now_ms: i64) -> Result<WindowCounter>;
}
