//! Tiered fixed-window rate limiting.

mod backend;
mod cache;
mod clock;
mod counter;
mod limiter;
mod memory;
mod relational;

pub use backend::{CounterBackend, Tier};
pub use cache::{CacheBackend, WindowScript};
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{Decision, WindowCounter, WindowLimit, DEFAULT_MAX, DEFAULT_WINDOW_MS};
pub use limiter::{FailurePolicy, TieredLimiter, TieredLimiterBuilder, DEFAULT_CALL_TIMEOUT};
pub use memory::{MemoryBackend, DEFAULT_SWEEP_INTERVAL};
pub use relational::RelationalBackend;
