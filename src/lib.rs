//! Windowguard - tiered fixed-window rate limiting
//!
//! This crate enforces "at most N operations per key per window" across many
//! stateless service replicas. Counters live in Redis when it is configured,
//! fall back to a shared SQL table, and finally to a process-local map.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use bootstrap::build_limiter;
pub use ratelimit::{Decision, TieredLimiter};
