//! Loginguard - per-key rate limiting for login attempts
//!
//! A fixed-window rate limiter that counts requests per key (for example
//! `login:<email>`) in a pluggable [`ratelimit::CounterStore`]. An in-memory
//! store serves tests and single-process deployments; a Redis store keeps
//! counters durable and shared across application instances.
//!
//! ```no_run
//! use loginguard::ratelimit::{LoginThrottle, MemoryCounterStore, RateLimitPolicy};
//!
//! # async fn handle_login(email: &str) -> loginguard::error::Result<()> {
//! let throttle = LoginThrottle::new(MemoryCounterStore::new(), RateLimitPolicy::default());
//! if !throttle.check_login(email).await? {
//!     // refuse the attempt: "too many attempts, try again later"
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod telemetry;
