//! Rate limiting logic and counter storage.

mod key;
mod limiter;
mod memory;
mod redis_store;
mod store;
mod throttle;

pub use key::{RateLimitKey, LOGIN_ACTION};
pub use limiter::{
    RateLimitPolicy, RateLimitStatus, RateLimiter, DEFAULT_LIMIT, DEFAULT_WINDOW, MAX_WINDOW,
};
pub use memory::MemoryCounterStore;
pub use redis_store::{RedisConnectOptions, RedisCounterStore, DEFAULT_KEY_PREFIX};
pub use store::{BackendError, CounterRecord, CounterStore, HitOutcome, StoreResult};
pub use throttle::{check_rate_limit, LoginThrottle};
