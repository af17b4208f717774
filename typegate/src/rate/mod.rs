//! Limit the weight of the queries a caller may run in a time window.

mod error;
mod limiter;

pub use self::error::RateLimited;
pub use self::limiter::RateLimiterState;
