//! Request admission control.
//!
//! Decides, per request, whether a caller may proceed based on how many
//! requests the caller's key made in the current time window. Counters live in
//! a pluggable store: an in-process LRU map or Redis for shared budgets.
//! Rules are configured globally and overridden per route, and every decision
//! can be projected onto rate-limit response headers.

pub mod config;
pub mod error;
pub mod headers;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod request;
pub mod rule;
pub mod service;
pub mod settings;
pub mod store;
pub mod utils;

// Re-export main types
pub use config::{RateLimitOptions, RouteRateLimit};
pub use error::{RateLimitError, Result};
pub use limiter::{Decision, ManualCheck, Outcome, RateLimiter};
pub use request::{IncomingRequest, RequestInfo, RouteInfo};
pub use service::RateLimitService;
pub use store::{CounterStore, LocalStore};
