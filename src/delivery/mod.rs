//! Delivery pipeline: worker pool, retry policy, rate limiting, audit events
//! and metrics.

pub mod engine;
pub mod events;
pub mod metrics;
pub mod rate_limiter;
pub mod retry;

pub use engine::{DeliveryDeps, DeliveryEngine};
pub use events::{EventRecorder, EventRecorderConfig};
pub use metrics::{Metrics, OtelMetrics};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;
