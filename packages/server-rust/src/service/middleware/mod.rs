//! Tower middleware layers for the dispatch stack.
//!
//! - [`metrics`]: dispatch spans, counters and latency histogram
//! - [`rate_limit`]: per-client rate limiting, rejected with 429
//! - [`timeout`]: cancels dispatches exceeding the configured timeout
//! - [`pipeline`]: composes all layers around the [`DispatchService`]
//!
//! [`DispatchService`]: crate::service::executor::DispatchService

pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod timeout;

pub use metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
pub use rate_limit::{RateLimitLayer, RateLimiter};
pub use timeout::TimeoutLayer;
