//! Pipeline composition: wraps the dispatch service with every middleware layer.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::metrics::{MetricsLayer, MetricsService};
use super::rate_limit::{RateLimitLayer, RateLimitService, RateLimiter};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::service::dispatch::Dispatcher;
use crate::service::executor::DispatchService;

/// The fully layered dispatch stack. Cheap to clone.
pub type DispatchPipeline = MetricsService<RateLimitService<TimeoutService<DispatchService>>>;

/// Builds the dispatch pipeline around `dispatcher`.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- records every outcome, rate-limited and timed-out included
/// 2. `RateLimitLayer` -- rejects before any dispatch work
/// 3. `TimeoutLayer` -- cancels dispatches running past `operation_timeout`
#[must_use]
pub fn build_dispatch_pipeline(
    dispatcher: Arc<Dispatcher>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
) -> DispatchPipeline {
    let config = dispatcher.config();
    let rate_limit = RateLimitLayer::new(
        rate_limiter,
        &config.client_id_header,
        &config.service_name,
    );
    let timeout = TimeoutLayer::new(config.operation_timeout);

    ServiceBuilder::new()
        .layer(MetricsLayer)
        .layer(rate_limit)
        .layer(timeout)
        .service(DispatchService::new(dispatcher))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tidewire_core::{Encoding, Operation};
    use tower::ServiceExt;

    use super::*;
    use crate::service::config::ServerConfig;
    use crate::service::context::Request;
    use crate::service::dispatch::tests::{list_identity, models, Spy};
    use crate::service::executor::DispatchCall;
    use crate::service::processor::ProcessorRegistry;

    struct AlwaysLimited;

    #[async_trait]
    impl RateLimiter for AlwaysLimited {
        async fn rate_limit(&self, _client: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let processors = Arc::new(ProcessorRegistry::new());
        processors
            .register(&list_identity(), Arc::new(Spy::default()))
            .unwrap();
        Arc::new(Dispatcher::new(
            ServerConfig::default(),
            Arc::new(models()),
            processors,
        ))
    }

    fn create() -> DispatchCall {
        DispatchCall::new(
            Request::new(Operation::Create, list_identity())
                .with_data(Encoding::Json, br#"{"id":"1","name":"a"}"#.to_vec()),
        )
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let svc = build_dispatch_pipeline(dispatcher(), None);
        let response = svc.oneshot(create()).await.unwrap();
        assert_eq!(response.status(), 201);
    }

    #[tokio::test]
    async fn pipeline_applies_the_rate_limiter() {
        let svc = build_dispatch_pipeline(dispatcher(), Some(Arc::new(AlwaysLimited)));
        let response = svc.oneshot(create()).await.unwrap();
        assert_eq!(response.status(), 429);
    }
}
