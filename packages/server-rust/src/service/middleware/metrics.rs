//! Metrics middleware for dispatches.
//!
//! Wraps every dispatch in a `dispatch` span and records
//! `tidewire_dispatch_total{operation,outcome}` and
//! `tidewire_dispatch_duration_seconds{operation}`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use http::Response;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::executor::{DispatchCall, DispatchError};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments dispatches with spans, counters and timings.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records dispatch duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Outcome label of a finished dispatch.
fn outcome(result: &Result<Response<Bytes>, DispatchError>) -> &'static str {
    match result {
        Ok(response) if response.status().is_server_error() => "server_error",
        Ok(response) if response.status().is_client_error() => "client_error",
        Ok(_) => "ok",
        Err(DispatchError::Canceled) => "canceled",
        Err(DispatchError::Timeout { .. }) => "timeout",
    }
}

impl<S> Service<DispatchCall> for MetricsService<S>
where
    S: Service<DispatchCall, Response = Response<Bytes>, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Response<Bytes>;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Bytes>, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: DispatchCall) -> Self::Future {
        let operation = call.request.operation.as_str();
        let span = info_span!(
            "dispatch",
            operation = operation,
            identity = %call.request.identity,
            request_id = %call.request.request_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!(
                    "tidewire_dispatch_total",
                    "operation" => operation,
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "tidewire_dispatch_duration_seconds",
                    "operation" => operation
                )
                .record(elapsed.as_secs_f64());

                tracing::info!(
                    operation = operation,
                    duration_ms = duration_ms,
                    outcome = outcome,
                    "dispatch complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tidewire_core::{Identity, Operation};
    use tower::ServiceExt;

    use super::*;
    use crate::service::context::Request;

    /// Immediately-completing service answering with a fixed status.
    struct FixedStatus(u16);

    impl Service<DispatchCall> for FixedStatus {
        type Response = Response<Bytes>;
        type Error = DispatchError;
        type Future =
            Pin<Box<dyn Future<Output = Result<Response<Bytes>, DispatchError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _call: DispatchCall) -> Self::Future {
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = http::StatusCode::from_u16(self.0).unwrap();
            Box::pin(async move { Ok(response) })
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let svc = MetricsLayer.layer(FixedStatus(201));
        let call = DispatchCall::new(Request::new(
            Operation::Create,
            Identity::new("list", "lists"),
        ));
        let response = svc.oneshot(call).await.unwrap();
        assert_eq!(response.status(), 201);
    }

    #[test]
    fn outcomes_follow_status_classes() {
        let with_status = |code: u16| {
            let mut response = Response::new(Bytes::new());
            *response.status_mut() = http::StatusCode::from_u16(code).unwrap();
            Ok(response)
        };
        assert_eq!(outcome(&with_status(200)), "ok");
        assert_eq!(outcome(&with_status(423)), "client_error");
        assert_eq!(outcome(&with_status(501)), "server_error");
        assert_eq!(outcome(&Err(DispatchError::Canceled)), "canceled");
        assert_eq!(
            outcome(&Err(DispatchError::Timeout { timeout_ms: 1 })),
            "timeout"
        );
    }
}
