//! Timeout middleware for dispatches.
//!
//! A dispatch still running after the configured duration is canceled
//! through its token and reported as `DispatchError::Timeout`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Response;
use tower::{Layer, Service};

use crate::service::executor::{DispatchCall, DispatchError};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds the duration of every dispatch.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

/// Service wrapper that cancels dispatches exceeding the timeout.
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<DispatchCall> for TimeoutService<S>
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
        let timeout = self.timeout;
        let cancel = call.cancel.clone();
        let fut = self.inner.call(call);
        Box::pin(async move {
            tokio::pin!(fut);
            tokio::select! {
                result = &mut fut => result,
                () = tokio::time::sleep(timeout) => {
                    // The frame observes the cancellation and detaches the worker.
                    cancel.cancel();
                    let _ = fut.await;
                    #[allow(clippy::cast_possible_truncation)]
                    let timeout_ms = timeout.as_millis() as u64;
                    Err(DispatchError::Timeout { timeout_ms })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
