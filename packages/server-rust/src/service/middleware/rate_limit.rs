//! Rate-limiting middleware for dispatches.
//!
//! Consults a [`RateLimiter`] with the caller's client identifier before any
//! dispatch work happens. Limited callers get a 429 error response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use tidewire_core::ApiError;
use tower::{Layer, Service};

use crate::service::context::Request;
use crate::service::executor::{DispatchCall, DispatchError};
use crate::service::response;

/// Decides whether a client has exceeded its request budget.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Returns `true` when the request from `client` must be rejected.
    async fn rate_limit(&self, client: &str) -> anyhow::Result<bool>;
}

/// Identifier a limiter keys on: the peer address, else the configured
/// header, else `"unknown"`.
#[must_use]
pub fn client_identifier(request: &Request, header: &str) -> String {
    request
        .client_ip
        .clone()
        .or_else(|| request.header(header).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer applying an optional [`RateLimiter`]. Without a limiter every
/// call passes through.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Option<Arc<dyn RateLimiter>>,
    client_id_header: Arc<str>,
    subject: Arc<str>,
}

impl RateLimitLayer {
    #[must_use]
    pub fn new(
        limiter: Option<Arc<dyn RateLimiter>>,
        client_id_header: &str,
        subject: &str,
    ) -> Self {
        Self {
            limiter,
            client_id_header: Arc::from(client_id_header),
            subject: Arc::from(subject),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            client_id_header: Arc::clone(&self.client_id_header),
            subject: Arc::clone(&self.subject),
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitService
// ---------------------------------------------------------------------------

/// Service wrapper rejecting rate-limited callers.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Option<Arc<dyn RateLimiter>>,
    client_id_header: Arc<str>,
    subject: Arc<str>,
}

impl<S> Service<DispatchCall> for RateLimitService<S>
where
    S: Service<DispatchCall, Response = Response<Bytes>, Error = DispatchError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Bytes>;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Bytes>, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: DispatchCall) -> Self::Future {
        let Some(limiter) = self.limiter.clone() else {
            return Box::pin(self.inner.call(call));
        };

        // The polled-ready instance serves this call; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let header = Arc::clone(&self.client_id_header);
        let subject = Arc::clone(&self.subject);

        Box::pin(async move {
            let client = client_identifier(&call.request, &header);
            match limiter.rate_limit(&client).await {
                Ok(false) => inner.call(call).await,
                Ok(true) => {
                    tracing::debug!(client = %client, "rate limited");
                    Ok(response::failure(
                        &ApiError::too_many_requests("rate limit exceeded", &*subject),
                        &call.request,
                    ))
                }
                Err(err) => {
                    tracing::error!(client = %client, error = %err, "rate limiter failed");
                    Ok(response::failure(
                        &ApiError::internal(err.to_string(), &*subject),
                        &call.request,
                    ))
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
