//! Execution frame of a dispatch.
//!
//! The pipeline runs on its own task. The caller races that task against
//! the call's cancellation token: on cancellation it returns at once and the
//! task is left to finish on its own. Panics raised by the pipeline become
//! 500 responses carrying the stack of the panic site, unless panic recovery
//! is disabled.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context as TaskContext, Poll};

use bytes::Bytes;
use http::Response;
use parking_lot::Mutex;
use tidewire_core::ApiError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::Service;

use super::context::Request;
use super::dispatch::Dispatcher;
use super::response;

/// Input of the dispatch service: a request and the token canceling it.
#[derive(Debug, Clone)]
pub struct DispatchCall {
    pub request: Request,
    pub cancel: CancellationToken,
}

impl DispatchCall {
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            request,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Outcomes of a dispatch that produce no response at all.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch canceled")]
    Canceled,
    #[error("dispatch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl DispatchError {
    /// Protocol error reported to a client that is still listening.
    #[must_use]
    pub fn to_api_error(&self, subject: &str) -> ApiError {
        match self {
            Self::Canceled => ApiError::new("Client Closed Request", self.to_string(), subject, 499),
            Self::Timeout { .. } => {
                ApiError::new("Request Timeout", self.to_string(), subject, 408)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Panic stacks
// ---------------------------------------------------------------------------

type StackSlot = Arc<Mutex<Option<String>>>;

tokio::task_local! {
    /// Receives the stack of a panic raised while the dispatch task is polled.
    static PANIC_STACK: StackSlot;
}

static PANIC_HOOK: Once = Once::new();

/// Chains a panic hook that records the panicking stack into the current
/// dispatch's slot. Panics outside a dispatch only reach the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = PANIC_STACK.try_with(|slot| {
                *slot.lock() = Some(Backtrace::force_capture().to_string());
            });
            previous(info);
        }));
    });
}

// ---------------------------------------------------------------------------
// DispatchService
// ---------------------------------------------------------------------------

/// Innermost service of the dispatch stack.
#[derive(Clone)]
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchService {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl Service<DispatchCall> for DispatchService {
    type Response = Response<Bytes>;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Bytes>, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: DispatchCall) -> Self::Future {
        Box::pin(execute(Arc::clone(&self.dispatcher), call))
    }
}

/// Runs `call` through `dispatcher` inside the execution frame.
///
/// # Errors
///
/// Returns `DispatchError::Canceled` when the call's token fires before
/// the pipeline completes.
///
/// # Panics
///
/// With panic recovery disabled, a panic of the pipeline is resumed on the
/// caller.
pub async fn execute(
    dispatcher: Arc<Dispatcher>,
    call: DispatchCall,
) -> Result<Response<Bytes>, DispatchError> {
    let DispatchCall { request, cancel } = call;
    if cancel.is_cancelled() {
        return Err(DispatchError::Canceled);
    }

    let recover = !dispatcher.config().disable_panic_recovery;
    let fallback = request.clone();
    install_panic_hook();
    let worker_dispatcher = Arc::clone(&dispatcher);
    let stack = StackSlot::default();
    let mut worker = tokio::spawn(PANIC_STACK.scope(Arc::clone(&stack), async move {
        worker_dispatcher.handle(request).await
    }));

    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            if !recover {
                tokio::spawn(abort_on_panic(worker));
            }
            tracing::debug!(request_id = %fallback.request_id, "dispatch canceled");
            Err(DispatchError::Canceled)
        }
        joined = &mut worker => match joined {
            Ok(response) => Ok(response),
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                if !recover {
                    std::panic::resume_unwind(payload);
                }
                let error = recovered(
                    payload.as_ref(),
                    stack.lock().take(),
                    &dispatcher.config().service_name,
                );
                tracing::error!(
                    request_id = %fallback.request_id,
                    error = %error,
                    "recovered from panic in dispatch"
                );
                Ok(response::failure(&error, &fallback))
            }
            Err(_) => Err(DispatchError::Canceled),
        },
    }
}

/// Waits for a detached worker and brings the process down if it panicked.
async fn abort_on_panic(worker: JoinHandle<Response<Bytes>>) {
    if let Err(err) = worker.await {
        if err.is_panic() {
            tracing::error!("panic in canceled dispatch with recovery disabled, aborting");
            std::process::abort();
        }
    }
}

fn recovered(payload: &(dyn Any + Send), stack: Option<String>, subject: &str) -> ApiError {
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    ApiError::internal(format!("recovered from panic: {message}"), subject).with_data(
        serde_json::json!({
            "panic": message,
            "stack": stack.unwrap_or_default(),
        }),
    )
}
