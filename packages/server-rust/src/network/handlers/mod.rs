//! axum handlers and the state they share.
//!
//! - `rest`: CRUD routes mapped onto dispatch operations
//! - `push`: the WebSocket push endpoint
//! - `health`: health, liveness and readiness probes

pub mod health;
pub mod push;
pub mod rest;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use push::push_upgrade_handler;
pub use rest::{collection_handler, nested_handler, object_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tidewire_core::{ApiError, ModelManager};

use super::{NetworkConfig, ShutdownController};
use crate::push::PushServer;
use crate::service::DispatchPipeline;

/// State handed to every handler through `State` extraction. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Layered dispatch service; cloned per request.
    pub pipeline: DispatchPipeline,
    /// Resolves route categories to identities.
    pub models: Arc<dyn ModelManager>,
    pub push: Arc<PushServer>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Subject of errors raised by the adapter itself.
    pub service_name: Arc<str>,
    pub start_time: Instant,
}

impl AppState {
    /// Error reported while the server is draining.
    pub(crate) fn unavailable(&self) -> ApiError {
        ApiError::new(
            "Service Unavailable",
            "the server is shutting down",
            self.service_name.as_ref(),
            503,
        )
    }
}

/// JSON error response for failures raised before a dispatch request exists.
pub(crate) fn error_response(err: ApiError) -> Response {
    let status = StatusCode::from_u16(err.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json([err])).into_response()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::push::PushConfig;
    use crate::service::dispatch::tests::{list_identity, models, Spy};
    use crate::service::{build_dispatch_pipeline, Dispatcher, ProcessorRegistry, ServerConfig};

    /// State over a `list` spy processor whose events feed a local push server.
    pub(crate) fn test_state() -> AppState {
        let push = Arc::new(PushServer::new(PushConfig::default()));
        let processors = Arc::new(ProcessorRegistry::new());
        processors
            .register(&list_identity(), Arc::new(Spy::default()))
            .unwrap();
        let models: Arc<dyn ModelManager> = Arc::new(models());
        let dispatcher = Dispatcher::new(ServerConfig::default(), Arc::clone(&models), processors)
            .with_event_pusher(push.clone());

        AppState {
            pipeline: build_dispatch_pipeline(Arc::new(dispatcher), None),
            models,
            push,
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(NetworkConfig::default()),
            service_name: Arc::from("test"),
            start_time: Instant::now(),
        }
    }
}
