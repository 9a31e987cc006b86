//! HTTP/WebSocket server lifecycle.
//!
//! `new()` wires shared state, `start()` binds the listener and `serve()`
//! runs until the shutdown future resolves. Splitting bind from serve lets
//! callers learn an OS-assigned port before traffic starts.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tidewire_core::ModelManager;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::handlers::{
    collection_handler, health_handler, liveness_handler, nested_handler, object_handler,
    push_upgrade_handler, readiness_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::push::PushServer;
use crate::service::DispatchPipeline;

/// Owns the listener and the state shared by every handler.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    state: AppState,
}

impl NetworkModule {
    /// Wires the adapter without binding a port. `push` should be the same
    /// server the dispatcher publishes its events to.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        pipeline: DispatchPipeline,
        models: Arc<dyn ModelManager>,
        push: Arc<PushServer>,
    ) -> Self {
        let state = AppState {
            pipeline,
            models,
            service_name: Arc::from(push.config().service_name.as_str()),
            push,
            shutdown: Arc::new(ShutdownController::new()),
            config: Arc::new(config.clone()),
            start_time: Instant::now(),
        };
        Self {
            config,
            listener: None,
            state,
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    /// Routes:
    /// - `GET /health`, `GET /health/live`, `GET /health/ready`
    /// - `GET /events`: WebSocket push
    /// - `/{category}`, `/{category}/{id}`,
    ///   `/{parent_category}/{parent_id}/{category}`: dispatch
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/events", get(push_upgrade_handler))
            .route(
                "/{category}",
                get(collection_handler)
                    .post(collection_handler)
                    .head(collection_handler),
            )
            .route(
                "/{category}/{id}",
                get(object_handler)
                    .put(object_handler)
                    .delete(object_handler)
                    .patch(object_handler),
            )
            .route(
                "/{parent_category}/{parent_id}/{category}",
                get(nested_handler)
                    .post(nested_handler)
                    .head(nested_handler),
            )
            .layer(build_http_layers(&self.config))
            .with_state(self.state.clone())
    }

    /// Binds the listener and returns the bound port.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts the push server and serves until `shutdown` resolves.
    ///
    /// On shutdown, new dispatches and sessions are refused, the push server
    /// closes and drains its sessions, then in-flight dispatches get up to
    /// `drain_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, the push server cannot
    /// start, or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();
        let state = self.state;

        state.push.start().await?;
        state.shutdown.set_ready();
        info!("serving HTTP and push connections");

        let signal = {
            let push = Arc::clone(&state.push);
            let controller = Arc::clone(&state.shutdown);
            async move {
                shutdown.await;
                controller.trigger_shutdown();
                push.stop().await;
            }
        };
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await?;

        if state.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all dispatches drained");
        } else {
            warn!(
                in_flight = state.shutdown.in_flight_count(),
                "drain timeout expired with dispatches in flight"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::handlers::tests::test_state;
    use crate::network::HealthState;

    fn module() -> NetworkModule {
        let state = test_state();
        NetworkModule::new(
            NetworkConfig {
                host: "127.0.0.1".to_string(),
                ..NetworkConfig::default()
            },
            state.pipeline,
            state.models,
            state.push,
        )
    }

    #[tokio::test]
    async fn start_binds_an_os_assigned_port() {
        let mut module = module();
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_requires_start() {
        let err = module().serve(std::future::ready(())).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serve_shuts_down_cleanly() {
        let mut module = module();
        module.start().await.unwrap();
        let controller = module.shutdown_controller();
        module.serve(std::future::ready(())).await.unwrap();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }
}
