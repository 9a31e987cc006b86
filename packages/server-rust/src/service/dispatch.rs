//! The dispatch pipeline.
//!
//! [`Dispatcher::dispatch`] runs one request through, in order: relationship
//! check, authentication, authorization, read-only gate, capability check,
//! payload decoding, processor invocation and event emission. The first
//! failing step short-circuits the rest.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use tidewire_core::{
    ApiError, Assignation, Entity, Event, EventType, ModelManager, Operation,
};

use super::auth::{self, Authorizer, RequestAuthenticator};
use super::config::ServerConfig;
use super::context::{Context, OutputData, Request};
use super::processor::ProcessorRegistry;
use super::response;

/// Receives the events produced by successful dispatches.
///
/// Delivery is best effort. Implementations log their failures instead of
/// returning them.
#[async_trait]
pub trait EventPusher: Send + Sync {
    async fn push_events(&self, events: Vec<Event>);
}

/// Event type implied by a successful operation, if any.
#[must_use]
pub fn implied_event_type(operation: Operation) -> Option<EventType> {
    match operation {
        Operation::Create | Operation::Patch => Some(EventType::Create),
        Operation::Update => Some(EventType::Update),
        Operation::Delete => Some(EventType::Delete),
        Operation::RetrieveMany | Operation::Retrieve | Operation::Info => None,
    }
}

/// Collaborators of the dispatch pipeline.
pub struct Dispatcher {
    config: Arc<ServerConfig>,
    models: Arc<dyn ModelManager>,
    processors: Arc<ProcessorRegistry>,
    authenticators: Vec<Arc<dyn RequestAuthenticator>>,
    authorizers: Vec<Arc<dyn Authorizer>>,
    pusher: Option<Arc<dyn EventPusher>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: ServerConfig,
        models: Arc<dyn ModelManager>,
        processors: Arc<ProcessorRegistry>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            models,
            processors,
            authenticators: Vec::new(),
            authorizers: Vec::new(),
            pusher: None,
        }
    }

    /// Appends an authenticator to the chain.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn RequestAuthenticator>) -> Self {
        self.authenticators.push(authenticator);
        self
    }

    /// Appends an authorizer to the chain.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizers.push(authorizer);
        self
    }

    /// Sets where produced events go. Without a pusher events are discarded.
    #[must_use]
    pub fn with_event_pusher(mut self, pusher: Arc<dyn EventPusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn models(&self) -> &Arc<dyn ModelManager> {
        &self.models
    }

    #[must_use]
    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    /// Dispatches `request` and assembles the response, success or error.
    pub async fn handle(&self, request: Request) -> Response<Bytes> {
        let mut ctx = Context::new(request);
        match self.dispatch(&mut ctx).await {
            Ok(()) => response::success(&ctx, &self.config.service_name),
            Err(err) => response::failure(&err, ctx.request()),
        }
    }

    /// Runs the pipeline against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the `ApiError` of the first failing step.
    pub async fn dispatch(&self, ctx: &mut Context) -> Result<(), ApiError> {
        let subject = self.config.service_name.as_str();
        let operation = ctx.operation();
        let identity = ctx.request().identity.clone();
        let parent = ctx.request().parent_identity.clone();

        if !self
            .models
            .relationship_allowed(&identity, &parent, operation)
        {
            return Err(ApiError::method_not_allowed(
                format!("{operation} is not allowed on {identity} under {parent}"),
                subject,
            ));
        }

        auth::authenticate_request(&self.authenticators, ctx, subject).await?;
        auth::authorize_request(&self.authorizers, ctx, subject).await?;

        if operation.is_write() && self.config.is_locked(&identity.name) {
            return Err(ApiError::locked(
                "the service is in read-only mode",
                subject,
            ));
        }

        let processor = self
            .processors
            .processor(&identity)
            .filter(|processor| processor.supports(operation))
            .ok_or_else(|| {
                ApiError::not_implemented(
                    format!("{operation} operation not implemented for {identity}"),
                    subject,
                )
            })?;

        if operation.has_payload() {
            let input = self.decode_input(ctx.request(), subject)?;
            ctx.set_input_data(input);
        }

        match processor.process(operation, ctx).await {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                return Err(ApiError::from_anyhow(err).unwrap_or_else(|other| {
                    tracing::error!(
                        error = %other,
                        identity = %identity,
                        operation = %operation,
                        "processor failed"
                    );
                    ApiError::internal(other.to_string(), subject)
                }));
            }
            None => {
                return Err(ApiError::not_implemented(
                    format!("{operation} operation not implemented for {identity}"),
                    subject,
                ));
            }
        }

        self.emit_events(ctx).await;
        Ok(())
    }

    fn decode_input(&self, request: &Request, subject: &str) -> Result<Box<dyn Entity>, ApiError> {
        let decoded = if request.operation == Operation::Patch {
            request
                .encoding
                .decode::<Assignation>(&request.data)
                .map(|assignation| Box::new(assignation) as Box<dyn Entity>)
        } else {
            self.models
                .decode(&request.identity, request.encoding, &request.data)
        };
        let entity = decoded.map_err(|err| ApiError::bad_request(err.to_string(), subject))?;
        entity.validate()?;
        Ok(entity)
    }

    async fn emit_events(&self, ctx: &Context) {
        let mut events = ctx.take_events();

        if !ctx.disable_output_push() {
            if let (Some(event_type), Some(OutputData::Entity(entity))) =
                (implied_event_type(ctx.operation()), ctx.output_data())
            {
                match Event::new(event_type, entity.as_ref(), ctx.request().encoding) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        tracing::warn!(error = %err, "unable to build event for output");
                    }
                }
            }
        }

        if events.is_empty() {
            return;
        }
        match &self.pusher {
            Some(pusher) => pusher.push_events(events).await,
            None => tracing::debug!(count = events.len(), "no event pusher, dropping events"),
        }
    }
}
