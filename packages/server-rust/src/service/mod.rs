//! Operation dispatch.
//!
//! This module implements the request side of the server:
//!
//! 1. **Context** (`context`): the request and the mutable per-dispatch state
//! 2. **Processors** (`processor`): per-operation capabilities and their registry
//! 3. **Auth** (`auth`): authenticator and authorizer chains
//! 4. **Dispatch** (`dispatch`): the pipeline from permission check to event emission
//! 5. **Response** (`response`): status, headers and body assembly
//! 6. **Execution frame** (`executor`): cancellation and panic containment
//! 7. **Middleware** (`middleware`): Tower layers (metrics, rate limiting, timeout)

pub mod auth;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod executor;
pub mod middleware;
pub mod processor;
pub mod response;

// Re-export key types for convenient access.
pub use auth::{Authorizer, RequestAuthenticator, SessionAuthenticator};
pub use config::ServerConfig;
pub use context::{Context, Output, OutputData, RawResponse, Request};
pub use dispatch::{Dispatcher, EventPusher};
pub use executor::{DispatchCall, DispatchError, DispatchService};
pub use middleware::{build_dispatch_pipeline, DispatchPipeline, RateLimiter};
pub use processor::{
    CreateProcessor, DeleteProcessor, InfoProcessor, PatchProcessor, Processor,
    ProcessorRegistry, RegistryError, RetrieveManyProcessor, RetrieveProcessor, UpdateProcessor,
};
