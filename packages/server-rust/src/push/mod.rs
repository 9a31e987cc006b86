//! Push delivery of events to connected clients.
//!
//! - **Sessions** (`session`): per-client state and bounded outbound queue
//! - **Registry** (`registry`): admission and the live session map
//! - **Hook** (`hook`): pluggable lifecycle and delivery policy
//! - **Server** (`server`): event publication and the distribution loop

pub mod config;
pub mod hook;
pub mod registry;
pub mod server;
pub mod session;

pub use config::PushConfig;
pub use hook::{EventSummary, PushDispatchHook};
pub use registry::SessionRegistry;
pub use server::PushServer;
pub use session::{negotiate_encodings, PushMessage, PushSession};
