//! Tidewire core: operations, entity model boundary, codecs, events and publications.

pub mod encoding;
pub mod error;
pub mod event;
pub mod filter;
pub mod model;
pub mod operation;
pub mod publication;

pub use encoding::{CodecError, Encoding};
pub use error::ApiError;
pub use event::{Event, EventType};
pub use filter::PushFilter;
pub use model::{
    Assignation, AssignationType, Entity, EntityList, Identity, ModelManager, ModelRegistry,
};
pub use operation::{AuthAction, Operation};
pub use publication::Publication;
