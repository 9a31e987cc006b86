//! Transport envelope for events crossing a pub/sub backend.

use serde::{Deserialize, Serialize};

use crate::encoding::{CodecError, Encoding};
use crate::event::Event;

/// An encoded event addressed to a topic.
///
/// Backends move publications as opaque bytes; only the push server decodes
/// them back into events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub topic: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub encoding: Encoding,
}

impl Publication {
    /// Creates an empty publication for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: Vec::new(),
            encoding: Encoding::MsgPack,
        }
    }

    /// Encodes `event` into this publication using `encoding`.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the event cannot be serialized.
    pub fn encode(&mut self, event: &Event, encoding: Encoding) -> Result<(), CodecError> {
        self.data = event.encode(encoding)?;
        self.encoding = encoding;
        Ok(())
    }

    /// Builds a publication for `topic` carrying `event` in its native encoding.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the event cannot be serialized.
    pub fn from_event(topic: impl Into<String>, event: &Event) -> Result<Self, CodecError> {
        let mut publication = Self::new(topic);
        publication.encode(event, event.encoding())?;
        Ok(publication)
    }

    /// Decodes the carried event.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the payload is not a valid event.
    pub fn decode(&self) -> Result<Event, CodecError> {
        Event::decode(&self.data, self.encoding)
    }
}
