//! Change notifications pushed to connected clients.
//!
//! An [`Event`] carries the entity payload already encoded, together with
//! the encoding it was produced in. On the wire a JSON event embeds the
//! entity as a JSON document; a `MsgPack` event embeds it as a binary blob,
//! so neither side re-parses the entity just to forward the event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::encoding::{CodecError, Encoding};
use crate::model::Entity;

/// Kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Wire forms
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct JsonWireEvent {
    #[serde(rename = "type")]
    event_type: EventType,
    identity: String,
    entity: serde_json::Value,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct MsgPackWireEvent {
    #[serde(rename = "type")]
    event_type: EventType,
    identity: String,
    #[serde(with = "serde_bytes")]
    entity: Vec<u8>,
    timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An immutable notification of an entity change.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event_type: EventType,
    identity: String,
    entity: Vec<u8>,
    encoding: Encoding,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Builds an event for `entity`, encoding it with `encoding` and stamping
    /// it with the current time.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the entity cannot be serialized.
    pub fn new(
        event_type: EventType,
        entity: &dyn Entity,
        encoding: Encoding,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            event_type,
            identity: entity.identity().name,
            entity: encoding.encode(entity)?,
            encoding,
            timestamp: Utc::now(),
        })
    }

    /// Builds an event from an already encoded entity with an explicit timestamp.
    #[must_use]
    pub fn from_parts(
        event_type: EventType,
        identity: impl Into<String>,
        entity: Vec<u8>,
        encoding: Encoding,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            identity: identity.into(),
            entity,
            encoding,
            timestamp,
        }
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Name of the identity of the changed entity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Encoded entity payload, in [`Event::encoding`].
    #[must_use]
    pub fn entity(&self) -> &[u8] {
        &self.entity
    }

    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Decodes the entity payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns a decode error if the payload does not match `T`.
    pub fn decode_entity<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.encoding.decode(&self.entity)
    }

    /// Returns a copy of this event whose entity is transcoded to `target`.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the entity cannot be transcoded.
    pub fn convert(&self, target: Encoding) -> Result<Self, CodecError> {
        Ok(Self {
            entity: self.encoding.convert(&self.entity, target)?,
            encoding: target,
            ..self.clone()
        })
    }

    /// Serializes the whole event in `target`, transcoding the entity if
    /// `target` differs from the event's native encoding.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the entity cannot be transcoded or the
    /// event cannot be serialized.
    pub fn encode(&self, target: Encoding) -> Result<Vec<u8>, CodecError> {
        match target {
            Encoding::Json => {
                let entity: serde_json::Value = match self.encoding {
                    Encoding::Json => Encoding::Json.decode(&self.entity)?,
                    Encoding::MsgPack => Encoding::Json
                        .decode(&Encoding::MsgPack.convert(&self.entity, Encoding::Json)?)?,
                };
                Encoding::Json.encode(&JsonWireEvent {
                    event_type: self.event_type,
                    identity: self.identity.clone(),
                    entity,
                    timestamp: self.timestamp,
                })
            }
            Encoding::MsgPack => Encoding::MsgPack.encode(&MsgPackWireEvent {
                event_type: self.event_type,
                identity: self.identity.clone(),
                entity: self.encoding.convert(&self.entity, Encoding::MsgPack)?,
                timestamp: self.timestamp,
            }),
        }
    }

    /// Parses an event serialized with [`Event::encode`].
    ///
    /// # Errors
    ///
    /// Returns `CodecError::EmptyBody` or a malformed variant.
    pub fn decode(data: &[u8], encoding: Encoding) -> Result<Self, CodecError> {
        match encoding {
            Encoding::Json => {
                let wire: JsonWireEvent = encoding.decode(data)?;
                Ok(Self {
                    event_type: wire.event_type,
                    identity: wire.identity,
                    entity: encoding.encode(&wire.entity)?,
                    encoding,
                    timestamp: wire.timestamp,
                })
            }
            Encoding::MsgPack => {
                let wire: MsgPackWireEvent = encoding.decode(data)?;
                Ok(Self {
                    event_type: wire.event_type,
                    identity: wire.identity,
                    entity: wire.entity,
                    encoding,
                    timestamp: wire.timestamp,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::model::Identity;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct List {
        id: String,
        name: String,
        archived: bool,
        priority: i64,
    }

    impl Entity for List {
        fn identity(&self) -> Identity {
            Identity::new("list", "lists")
        }

        fn identifier(&self) -> String {
            self.id.clone()
        }
    }

    fn list() -> List {
        List {
            id: "l1".into(),
            name: "groceries".into(),
            archived: false,
            priority: 3,
        }
    }

    #[test]
    fn new_tags_identity_and_encodes_entity() {
        let event = Event::new(EventType::Create, &list(), Encoding::MsgPack).unwrap();
        assert_eq!(event.identity(), "list");
        assert_eq!(event.event_type(), EventType::Create);
        assert_eq!(event.encoding(), Encoding::MsgPack);
        assert_eq!(event.decode_entity::<List>().unwrap(), list());
    }

    #[test]
    fn json_wire_form_embeds_entity_document() {
        let event = Event::new(EventType::Update, &list(), Encoding::Json).unwrap();
        let value: serde_json::Value =
            serde_json::from_slice(&event.encode(Encoding::Json).unwrap()).unwrap();
        assert_eq!(value["type"], "update");
        assert_eq!(value["identity"], "list");
        assert_eq!(value["entity"]["name"], "groceries");
    }

    #[test]
    fn decode_reverses_encode_in_both_encodings() {
        let event = Event::new(EventType::Delete, &list(), Encoding::Json).unwrap();
        for encoding in [Encoding::Json, Encoding::MsgPack] {
            let decoded = Event::decode(&event.encode(encoding).unwrap(), encoding).unwrap();
            assert_eq!(decoded.identity(), "list");
            assert_eq!(decoded.event_type(), EventType::Delete);
            assert_eq!(decoded.timestamp(), event.timestamp());
            assert_eq!(decoded.decode_entity::<List>().unwrap(), list());
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Event::decode(b"", Encoding::Json),
            Err(CodecError::EmptyBody)
        ));
        assert!(matches!(
            Event::decode(b"not json", Encoding::Json),
            Err(CodecError::MalformedJson(_))
        ));
    }

    proptest! {
        #[test]
        fn msgpack_event_converted_to_json_matches_direct_json(
            name in "[a-zA-Z ]{0,12}",
            archived in any::<bool>(),
            priority in any::<i64>(),
        ) {
            let entity = List { id: "x".into(), name, archived, priority };

            let direct = Event::new(EventType::Create, &entity, Encoding::Json).unwrap();
            let packed = Event::new(EventType::Create, &entity, Encoding::MsgPack).unwrap();

            let wire = packed.encode(Encoding::MsgPack).unwrap();
            let converted = Event::decode(&wire, Encoding::MsgPack)
                .unwrap()
                .convert(Encoding::Json)
                .unwrap();

            prop_assert_eq!(converted.encoding(), Encoding::Json);
            prop_assert_eq!(
                converted.decode_entity::<List>().unwrap(),
                direct.decode_entity::<List>().unwrap()
            );
        }
    }
}
