//! Wire encodings: JSON and `MsgPack`.
//!
//! Both encodings are first-class. Payloads can be transcoded from one to the
//! other without knowing their schema, which lets an event encoded once in
//! its native encoding be served to clients that negotiated the other one.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors produced while encoding, decoding or transcoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload to decode was empty.
    #[error("empty body")]
    EmptyBody,
    /// The payload could not be decoded as JSON.
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
    /// The payload could not be decoded as `MsgPack`.
    #[error("malformed MsgPack: {0}")]
    MalformedMsgPack(String),
    /// No decoder is registered for the requested identity.
    #[error("no model registered for identity '{0}'")]
    UnknownIdentity(String),
    /// A value could not be serialized.
    #[error("unable to encode {encoding} payload: {reason}")]
    Encode {
        encoding: Encoding,
        reason: String,
    },
}

/// A supported wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// `application/json`.
    #[default]
    Json,
    /// `application/msgpack`.
    MsgPack,
}

impl Encoding {
    /// Canonical content type for this encoding.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::MsgPack => "application/msgpack",
        }
    }

    /// The other encoding.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Json => Self::MsgPack,
            Self::MsgPack => Self::Json,
        }
    }

    /// Parses a `Content-Type` or `Accept` header value.
    ///
    /// Parameters (`; charset=utf-8`) are ignored. Anything unrecognised,
    /// including `*/*`, falls back to JSON.
    #[must_use]
    pub fn from_content_type(value: &str) -> Self {
        for part in value.split(',') {
            let mime = part.split(';').next().unwrap_or_default().trim();
            match mime.to_ascii_lowercase().as_str() {
                "application/msgpack" | "application/x-msgpack" | "application/vnd.msgpack" => {
                    return Self::MsgPack
                }
                "application/json" => return Self::Json,
                _ => {}
            }
        }
        Self::Json
    }

    /// Parses the short names used in query parameters (`json`, `msgpack`).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "msgpack" => Some(Self::MsgPack),
            _ => None,
        }
    }

    /// Serializes `value`. `MsgPack` output uses named fields.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the value cannot be serialized.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        let result = match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Self::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
        };
        result.map_err(|reason| CodecError::Encode {
            encoding: self,
            reason,
        })
    }

    /// Deserializes `data`, distinguishing an empty payload from a malformed one.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::EmptyBody` for an empty slice, or the malformed
    /// variant matching this encoding.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, CodecError> {
        if data.is_empty() {
            return Err(CodecError::EmptyBody);
        }
        match self {
            Self::Json => {
                serde_json::from_slice(data).map_err(|e| CodecError::MalformedJson(e.to_string()))
            }
            Self::MsgPack => {
                rmp_serde::from_slice(data).map_err(|e| CodecError::MalformedMsgPack(e.to_string()))
            }
        }
    }

    /// Transcodes `data` from this encoding into `target`.
    ///
    /// Goes through a schema-less value model: `MsgPack` binary values become
    /// JSON arrays of bytes.
    ///
    /// # Errors
    ///
    /// Returns a decode error if `data` is not valid in this encoding, or an
    /// encode error if the value cannot be represented in `target`.
    pub fn convert(self, data: &[u8], target: Encoding) -> Result<Vec<u8>, CodecError> {
        if self == target {
            return Ok(data.to_vec());
        }
        match self {
            Self::Json => {
                let value: serde_json::Value = self.decode(data)?;
                target.encode(&value)
            }
            Self::MsgPack => {
                let value: rmpv::Value = self.decode(data)?;
                target.encode(&value)
            }
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_type())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        name: String,
        done: bool,
        weight: i64,
        tags: Vec<String>,
    }

    #[test]
    fn content_type_parsing() {
        assert_eq!(Encoding::from_content_type("application/json"), Encoding::Json);
        assert_eq!(
            Encoding::from_content_type("application/msgpack; charset=binary"),
            Encoding::MsgPack
        );
        assert_eq!(
            Encoding::from_content_type("text/html, application/x-msgpack"),
            Encoding::MsgPack
        );
        assert_eq!(Encoding::from_content_type("*/*"), Encoding::Json);
        assert_eq!(Encoding::from_content_type(""), Encoding::Json);
    }

    #[test]
    fn decode_distinguishes_empty_from_malformed() {
        let empty = Encoding::Json.decode::<Task>(b"").unwrap_err();
        assert!(matches!(empty, CodecError::EmptyBody));

        let malformed = Encoding::Json.decode::<Task>(b"not json").unwrap_err();
        assert!(matches!(malformed, CodecError::MalformedJson(_)));
        assert!(malformed.to_string().starts_with("malformed JSON"));
    }

    #[test]
    fn convert_same_encoding_is_identity() {
        let bytes = Encoding::Json.encode(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(Encoding::Json.convert(&bytes, Encoding::Json).unwrap(), bytes);
    }

    proptest! {
        #[test]
        fn msgpack_to_json_matches_direct_json(
            name in "[a-zA-Z0-9 ]{0,16}",
            done in any::<bool>(),
            weight in any::<i64>(),
            tags in proptest::collection::vec("[a-z]{1,6}", 0..4),
        ) {
            let task = Task { name, done, weight, tags };

            let direct: Task = serde_json::from_slice(&Encoding::Json.encode(&task).unwrap()).unwrap();

            let packed = Encoding::MsgPack.encode(&task).unwrap();
            let converted = Encoding::MsgPack.convert(&packed, Encoding::Json).unwrap();
            let via_msgpack: Task = serde_json::from_slice(&converted).unwrap();

            prop_assert_eq!(direct, via_msgpack);
        }

        #[test]
        fn json_to_msgpack_preserves_maps(entries in proptest::collection::btree_map("[a-z]{1,8}", any::<i32>(), 0..8)) {
            let json = Encoding::Json.encode(&entries).unwrap();
            let packed = Encoding::Json.convert(&json, Encoding::MsgPack).unwrap();
            let back: BTreeMap<String, i32> = Encoding::MsgPack.decode(&packed).unwrap();
            prop_assert_eq!(entries, back);
        }
    }
}
