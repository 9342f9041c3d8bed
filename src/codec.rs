//! Codecs turning values into payload bytes and back.
//!
//! The facade is generic over its codec, so encode and decode are resolved
//! statically at each `publish`/`subscribe` call site; codecs themselves
//! stay object-free and stateless.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::BoxError;

/// An encode/decode capability over serde values.
///
/// `decode` produces a freshly owned value per call; the facade relies on
/// this to hand independently owned values to every subscriber of a topic.
pub trait Codec: Send + Sync + 'static {
    /// Serialize `value` into payload bytes.
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized;

    /// Parse payload bytes into an owned `T`.
    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned;
}

/// An error from the underlying serialization library.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CodecError(BoxError);

impl CodecError {
    /// Wrap a library error.
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }
}

/// The default codec: compact, non-self-describing binary via `postcard`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postcard;

impl Codec for Postcard {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        postcard::to_stdvec(value).map_err(CodecError::new)
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        postcard::from_bytes(bytes).map_err(CodecError::new)
    }
}

/// A human-readable JSON codec, useful when payloads must be inspectable on
/// the wire or shared with non-Rust consumers.
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

#[cfg(feature = "json")]
impl Codec for Json {
    fn encode<T>(&self, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_vec(value).map_err(CodecError::new)
    }

    fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(bytes).map_err(CodecError::new)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ChatMessage {
        room: String,
        seq: u64,
        body: String,
        tags: Vec<String>,
        edited: Option<f64>,
    }

    fn sample() -> ChatMessage {
        ChatMessage {
            room: "room:123".into(),
            seq: 42,
            body: "hello".into(),
            tags: vec!["a".into(), "b".into()],
            edited: Some(1.5),
        }
    }

    #[test]
    fn postcard_round_trips_composite_values() {
        let codec = Postcard;
        let encoded = codec.encode(&sample()).unwrap();
        let decoded: ChatMessage = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn postcard_round_trips_primitives() {
        let codec = Postcard;
        let decoded: i64 = codec.decode(&codec.encode(&-7i64).unwrap()).unwrap();
        assert_eq!(decoded, -7);
        let decoded: String = codec.decode(&codec.encode("str").unwrap()).unwrap();
        assert_eq!(decoded, "str");
    }

    #[test]
    fn postcard_reports_decode_errors() {
        let codec = Postcard;
        // A truncated length-prefixed string cannot decode.
        let err = codec.decode::<String>(&[0xFF]).unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_round_trips_composite_values() {
        let codec = Json;
        let encoded = codec.encode(&sample()).unwrap();
        let decoded: ChatMessage = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, sample());
    }
}
