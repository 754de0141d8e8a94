//! Pluggable value and exception serde
//!
//! Parameter maps store values as opaque serialized strings; a codec
//! collaborator handles the typed `get`/`put` conversion. The default is
//! JSON via `serde_json`, matching the rest of the crate's wire format, but
//! callers may substitute any codec that round-trips through `String`.

use serde::{de::DeserializeOwned, Serialize};

/// Serializes/deserializes typed values to/from the string slots stored in
/// parameter maps.
///
/// Kept non-generic (and therefore object-safe: callers hold this behind
/// `Arc<dyn ObjectCodec>`) by routing every value through `serde_json::Value`
/// as the type-erased intermediate. A pluggable implementation varies *how*
/// that value becomes a string (JSON text, a different wire library that
/// still round-trips through `serde_json::Value`, compression, …), not
/// whether a given Rust type can be encoded — that part stays generic via
/// [`ObjectCodecExt`], implemented for every `ObjectCodec` for free.
pub trait ObjectCodec: Send + Sync {
    fn encode_json(&self, value: serde_json::Value) -> Result<String, CodecError>;
    fn decode_json(&self, raw: &str) -> Result<serde_json::Value, CodecError>;
}

/// Generic `get`/`put`-style helpers layered on top of [`ObjectCodec`].
/// Blanket-implemented so any `&dyn ObjectCodec` gets `encode`/`decode` for
/// free, without making the base trait's methods generic (which would make
/// it impossible to use as a trait object).
pub trait ObjectCodecExt: ObjectCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        let json = serde_json::to_value(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.encode_json(json)
    }

    fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<T, CodecError> {
        let value = self.decode_json(raw)?;
        serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl<C: ObjectCodec + ?Sized> ObjectCodecExt for C {}

/// Serializes/deserializes the flight's terminal error.
pub trait ExceptionCodec: Send + Sync {
    fn encode_error(&self, error: &str) -> Result<String, CodecError>;
    fn decode_error(&self, raw: &str) -> Result<String, CodecError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Default `ObjectCodec` backed by `serde_json`.
#[derive(Debug, Clone, Default)]
pub struct JsonObjectCodec;

impl ObjectCodec for JsonObjectCodec {
    fn encode_json(&self, value: serde_json::Value) -> Result<String, CodecError> {
        serde_json::to_string(&value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_json(&self, raw: &str) -> Result<serde_json::Value, CodecError> {
        serde_json::from_str(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Default `ExceptionCodec`: the error's `Display` text, stored verbatim.
#[derive(Debug, Clone, Default)]
pub struct JsonExceptionCodec;

impl ExceptionCodec for JsonExceptionCodec {
    fn encode_error(&self, error: &str) -> Result<String, CodecError> {
        Ok(error.to_string())
    }

    fn decode_error(&self, raw: &str) -> Result<String, CodecError> {
        Ok(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        amount: u32,
    }

    #[test]
    fn json_object_codec_round_trips() {
        let codec = JsonObjectCodec;
        let encoded = codec.encode(&Payload { amount: 42 }).unwrap();
        let decoded: Payload = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, Payload { amount: 42 });
    }

    #[test]
    fn json_object_codec_reports_decode_errors() {
        let codec = JsonObjectCodec;
        let result: Result<Payload, _> = codec.decode("not json");
        assert!(result.is_err());
    }

    #[test]
    fn exception_codec_round_trips_text() {
        let codec = JsonExceptionCodec;
        let encoded = codec.encode_error("boom").unwrap();
        assert_eq!(codec.decode_error(&encoded).unwrap(), "boom");
    }
}
