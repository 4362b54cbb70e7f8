//! Pluggable byte <-> value codec used by the cache, queue, and bus.
//!
//! `serde_json` and `bincode` sit behind one trait instead of being called
//! ad hoc at each site, so a caller can swap codecs without touching the
//! subsystems that use them.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerializerError {
    #[error("json serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode serialization failed: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type SerializerResult<T> = Result<T, SerializerError>;

/// Byte <-> value codec. The default shipped implementation is JSON;
/// `BincodeSerializer` is provided as a second concrete implementation to
/// demonstrate the trait is genuinely swappable.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize>(&self, value: &T) -> SerializerResult<Vec<u8>>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> SerializerResult<T>;

    fn serialize_to_string<T: Serialize>(&self, value: &T) -> SerializerResult<String> {
        Ok(String::from_utf8_lossy(&self.serialize(value)?).into_owned())
    }

    fn deserialize_from_string<T: DeserializeOwned>(&self, s: &str) -> SerializerResult<T> {
        self.deserialize(s.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> SerializerResult<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> SerializerResult<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> SerializerResult<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> SerializerResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        id: u32,
        name: String,
    }

    #[test]
    fn json_round_trips() {
        let s = JsonSerializer;
        let p = Payload { id: 1, name: "a".into() };
        let bytes = s.serialize(&p).unwrap();
        let back: Payload = s.deserialize(&bytes).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn bincode_round_trips() {
        let s = BincodeSerializer;
        let p = Payload { id: 2, name: "b".into() };
        let bytes = s.serialize(&p).unwrap();
        let back: Payload = s.deserialize(&bytes).unwrap();
        assert_eq!(p, back);
    }
}
