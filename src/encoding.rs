//! Binary encoding of values handed to the remote back-ends.
//!
//! Sessions, requests and events are serialized with `bincode` before they
//! are written to Redis or published on a Redis channel.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error_handling::types::EncodingError;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodingError> {
    bincode::serialize(value).map_err(|e| EncodingError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EncodingError> {
    bincode::deserialize(bytes).map_err(|e| EncodingError::Decode(e.to_string()))
}
