//! JSON event encoding
//!
//! Payload schemas are the application's business; the codec only checks
//! well-formedness.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Stateless JSON encoder/decoder
pub struct EventCodec;

impl EventCodec {
    pub fn encode_event<E: Serialize + ?Sized>(event: &E) -> Result<Bytes, CodecError> {
        serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    pub fn decode_event(payload: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(payload).map_err(CodecError::Decode)
    }
}
