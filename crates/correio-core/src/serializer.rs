use serde_json::Value;

use crate::error::{TransportError, TransportResult};

/// Serializes business payloads into the opaque byte form carried by
/// [`crate::message::Message::payload`]. Implementations must round-trip.
pub trait MessageSerializer: Send + Sync {
    fn to_bytes(&self, body: &Value) -> TransportResult<Vec<u8>>;

    fn from_bytes(&self, bytes: &[u8]) -> TransportResult<Value>;
}

/// The default JSON wire form.
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn to_bytes(&self, body: &Value) -> TransportResult<Vec<u8>> {
        serde_json::to_vec(body).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8]) -> TransportResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Serialization(e.to_string()))
    }
}
