use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::Endpoint;

/// Well-known header names carried on every envelope.
pub mod headers {
    /// Number of recorded delivery failures for this message id.
    pub const RETRIES: &str = "correio.retries";
    /// Present when the payload is (or must be) sealed by the encryption service.
    pub const ENCRYPTED: &str = "correio.encrypted";
    /// Id of the message this one was fanned out from or replies to.
    pub const CORRELATION_ID: &str = "correio.correlation-id";
    /// Logical message type, used for subscription fan-out and control messages.
    pub const MESSAGE_TYPE: &str = "correio.type";
    /// Subscriber-announced type on subscribe/unsubscribe control messages.
    pub const SUBSCRIPTION_TYPE: &str = "correio.subscription-type";
    /// Announcing worker's endpoint uri on ready-for-work messages.
    pub const WORKER: &str = "correio.worker";
    /// Announced spare capacity on ready-for-work messages.
    pub const CAPACITY: &str = "correio.capacity";
    /// Dead-letter metadata: last failure summary.
    pub const FAILURE_REASON: &str = "correio.failure.reason";
    /// Dead-letter metadata: total delivery attempts.
    pub const FAILURE_ATTEMPTS: &str = "correio.failure.attempts";
    /// Dead-letter metadata: unix-nanos timestamp of the terminal failure.
    pub const FAILURE_AT: &str = "correio.failure.at";
}

/// Control message types consumed by the transport and balancer themselves,
/// never dispatched to the business layer.
pub mod control {
    pub const SUBSCRIBE: &str = "correio.subscribe";
    pub const UNSUBSCRIBE: &str = "correio.unsubscribe";
    pub const READY_FOR_WORK: &str = "correio.ready-for-work";
}

/// Insertion-ordered string headers. `set` replaces in place, keeping the
/// original position.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        match self.0.iter_mut().find(|(k, _)| k.as_str() == name) {
            Some((_, v)) => *v = value.into(),
            None => self.0.push((name.to_string(), value.into())),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k.as_str() == name)?;
        Some(self.0.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The unit of transfer. Immutable once enqueued: the id is assigned at
/// creation and never changes across re-enqueues for retry; the retry count
/// travels in [`headers::RETRIES`] and is monotonically non-decreasing per id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub headers: Headers,
    pub payload: Vec<u8>,
    pub created_at: u64,
}

impl Message {
    pub fn new(source: Endpoint, destination: Endpoint, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination,
            headers: Headers::new(),
            payload,
            created_at: now_nanos(),
        }
    }

    /// Recorded failure count, as carried on the wire.
    pub fn retries(&self) -> u32 {
        self.headers
            .get(headers::RETRIES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_retries(&mut self, count: u32) {
        self.headers.set(headers::RETRIES, count.to_string());
    }

    /// Mark the payload as requiring encryption before it leaves the process.
    /// Sending a marked message without a configured encryption service fails
    /// fast instead of silently sending plaintext.
    pub fn require_encryption(&mut self) {
        self.headers.set(headers::ENCRYPTED, "1");
    }

    pub fn is_encrypted(&self) -> bool {
        self.headers.contains(headers::ENCRYPTED)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_TYPE)
    }

    pub fn set_message_type(&mut self, message_type: &str) {
        self.headers.set(headers::MESSAGE_TYPE, message_type);
    }
}

/// Current unix time in nanoseconds.
pub(crate) fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::parse(&format!("correio://localhost/{name}")).unwrap()
    }

    #[test]
    fn headers_preserve_insertion_order() {
        let mut h = Headers::new();
        h.set("b", "2");
        h.set("a", "1");
        h.set("c", "3");
        let names: Vec<&str> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn headers_set_replaces_in_place() {
        let mut h = Headers::new();
        h.set("a", "1");
        h.set("b", "2");
        h.set("a", "updated");
        assert_eq!(h.get("a"), Some("updated"));
        let names: Vec<&str> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a", "b"], "replacement should keep position");
    }

    #[test]
    fn headers_remove() {
        let mut h = Headers::new();
        h.set("a", "1");
        assert_eq!(h.remove("a"), Some("1".to_string()));
        assert_eq!(h.remove("a"), None);
        assert!(h.is_empty());
    }

    #[test]
    fn retries_default_to_zero() {
        let msg = Message::new(endpoint("src"), endpoint("dst"), vec![1, 2, 3]);
        assert_eq!(msg.retries(), 0);
    }

    #[test]
    fn retries_round_trip_through_headers() {
        let mut msg = Message::new(endpoint("src"), endpoint("dst"), vec![]);
        msg.set_retries(3);
        assert_eq!(msg.retries(), 3);
        assert_eq!(msg.headers.get(headers::RETRIES), Some("3"));
    }

    #[test]
    fn id_survives_serde_round_trip() {
        let msg = Message::new(endpoint("src"), endpoint("dst"), vec![42]);
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn encryption_marker() {
        let mut msg = Message::new(endpoint("src"), endpoint("dst"), vec![]);
        assert!(!msg.is_encrypted());
        msg.require_encryption();
        assert!(msg.is_encrypted());
    }
}
