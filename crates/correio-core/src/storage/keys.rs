//! Key encoding for the RocksDB column families.
//!
//! Numeric components use big-endian encoding so lexicographic order matches
//! numeric order; variable-length strings are length-prefixed with a
//! big-endian u16; `:` (0x3A) separates components.

use uuid::Uuid;

const SEPARATOR: u8 = b':';

/// State key holding the active balancer's heartbeat record.
pub const HEARTBEAT_KEY: &str = "balancer:heartbeat";
/// State key holding the balancer fencing epoch (big-endian u64).
pub const EPOCH_KEY: &str = "balancer:epoch";
/// State key prefix for persisted ready-worker entries.
pub const WORKER_PREFIX: &str = "worker:";

fn encode_string(s: &str) -> Vec<u8> {
    let len = u16::try_from(s.len()).expect("key component exceeds 64 KiB");
    let mut buf = Vec::with_capacity(2 + s.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf
}

/// Build a message key: `{queue}:{subqueue}:{enqueued_ns}:{msg_id}`.
///
/// Queue-first layout groups a queue's subqueues together; the big-endian
/// timestamp orders each subqueue oldest-first, which is what makes
/// back-of-queue re-enqueue (a fresh timestamp under the same id) work.
pub fn message_key(queue: &str, subqueue: &str, enqueued_ns: u64, msg_id: &Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    key.extend_from_slice(&encode_string(queue));
    key.push(SEPARATOR);
    key.extend_from_slice(&encode_string(subqueue));
    key.push(SEPARATOR);
    key.extend_from_slice(&enqueued_ns.to_be_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(msg_id.as_bytes());
    key
}

/// Prefix covering every message in one subqueue of a physical queue.
pub fn subqueue_prefix(queue: &str, subqueue: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(48);
    prefix.extend_from_slice(&encode_string(queue));
    prefix.push(SEPARATOR);
    prefix.extend_from_slice(&encode_string(subqueue));
    prefix.push(SEPARATOR);
    prefix
}

/// Prefix covering every message in a physical queue, all subqueues.
pub fn queue_prefix(queue: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(32);
    prefix.extend_from_slice(&encode_string(queue));
    prefix.push(SEPARATOR);
    prefix
}

/// Build a subscription key: `{message_type}:{subscriber_uri}`. One key per
/// (type, endpoint) pair; the value stores the subscriber uri bytes.
pub fn subscription_key(message_type: &str, subscriber_uri: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(48);
    key.extend_from_slice(&encode_string(message_type));
    key.push(SEPARATOR);
    key.extend_from_slice(&encode_string(subscriber_uri));
    key
}

/// Prefix covering every subscriber of one message type.
pub fn subscription_prefix(message_type: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(32);
    prefix.extend_from_slice(&encode_string(message_type));
    prefix.push(SEPARATOR);
    prefix
}

/// State key for a persisted ready-worker entry.
pub fn worker_state_key(worker_uri: &str) -> String {
    format!("{WORKER_PREFIX}{worker_uri}")
}
