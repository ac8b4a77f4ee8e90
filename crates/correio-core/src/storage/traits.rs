use crate::error::StorageResult;
use crate::message::Message;
use crate::queue::QueueRecord;

/// A single operation in an atomic write batch. A queue transaction is a
/// list of these, applied all-or-nothing at commit.
#[derive(Debug)]
pub enum WriteBatchOp {
    PutMessage { key: Vec<u8>, value: Vec<u8> },
    DeleteMessage { key: Vec<u8> },
    PutQueue { name: String, value: Vec<u8> },
    PutSubscription { key: Vec<u8>, value: Vec<u8> },
    DeleteSubscription { key: Vec<u8> },
    PutState { key: String, value: Vec<u8> },
    DeleteState { key: String },
}

/// Persistence contract for queues, messages, subscriptions, and shared
/// state. Implementations must be thread-safe, and `write_batch` must be
/// atomic: it is what makes dequeue-process-acknowledge transactional.
pub trait QueueStore: Send + Sync {
    // --- Message operations ---

    fn put_message(&self, key: &[u8], message: &Message) -> StorageResult<()>;

    fn get_message(&self, key: &[u8]) -> StorageResult<Option<Message>>;

    fn delete_message(&self, key: &[u8]) -> StorageResult<()>;

    /// List up to `limit` messages whose keys start with `prefix`, in key
    /// order (oldest first within a subqueue).
    fn list_messages(&self, prefix: &[u8], limit: usize)
        -> StorageResult<Vec<(Vec<u8>, Message)>>;

    // --- Queue records ---

    fn put_queue(&self, name: &str, record: &QueueRecord) -> StorageResult<()>;

    fn get_queue(&self, name: &str) -> StorageResult<Option<QueueRecord>>;

    fn list_queues(&self) -> StorageResult<Vec<QueueRecord>>;

    // --- Subscriptions ---

    fn put_subscription(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    fn delete_subscription(&self, key: &[u8]) -> StorageResult<()>;

    fn list_subscriptions(&self, prefix: &[u8]) -> StorageResult<Vec<Vec<u8>>>;

    // --- Shared state (heartbeat, epoch, worker table) ---

    fn put_state(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    fn get_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    fn delete_state(&self, key: &str) -> StorageResult<()>;

    /// List state entries whose keys start with `prefix`.
    fn list_state(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    // --- Batch operations ---

    /// Atomically apply a batch of write operations across column families.
    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()>;

    /// Flush buffered writes to durable storage.
    fn flush(&self) -> StorageResult<()>;
}
