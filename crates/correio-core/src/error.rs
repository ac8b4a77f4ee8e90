/// Low-level storage errors (RocksDB, record encoding).
/// From the transport's point of view these are transient infrastructure
/// faults: they are retried with backoff and never charged against a
/// message's retry budget.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("record encoding error: {0}")]
    Encoding(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        StorageError::RocksDb(err.into_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Encoding(err.to_string())
    }
}

/// Errors surfaced by the transport to senders and to its own workers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Message body unparseable. Permanent: routed straight to the
    /// dead-letter queue, bypassing the retry budget.
    #[error("payload serialization error: {0}")]
    Serialization(String),

    #[error("message requires encryption but no encryption service is configured")]
    EncryptionKeyMissing,

    #[error("payload decryption failed: {0}")]
    Crypto(String),

    #[error("transport is shutting down")]
    ShuttingDown,

    #[error("worker thread spawn failed: {0}")]
    WorkerSpawn(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Fatal startup configuration errors. These abort startup with a
/// descriptive failure instead of degrading at runtime.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("transport endpoint must not be empty")]
    EmptyEndpoint,

    #[error("invalid endpoint uri: {0} (expected scheme://host/queue)")]
    InvalidEndpoint(String),

    #[error("worker_count must be at least 1")]
    NoWorkers,

    #[error("queue_strategy \"subqueue\" requires shared_queue to be set")]
    SharedQueueMissing,

    #[error("balancer.primary endpoint is required to run a load balancer")]
    MissingBalancerEndpoint,

    #[error("liveness_window_ms ({window}) must exceed heartbeat_interval_ms ({interval})")]
    LivenessWindowTooShort { window: u64, interval: u64 },
}

/// Errors from the balancer front: command channel and thread lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("balancer command channel is full")]
    ChannelFull,

    #[error("balancer command channel is disconnected")]
    ChannelDisconnected,

    #[error("balancer thread panicked")]
    ThreadPanicked,

    #[error("balancer thread spawn failed: {0}")]
    Spawn(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failure raised by the business dispatch layer. Counted against the
/// failing message's retry budget.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DispatchError(pub String);

pub type StorageResult<T> = std::result::Result<T, StorageError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;
