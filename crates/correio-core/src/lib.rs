//! Reliable message-transport core of the correio service bus: persistent
//! queues between logical endpoints, transactional dequeue-process-acknowledge,
//! bounded retry with dead-lettering, and primary/standby load balancing with
//! ready-for-work backpressure.

pub mod balancer;
pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod queue;
pub mod serializer;
pub mod storage;
pub mod subscription;
pub mod transport;

pub use balancer::{
    Balancer, BalancerCommand, BalancerStats, ReadyForWorkListener, ReadyWorkerEntry, Role,
    SecondaryBalancer,
};
pub use config::{BalancerConfig, BusConfig, IsolationLevel, QueueStrategyKind, TransportConfig};
pub use crypto::EncryptionService;
pub use endpoint::{Endpoint, EndpointRouter, Route, StaticRouter};
pub use error::{
    BalancerError, ConfigError, DispatchError, StorageError, TransportError,
};
pub use message::{control, headers, Headers, Message};
pub use queue::{
    FlatStrategy, PhysicalQueue, QueueRecord, QueueStrategy, SubqueueStrategy, DEFAULT_SUBQUEUE,
};
pub use serializer::{JsonSerializer, MessageSerializer};
pub use storage::{QueueStore, RocksDbQueueStore, WriteBatchOp};
pub use subscription::{RocksDbSubscriptionStore, SubscriptionStorage};
pub use transport::{
    ErrorAction, MessageDispatcher, QueueTransaction, SubscriptionAction, Transport,
    TransportAction, TransportOptions, TransportPipeline,
};
