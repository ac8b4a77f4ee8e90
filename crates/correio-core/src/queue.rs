use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{QueueStrategyKind, TransportConfig};
use crate::endpoint::Endpoint;
use crate::error::{ConfigError, StorageResult};
use crate::storage::QueueStore;

/// Subqueue label used when a queue is not partitioned per recipient.
pub const DEFAULT_SUBQUEUE: &str = "default";

/// The concrete queue a logical endpoint maps to: a physical queue name plus
/// a subqueue partition label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysicalQueue {
    pub queue: String,
    pub subqueue: String,
}

/// Record describing one physical queue, stored in the `queues` column
/// family. The dead-letter queue is created alongside its parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueRecord {
    pub name: String,
    pub dead_letter_queue: Option<String>,
}

impl QueueRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let dead_letter_queue = if name.ends_with(".dlq") {
            None
        } else {
            Some(format!("{name}.dlq"))
        };
        Self {
            name,
            dead_letter_queue,
        }
    }
}

/// Maps logical endpoint addresses to physical queue identifiers.
///
/// `resolve` must be pure and deterministic for the process lifetime;
/// `ensure_queue_exists` is the only side-effecting operation and must be
/// safe to call concurrently from multiple workers.
pub trait QueueStrategy: Send + Sync {
    fn resolve(&self, endpoint: &Endpoint) -> PhysicalQueue;

    fn ensure_queue_exists(&self, endpoint: &Endpoint) -> StorageResult<()>;
}

/// Every endpoint gets its own dedicated physical queue, created lazily on
/// first resolution.
pub struct FlatStrategy {
    store: Arc<dyn QueueStore>,
}

impl FlatStrategy {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }
}

impl QueueStrategy for FlatStrategy {
    fn resolve(&self, endpoint: &Endpoint) -> PhysicalQueue {
        PhysicalQueue {
            queue: endpoint.queue_name().to_string(),
            subqueue: DEFAULT_SUBQUEUE.to_string(),
        }
    }

    fn ensure_queue_exists(&self, endpoint: &Endpoint) -> StorageResult<()> {
        ensure_record(self.store.as_ref(), endpoint.queue_name())
    }
}

/// All endpoints share one physical queue, partitioned per recipient by a
/// subqueue label derived from the endpoint's queue name.
pub struct SubqueueStrategy {
    store: Arc<dyn QueueStore>,
    shared_queue: String,
}

impl SubqueueStrategy {
    pub fn new(store: Arc<dyn QueueStore>, shared_queue: impl Into<String>) -> Self {
        Self {
            store,
            shared_queue: shared_queue.into(),
        }
    }
}

impl QueueStrategy for SubqueueStrategy {
    fn resolve(&self, endpoint: &Endpoint) -> PhysicalQueue {
        PhysicalQueue {
            queue: self.shared_queue.clone(),
            subqueue: endpoint.queue_name().to_string(),
        }
    }

    fn ensure_queue_exists(&self, _endpoint: &Endpoint) -> StorageResult<()> {
        ensure_record(self.store.as_ref(), &self.shared_queue)
    }
}

/// Build the configured strategy. The config must have been validated.
pub fn strategy_from_config(
    config: &TransportConfig,
    store: Arc<dyn QueueStore>,
) -> Result<Arc<dyn QueueStrategy>, ConfigError> {
    match config.queue_strategy {
        QueueStrategyKind::Flat => Ok(Arc::new(FlatStrategy::new(store))),
        QueueStrategyKind::Subqueue => {
            let shared = config
                .shared_queue
                .clone()
                .filter(|s| !s.is_empty())
                .ok_or(ConfigError::SharedQueueMissing)?;
            Ok(Arc::new(SubqueueStrategy::new(store, shared)))
        }
    }
}

/// Create the queue record and its dead-letter companion if absent.
/// Storage puts are idempotent upserts of identical records, so a creation
/// race between workers converges on the same queue.
fn ensure_record(store: &dyn QueueStore, name: &str) -> StorageResult<()> {
    if store.get_queue(name)?.is_some() {
        return Ok(());
    }
    let record = QueueRecord::new(name);
    store.put_queue(name, &record)?;
    if let Some(dlq_name) = record.dead_letter_queue {
        if store.get_queue(&dlq_name)?.is_none() {
            store.put_queue(&dlq_name, &QueueRecord::new(dlq_name.as_str()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RocksDbQueueStore;

    fn test_store() -> (Arc<dyn QueueStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(RocksDbQueueStore::open(dir.path()).unwrap());
        (store, dir)
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::parse(&format!("correio://localhost/{name}")).unwrap()
    }

    #[test]
    fn flat_strategy_dedicates_a_queue_per_endpoint() {
        let (store, _dir) = test_store();
        let strategy = FlatStrategy::new(store);

        let orders = strategy.resolve(&endpoint("orders"));
        let billing = strategy.resolve(&endpoint("billing"));
        assert_eq!(orders.queue, "orders");
        assert_eq!(orders.subqueue, DEFAULT_SUBQUEUE);
        assert_ne!(orders.queue, billing.queue);
    }

    #[test]
    fn subqueue_strategy_shares_one_queue() {
        let (store, _dir) = test_store();
        let strategy = SubqueueStrategy::new(store, "bus");

        let orders = strategy.resolve(&endpoint("orders"));
        let billing = strategy.resolve(&endpoint("billing"));
        assert_eq!(orders.queue, "bus");
        assert_eq!(billing.queue, "bus");
        assert_eq!(orders.subqueue, "orders");
        assert_eq!(billing.subqueue, "billing");
    }

    #[test]
    fn resolution_is_idempotent() {
        let (store, _dir) = test_store();
        let strategy = FlatStrategy::new(store);
        let e = endpoint("orders");
        assert_eq!(strategy.resolve(&e), strategy.resolve(&e));
    }

    #[test]
    fn ensure_creates_queue_and_dead_letter_companion() {
        let (store, _dir) = test_store();
        let strategy = FlatStrategy::new(store.clone());

        strategy.ensure_queue_exists(&endpoint("orders")).unwrap();

        let record = store.get_queue("orders").unwrap().unwrap();
        assert_eq!(record.dead_letter_queue.as_deref(), Some("orders.dlq"));
        let dlq = store.get_queue("orders.dlq").unwrap().unwrap();
        assert_eq!(dlq.dead_letter_queue, None, "a DLQ gets no DLQ of its own");
    }

    #[test]
    fn ensure_is_idempotent() {
        let (store, _dir) = test_store();
        let strategy = FlatStrategy::new(store.clone());
        let e = endpoint("orders");

        strategy.ensure_queue_exists(&e).unwrap();
        strategy.ensure_queue_exists(&e).unwrap();
        assert_eq!(store.list_queues().unwrap().len(), 2);
    }

    #[test]
    fn concurrent_first_resolution_converges_on_one_queue() {
        let (store, _dir) = test_store();
        let strategy = Arc::new(FlatStrategy::new(store.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let strategy = strategy.clone();
                std::thread::spawn(move || {
                    let e = endpoint("orders");
                    strategy.ensure_queue_exists(&e).unwrap();
                    strategy.resolve(&e)
                })
            })
            .collect();

        let mut resolved = Vec::new();
        for handle in handles {
            resolved.push(handle.join().unwrap());
        }
        assert!(resolved.windows(2).all(|w| w[0] == w[1]));
        // The race produced exactly one queue record (plus its DLQ).
        assert_eq!(store.list_queues().unwrap().len(), 2);
    }

    #[test]
    fn strategy_from_config_respects_kind() {
        let (store, _dir) = test_store();
        let mut config = TransportConfig::default();

        let flat = strategy_from_config(&config, store.clone()).unwrap();
        assert_eq!(flat.resolve(&endpoint("orders")).queue, "orders");

        config.queue_strategy = QueueStrategyKind::Subqueue;
        assert!(matches!(
            strategy_from_config(&config, store.clone()),
            Err(ConfigError::SharedQueueMissing)
        ));

        config.shared_queue = Some("bus".to_string());
        let sub = strategy_from_config(&config, store).unwrap();
        assert_eq!(sub.resolve(&endpoint("orders")).queue, "bus");
    }
}
