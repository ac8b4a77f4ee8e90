use std::sync::Arc;

use tracing::warn;

use crate::endpoint::Endpoint;
use crate::error::StorageResult;
use crate::storage::{keys, QueueStore};

/// Durable mapping of message type to subscriber endpoints. At most one
/// entry per (type, endpoint) pair; entries survive process restart.
pub trait SubscriptionStorage: Send + Sync {
    fn subscribe(&self, message_type: &str, subscriber: &Endpoint) -> StorageResult<()>;

    fn unsubscribe(&self, message_type: &str, subscriber: &Endpoint) -> StorageResult<()>;

    fn subscribers(&self, message_type: &str) -> StorageResult<Vec<Endpoint>>;
}

/// Subscription store over the `subscriptions` column family. The composite
/// key enforces (type, endpoint) uniqueness: re-subscribing is an upsert.
pub struct RocksDbSubscriptionStore {
    store: Arc<dyn QueueStore>,
}

impl RocksDbSubscriptionStore {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }
}

impl SubscriptionStorage for RocksDbSubscriptionStore {
    fn subscribe(&self, message_type: &str, subscriber: &Endpoint) -> StorageResult<()> {
        let key = keys::subscription_key(message_type, subscriber.uri());
        self.store.put_subscription(&key, subscriber.uri().as_bytes())
    }

    fn unsubscribe(&self, message_type: &str, subscriber: &Endpoint) -> StorageResult<()> {
        let key = keys::subscription_key(message_type, subscriber.uri());
        self.store.delete_subscription(&key)
    }

    fn subscribers(&self, message_type: &str) -> StorageResult<Vec<Endpoint>> {
        let prefix = keys::subscription_prefix(message_type);
        let mut endpoints = Vec::new();
        for value in self.store.list_subscriptions(&prefix)? {
            let uri = match std::str::from_utf8(&value) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(%message_type, error = %e, "skipping non-utf8 subscription entry");
                    continue;
                }
            };
            match Endpoint::parse(uri) {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => warn!(%message_type, %uri, error = %e, "skipping corrupt subscription entry"),
            }
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RocksDbQueueStore;

    fn test_subscriptions() -> (RocksDbSubscriptionStore, Arc<dyn QueueStore>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(RocksDbQueueStore::open(dir.path()).unwrap());
        (RocksDbSubscriptionStore::new(store.clone()), store, dir)
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::parse(&format!("correio://localhost/{name}")).unwrap()
    }

    #[test]
    fn subscribe_and_list() {
        let (subs, _store, _dir) = test_subscriptions();
        subs.subscribe("order-placed", &endpoint("billing")).unwrap();
        subs.subscribe("order-placed", &endpoint("shipping")).unwrap();
        subs.subscribe("order-cancelled", &endpoint("billing")).unwrap();

        let subscribers = subs.subscribers("order-placed").unwrap();
        assert_eq!(subscribers.len(), 2);
        assert!(subscribers.contains(&endpoint("billing")));
        assert!(subscribers.contains(&endpoint("shipping")));
    }

    #[test]
    fn subscribe_twice_is_one_entry() {
        let (subs, _store, _dir) = test_subscriptions();
        subs.subscribe("order-placed", &endpoint("billing")).unwrap();
        subs.subscribe("order-placed", &endpoint("billing")).unwrap();
        assert_eq!(subs.subscribers("order-placed").unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_pair() {
        let (subs, _store, _dir) = test_subscriptions();
        subs.subscribe("order-placed", &endpoint("billing")).unwrap();
        subs.subscribe("order-placed", &endpoint("shipping")).unwrap();

        subs.unsubscribe("order-placed", &endpoint("billing")).unwrap();
        assert_eq!(
            subs.subscribers("order-placed").unwrap(),
            vec![endpoint("shipping")]
        );
    }

    #[test]
    fn subscriptions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store: Arc<dyn QueueStore> =
                Arc::new(RocksDbQueueStore::open(dir.path()).unwrap());
            RocksDbSubscriptionStore::new(store)
                .subscribe("order-placed", &endpoint("billing"))
                .unwrap();
        }
        {
            let store: Arc<dyn QueueStore> =
                Arc::new(RocksDbQueueStore::open(dir.path()).unwrap());
            let subs = RocksDbSubscriptionStore::new(store);
            assert_eq!(
                subs.subscribers("order-placed").unwrap(),
                vec![endpoint("billing")]
            );
        }
    }
}
