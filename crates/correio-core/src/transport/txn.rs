use std::sync::Arc;

use dashmap::DashSet;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::message::{now_nanos, Message};
use crate::queue::PhysicalQueue;
use crate::storage::{keys, QueueStore, WriteBatchOp};

/// A scoped queue transaction: the claim on a dequeued message plus the
/// storage operations staged against it. Nothing becomes visible to other
/// workers until `commit` applies the whole batch atomically; dropping the
/// transaction without committing rolls everything back, discarding staged
/// operations so the claimed message reappears for a later attempt.
pub struct QueueTransaction {
    store: Arc<dyn QueueStore>,
    claims: Option<Arc<DashSet<Uuid>>>,
    claimed: Option<Uuid>,
    ops: Vec<WriteBatchOp>,
    committed: bool,
}

impl QueueTransaction {
    pub(crate) fn new(store: Arc<dyn QueueStore>, claims: Arc<DashSet<Uuid>>) -> Self {
        Self {
            store,
            claims: Some(claims),
            claimed: None,
            ops: Vec::new(),
            committed: false,
        }
    }

    /// A transaction without a claim set, for single-consumer callers like
    /// the balancer core.
    pub(crate) fn detached(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            claims: None,
            claimed: None,
            ops: Vec::new(),
            committed: false,
        }
    }

    /// Claim a message id for exclusive processing. Returns false when
    /// another worker of the same transport already holds it.
    pub(crate) fn try_claim(&mut self, id: Uuid) -> bool {
        match &self.claims {
            Some(claims) => {
                if claims.insert(id) {
                    self.claimed = Some(id);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    pub(crate) fn stage(&mut self, op: WriteBatchOp) {
        self.ops.push(op);
    }

    /// Stage an enqueue with a fresh timestamp, placing the message at the
    /// back of the target subqueue.
    pub(crate) fn stage_enqueue(
        &mut self,
        queue: &PhysicalQueue,
        message: &Message,
    ) -> StorageResult<()> {
        let key = keys::message_key(&queue.queue, &queue.subqueue, now_nanos(), &message.id);
        let value = serde_json::to_vec(message).map_err(StorageError::from)?;
        self.stage(WriteBatchOp::PutMessage { key, value });
        Ok(())
    }

    /// Apply every staged operation atomically and release the claim.
    pub fn commit(mut self) -> StorageResult<()> {
        let ops = std::mem::take(&mut self.ops);
        if !ops.is_empty() {
            self.store.write_batch(ops)?;
        }
        self.committed = true;
        self.release_claim();
        Ok(())
    }

    /// Discard the transaction. Equivalent to dropping it; named for call
    /// sites where the rollback is the point.
    pub fn rollback(self) {}

    fn release_claim(&mut self) {
        if let (Some(claims), Some(id)) = (&self.claims, self.claimed.take()) {
            claims.remove(&id);
        }
    }
}

impl Drop for QueueTransaction {
    fn drop(&mut self) {
        if !self.committed {
            self.release_claim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::storage::RocksDbQueueStore;

    fn test_store() -> (Arc<dyn QueueStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(RocksDbQueueStore::open(dir.path()).unwrap());
        (store, dir)
    }

    fn test_message() -> Message {
        Message::new(
            Endpoint::parse("correio://localhost/sender").unwrap(),
            Endpoint::parse("correio://localhost/orders").unwrap(),
            vec![7],
        )
    }

    fn orders_queue() -> PhysicalQueue {
        PhysicalQueue {
            queue: "orders".to_string(),
            subqueue: "default".to_string(),
        }
    }

    #[test]
    fn staged_ops_are_invisible_until_commit() {
        let (store, _dir) = test_store();
        let msg = test_message();

        let mut txn = QueueTransaction::detached(store.clone());
        txn.stage_enqueue(&orders_queue(), &msg).unwrap();

        let prefix = keys::queue_prefix("orders");
        assert!(store.list_messages(&prefix, usize::MAX).unwrap().is_empty());

        txn.commit().unwrap();
        assert_eq!(store.list_messages(&prefix, usize::MAX).unwrap().len(), 1);
    }

    #[test]
    fn drop_discards_staged_ops() {
        let (store, _dir) = test_store();
        let msg = test_message();

        let mut txn = QueueTransaction::detached(store.clone());
        txn.stage_enqueue(&orders_queue(), &msg).unwrap();
        txn.rollback();

        let prefix = keys::queue_prefix("orders");
        assert!(store.list_messages(&prefix, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn claim_is_exclusive_and_released_on_drop() {
        let (store, _dir) = test_store();
        let claims = Arc::new(DashSet::new());
        let id = Uuid::new_v4();

        let mut txn_a = QueueTransaction::new(store.clone(), claims.clone());
        assert!(txn_a.try_claim(id));

        let mut txn_b = QueueTransaction::new(store.clone(), claims.clone());
        assert!(!txn_b.try_claim(id), "second claim on the same id must fail");

        drop(txn_a);
        let mut txn_c = QueueTransaction::new(store, claims);
        assert!(txn_c.try_claim(id), "claim should be free again after rollback");
    }

    #[test]
    fn claim_is_released_on_commit() {
        let (store, _dir) = test_store();
        let claims = Arc::new(DashSet::new());
        let id = Uuid::new_v4();

        let mut txn = QueueTransaction::new(store.clone(), claims.clone());
        assert!(txn.try_claim(id));
        txn.commit().unwrap();
        assert!(claims.is_empty());
    }
}
