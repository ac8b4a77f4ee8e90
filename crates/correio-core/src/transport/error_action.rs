use std::sync::Arc;

use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::{StorageResult, TransportResult};
use crate::message::{headers, now_nanos, Message};
use crate::queue::PhysicalQueue;
use crate::storage::{QueueStore, WriteBatchOp};
use crate::transport::pipeline::{DeliveryContext, TransportAction};
use crate::transport::txn::QueueTransaction;

/// How a dispatch failed, which decides whether the retry budget applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Counted against the retry budget.
    Business,
    /// Routed straight to the dead-letter queue: repetition will never make
    /// a malformed message parseable.
    Permanent,
}

/// What was done with a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-enqueued at the back of its source queue.
    Retried { attempt: u32 },
    /// Moved to the dead-letter queue with failure metadata.
    DeadLettered { attempts: u32 },
}

/// Bounded-retry stage: tracks delivery failures per message id, re-enqueues
/// while the budget lasts, and dead-letters beyond it. The message id is the
/// sole correlation key: the same logical message returns from the queue
/// with different in-memory identity on every attempt.
pub struct ErrorAction {
    max_retries: u32,
    attempts: DashMap<Uuid, u32>,
}

impl ErrorAction {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: DashMap::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Failures recorded in this process for a message id.
    pub fn attempts(&self, id: &Uuid) -> u32 {
        self.attempts.get(id).map(|e| *e).unwrap_or(0)
    }

    /// Whether a retry record exists for the id.
    pub fn is_tracking(&self, id: &Uuid) -> bool {
        self.attempts.contains_key(id)
    }

    /// A terminal success: drop the retry record.
    pub(crate) fn on_success(&self, id: &Uuid) {
        self.attempts.remove(id);
    }

    /// Record a failed delivery and stage its outcome into the transaction:
    /// delete-original plus re-enqueue-at-back while the budget lasts, or a
    /// move to the dead-letter queue with failure metadata beyond it.
    ///
    /// The wire-carried retry header seeds the count, so budgets survive a
    /// process restart that loses the in-memory table.
    pub(crate) fn on_failure(
        &self,
        message: &Message,
        source: &PhysicalQueue,
        storage_key: &[u8],
        kind: FailureKind,
        reason: &str,
        txn: &mut QueueTransaction,
        store: &dyn QueueStore,
    ) -> StorageResult<FailureDisposition> {
        let prior = self.attempts(&message.id).max(message.retries());
        let attempt = prior + 1;

        if kind == FailureKind::Permanent || prior >= self.max_retries {
            let dlq = store
                .get_queue(&source.queue)?
                .and_then(|record| record.dead_letter_queue)
                .unwrap_or_else(|| format!("{}.dlq", source.queue));

            let mut dead = message.clone();
            dead.headers.set(headers::FAILURE_REASON, reason);
            dead.headers
                .set(headers::FAILURE_ATTEMPTS, attempt.to_string());
            dead.headers.set(headers::FAILURE_AT, now_nanos().to_string());

            txn.stage(WriteBatchOp::DeleteMessage {
                key: storage_key.to_vec(),
            });
            txn.stage_enqueue(
                &PhysicalQueue {
                    queue: dlq,
                    subqueue: source.subqueue.clone(),
                },
                &dead,
            )?;
            self.attempts.remove(&message.id);
            Ok(FailureDisposition::DeadLettered { attempts: attempt })
        } else {
            self.attempts.insert(message.id, attempt);
            let mut retry = message.clone();
            retry.set_retries(attempt);

            txn.stage(WriteBatchOp::DeleteMessage {
                key: storage_key.to_vec(),
            });
            txn.stage_enqueue(source, &retry)?;
            Ok(FailureDisposition::Retried { attempt })
        }
    }
}

impl TransportAction for Arc<ErrorAction> {
    /// Pre-dispatch check: a message whose wire-carried retry count already
    /// exceeds the budget (re-enqueued by some earlier process) is consumed
    /// straight to the dead-letter queue.
    fn try_handle(
        &self,
        delivery: &DeliveryContext<'_>,
        txn: &mut QueueTransaction,
    ) -> TransportResult<bool> {
        if delivery.message.retries() <= self.max_retries {
            return Ok(false);
        }
        warn!(
            msg_id = %delivery.message.id,
            retries = delivery.message.retries(),
            "message arrived with exhausted retry budget, dead-lettering"
        );
        self.on_failure(
            delivery.message,
            delivery.source,
            delivery.storage_key,
            FailureKind::Permanent,
            "retry budget exhausted before dispatch",
            txn,
            delivery.store,
        )?;
        Ok(true)
    }
}
