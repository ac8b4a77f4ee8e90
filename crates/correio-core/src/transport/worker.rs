use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::TransportResult;
use crate::message::{control, headers, Message};
use crate::storage::{keys, WriteBatchOp};
use crate::transport::error_action::{FailureDisposition, FailureKind};
use crate::transport::pipeline::DeliveryContext;
use crate::transport::txn::QueueTransaction;
use crate::transport::Transport;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// The per-worker receive loop: claim-dequeue, pipeline, dispatch, commit.
/// Infrastructure faults roll the transaction back and back off; the message
/// reappears for a later attempt without touching its retry budget.
pub(super) fn run(transport: Arc<Transport>, index: usize) {
    debug!(worker = index, "worker started");
    transport.announce_ready();
    let mut backoff = INITIAL_BACKOFF;
    while !transport.is_shutting_down() {
        match transport.receive_one() {
            Ok(true) => {
                backoff = INITIAL_BACKOFF;
                transport.announce_ready();
            }
            Ok(false) => {
                backoff = INITIAL_BACKOFF;
                transport.park();
            }
            Err(e) => {
                warn!(worker = index, error = %e, "receive failed, backing off");
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
    debug!(worker = index, "worker stopped");
}

impl Transport {
    /// Dequeue and fully process at most one message. Returns false when the
    /// queue has nothing unclaimed.
    pub(crate) fn receive_one(&self) -> TransportResult<bool> {
        let prefix =
            keys::subqueue_prefix(&self.local_queue.queue, &self.local_queue.subqueue);
        // Claimed entries all sit in this prefix, so an unclaimed message (if
        // any) is within the first claims + 1 keys.
        let scan_limit = self.claims.len() + 1;
        let candidates = self.store.list_messages(&prefix, scan_limit)?;

        let mut txn = self.begin();
        let mut dequeued = None;
        for (key, message) in candidates {
            if txn.try_claim(message.id) {
                dequeued = Some((key, message));
                break;
            }
        }
        let Some((key, stored)) = dequeued else {
            return Ok(false);
        };

        if self.config.consume_in_transaction {
            txn.stage(WriteBatchOp::DeleteMessage { key: key.clone() });
        } else {
            // The dequeue commits right away; failures from here on are
            // handled by the pipeline's own re-enqueue, not rollback.
            self.store.delete_message(&key)?;
        }

        self.process(stored, key, txn)
    }

    fn process(
        &self,
        stored: Message,
        key: Vec<u8>,
        mut txn: QueueTransaction,
    ) -> TransportResult<bool> {
        let delivery = DeliveryContext {
            message: &stored,
            source: &self.local_queue,
            storage_key: &key,
            store: self.store.as_ref(),
        };
        // Any Err below rolls back the dequeue: the transaction is dropped
        // uncommitted and the claim is released.
        if self.pipeline.run(&delivery, &mut txn)? {
            self.error_action.on_success(&stored.id);
            txn.commit()?;
            debug!(msg_id = %stored.id, "message consumed by pipeline");
            return Ok(true);
        }

        // Decrypt into a working copy; the stored bytes stay sealed so any
        // re-enqueue or dead-letter preserves them exactly.
        let mut plain = stored.clone();
        if stored.is_encrypted() {
            match self.encryption.as_deref() {
                Some(service) => match service.decrypt(&plain.payload) {
                    Ok(bytes) => plain.payload = bytes,
                    Err(e) => {
                        return self.fail_permanent(&stored, &key, &e.to_string(), txn);
                    }
                },
                None => {
                    return self.fail_permanent(
                        &stored,
                        &key,
                        "encrypted payload but no encryption service configured",
                        txn,
                    );
                }
            }
        }

        let body = match self.serializer.from_bytes(&plain.payload) {
            Ok(body) => body,
            Err(e) => return self.fail_permanent(&stored, &key, &e.to_string(), txn),
        };

        match self.dispatcher.dispatch(&plain, &body) {
            Ok(()) => {
                self.error_action.on_success(&stored.id);
                txn.commit()?;
                debug!(msg_id = %stored.id, "message dispatched");
            }
            Err(e) => {
                let disposition = self.error_action.on_failure(
                    &stored,
                    &self.local_queue,
                    &key,
                    FailureKind::Business,
                    &e.to_string(),
                    &mut txn,
                    self.store.as_ref(),
                )?;
                txn.commit()?;
                match disposition {
                    FailureDisposition::Retried { attempt } => {
                        debug!(msg_id = %stored.id, attempt, "dispatch failed, re-enqueued")
                    }
                    FailureDisposition::DeadLettered { attempts } => {
                        warn!(msg_id = %stored.id, attempts, "dispatch failed, dead-lettered")
                    }
                }
            }
        }
        Ok(true)
    }

    fn fail_permanent(
        &self,
        stored: &Message,
        key: &[u8],
        reason: &str,
        mut txn: QueueTransaction,
    ) -> TransportResult<bool> {
        self.error_action.on_failure(
            stored,
            &self.local_queue,
            key,
            FailureKind::Permanent,
            reason,
            &mut txn,
            self.store.as_ref(),
        )?;
        txn.commit()?;
        warn!(msg_id = %stored.id, %reason, "permanent failure, dead-lettered");
        Ok(true)
    }

    /// Announce one unit of spare capacity to the configured load-balancer
    /// endpoint. Failures are logged, never fatal to the worker.
    pub(crate) fn announce_ready(&self) {
        let Some(ready) = &self.ready_endpoint else {
            return;
        };
        let mut msg = Message::new(self.local.clone(), ready.clone(), Vec::new());
        msg.set_message_type(control::READY_FOR_WORK);
        msg.headers.set(headers::WORKER, self.local.uri());
        msg.headers.set(headers::CAPACITY, "1");
        if let Err(e) = self.send(msg) {
            warn!(error = %e, "failed to announce ready-for-work");
        }
    }

    /// Park until a send wakes us or the idle timeout elapses, so shutdown
    /// is observed promptly.
    pub(crate) fn park(&self) {
        let _ = self
            .wakeup_rx
            .recv_timeout(Duration::from_millis(self.config.idle_timeout_ms));
    }
}
