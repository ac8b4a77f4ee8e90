use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::balancer::ready::ReadyForWorkListener;
use crate::balancer::{load_epoch, write_heartbeat, BalancerCommand, BalancerStats};
use crate::endpoint::Endpoint;
use crate::error::StorageResult;
use crate::message::{control, headers, now_nanos, Message};
use crate::queue::{PhysicalQueue, QueueStrategy};
use crate::storage::{keys, QueueStore, WriteBatchOp};
use crate::transport::QueueTransaction;

const SCAN_BATCH: usize = 64;

pub(super) struct CoreSettings {
    pub input_queue: PhysicalQueue,
    /// A separate ready-for-work queue, when one is configured apart from
    /// the input queue.
    pub ready_queue: Option<PhysicalQueue>,
    pub epoch: u64,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub instance: String,
}

/// Single-threaded assignment core. Owns all balancer state and processes
/// commands from API threads through a crossbeam channel; everything else it
/// reads straight from the shared queues.
pub(super) struct BalancerCore {
    store: Arc<dyn QueueStore>,
    strategy: Arc<dyn QueueStrategy>,
    inbound: Receiver<BalancerCommand>,
    listener: ReadyForWorkListener,
    settings: CoreSettings,
    running: bool,
    stop: Arc<AtomicBool>,
    /// Work items read from the input queue, oldest first, held here until
    /// capacity becomes available. Storage keeps them until assignment
    /// commits.
    pending: VecDeque<(Vec<u8>, Message)>,
    pending_ids: HashSet<Uuid>,
    assigned: u64,
    last_heartbeat: Option<Instant>,
}

impl BalancerCore {
    pub(super) fn new(
        store: Arc<dyn QueueStore>,
        strategy: Arc<dyn QueueStrategy>,
        inbound: Receiver<BalancerCommand>,
        listener: ReadyForWorkListener,
        settings: CoreSettings,
    ) -> Self {
        Self {
            store,
            strategy,
            inbound,
            listener,
            settings,
            running: true,
            stop: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
            pending_ids: HashSet::new(),
            assigned: 0,
            last_heartbeat: None,
        }
    }

    pub(super) fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Run the assignment loop. Blocks the current thread until a `Shutdown`
    /// command arrives, the external stop flag is raised, or the instance is
    /// superseded by a newer epoch.
    pub(super) fn run(&mut self) {
        info!(
            instance = %self.settings.instance,
            epoch = self.settings.epoch,
            "balancer core started"
        );
        match self.listener.load() {
            Ok(count) if count > 0 => info!(count, "restored ready-worker table"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to restore ready-worker table"),
        }
        self.heartbeat();

        while self.running && !self.stop.load(Ordering::Relaxed) {
            let mut drained = 0;
            while let Ok(command) = self.inbound.try_recv() {
                self.handle_command(command);
                drained += 1;
                if !self.running {
                    break;
                }
            }
            if !self.running {
                break;
            }

            self.drain_queues();
            self.assign_pending();
            self.tick_heartbeat();

            if !self.running {
                break;
            }
            if drained == 0 {
                match self.inbound.recv_timeout(self.settings.idle_timeout) {
                    Ok(command) => self.handle_command(command),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        info!("command channel disconnected, shutting down");
                        self.running = false;
                    }
                }
            }
        }

        if let Err(e) = self.store.flush() {
            warn!(error = %e, "failed to flush storage during balancer shutdown");
        }
        info!(
            instance = %self.settings.instance,
            assigned = self.assigned,
            "balancer core stopped"
        );
    }

    fn handle_command(&mut self, command: BalancerCommand) {
        match command {
            BalancerCommand::Announce { worker, capacity } => {
                debug!(%worker, capacity, "capacity announced via command");
                if let Err(e) = self.listener.announce(worker, capacity, now_nanos()) {
                    warn!(error = %e, "failed to record capacity announcement");
                }
            }
            BalancerCommand::Stats { reply } => {
                let _ = reply.send(BalancerStats {
                    epoch: self.settings.epoch,
                    pending_work: self.pending.len(),
                    live_capacity: self.listener.live_capacity(now_nanos()),
                    assigned: self.assigned,
                });
            }
            BalancerCommand::Shutdown => {
                info!("shutdown command received");
                self.running = false;
            }
        }
    }

    /// Pull announcements and work items off the balancer's queues.
    fn drain_queues(&mut self) {
        let input = self.settings.input_queue.clone();
        self.drain_queue(&input);
        if let Some(ready_queue) = self.settings.ready_queue.clone() {
            self.drain_queue(&ready_queue);
        }
    }

    fn drain_queue(&mut self, queue: &PhysicalQueue) {
        let prefix = keys::subqueue_prefix(&queue.queue, &queue.subqueue);
        let batch = match self.store.list_messages(&prefix, SCAN_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "failed to scan balancer queue");
                return;
            }
        };
        for (key, message) in batch {
            if self.pending_ids.contains(&message.id) {
                continue;
            }
            if message.message_type() == Some(control::READY_FOR_WORK) {
                // Delete before crediting: a crash in between loses one
                // announcement (the worker renews later) instead of
                // double-crediting capacity on replay.
                if let Err(e) = self.store.delete_message(&key) {
                    warn!(error = %e, "failed to consume ready-for-work message");
                    continue;
                }
                self.record_announcement(&message);
            } else {
                self.pending_ids.insert(message.id);
                self.pending.push_back((key, message));
            }
        }
    }

    fn record_announcement(&mut self, message: &Message) {
        let worker = match message.headers.get(headers::WORKER) {
            Some(uri) => match Endpoint::parse(uri) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(%uri, error = %e, "ready-for-work with unparseable worker endpoint");
                    return;
                }
            },
            None => message.source.clone(),
        };
        let capacity = message
            .headers
            .get(headers::CAPACITY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        debug!(%worker, capacity, "capacity announced");
        if let Err(e) = self.listener.announce(worker, capacity, now_nanos()) {
            warn!(error = %e, "failed to record capacity announcement");
        }
    }

    /// Hand pending work to ready workers, highest capacity first, until
    /// capacity runs out.
    fn assign_pending(&mut self) {
        loop {
            let Some((key, message)) = self
                .pending
                .front()
                .map(|(k, m)| (k.clone(), m.clone()))
            else {
                return;
            };
            let now = now_nanos();
            let Some(worker) = self.listener.acquire(now) else {
                return;
            };
            match self.assign(&key, &message, &worker) {
                Ok(true) => {
                    let _ = self.pending.pop_front();
                    self.pending_ids.remove(&message.id);
                    self.assigned += 1;
                }
                Ok(false) => {
                    // Superseded: another instance holds a newer epoch. Stop
                    // assigning entirely; the item stays queued for it.
                    self.running = false;
                    return;
                }
                Err(e) => {
                    warn!(msg_id = %message.id, error = %e, "assignment failed, re-crediting worker");
                    if let Err(e) = self.listener.announce(worker, 1, now) {
                        warn!(error = %e, "failed to re-credit worker capacity");
                    }
                    return;
                }
            }
        }
    }

    /// Move one work item to the chosen worker's queue, fenced by the epoch:
    /// the commit is abandoned when a newer instance has claimed a higher
    /// epoch, so at most one of two dueling balancers wins the item.
    fn assign(
        &mut self,
        key: &[u8],
        message: &Message,
        worker: &Endpoint,
    ) -> StorageResult<bool> {
        let stored_epoch = load_epoch(self.store.as_ref())?;
        if stored_epoch > self.settings.epoch {
            error!(
                own_epoch = self.settings.epoch,
                stored_epoch,
                "superseded by a newer balancer epoch, abandoning assignment"
            );
            return Ok(false);
        }

        let mut forwarded = message.clone();
        forwarded.destination = worker.clone();
        let target = self.strategy.resolve(worker);

        let mut txn = QueueTransaction::detached(self.store.clone());
        txn.stage(WriteBatchOp::DeleteMessage { key: key.to_vec() });
        txn.stage_enqueue(&target, &forwarded)?;
        txn.commit()?;
        debug!(msg_id = %message.id, %worker, "work item assigned");
        Ok(true)
    }

    fn tick_heartbeat(&mut self) {
        let due = self
            .last_heartbeat
            .map(|at| at.elapsed() >= self.settings.heartbeat_interval)
            .unwrap_or(true);
        if due {
            self.heartbeat();
        }
    }

    fn heartbeat(&mut self) {
        let now = now_nanos();
        if let Err(e) = write_heartbeat(
            self.store.as_ref(),
            self.settings.epoch,
            &self.settings.instance,
            now,
        ) {
            warn!(error = %e, "failed to write heartbeat");
        }
        self.listener.purge_stale(now);
        self.last_heartbeat = Some(Instant::now());
    }
}
