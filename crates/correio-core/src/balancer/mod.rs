mod primary;
mod ready;
mod secondary;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BusConfig;
use crate::endpoint::Endpoint;
use crate::error::{BalancerError, ConfigError, StorageResult};
use crate::message::now_nanos;
use crate::queue::{self, PhysicalQueue};
use crate::storage::{keys, QueueStore, WriteBatchOp};

use primary::{BalancerCore, CoreSettings};

pub use ready::{ReadyForWorkListener, ReadyWorkerEntry};
pub use secondary::{Role, SecondaryBalancer};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Commands sent from API callers to the single-threaded balancer core.
pub enum BalancerCommand {
    /// Upsert a worker's announced spare capacity.
    Announce { worker: Endpoint, capacity: u32 },
    Stats {
        reply: tokio::sync::oneshot::Sender<BalancerStats>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct BalancerStats {
    pub epoch: u64,
    pub pending_work: usize,
    pub live_capacity: u32,
    pub assigned: u64,
}

/// The heartbeat record the active balancer writes every interval, watched
/// by standby instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub epoch: u64,
    pub at: u64,
    pub instance: String,
}

pub(crate) fn read_heartbeat(store: &dyn QueueStore) -> StorageResult<Option<HeartbeatRecord>> {
    match store.get_state(keys::HEARTBEAT_KEY)? {
        Some(value) => match serde_json::from_slice(&value) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "corrupt heartbeat record, treating as absent");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub(crate) fn write_heartbeat(
    store: &dyn QueueStore,
    epoch: u64,
    instance: &str,
    now: u64,
) -> StorageResult<()> {
    let record = HeartbeatRecord {
        epoch,
        at: now,
        instance: instance.to_string(),
    };
    store.put_state(keys::HEARTBEAT_KEY, &serde_json::to_vec(&record)?)
}

/// The fencing epoch: a monotonically increasing counter claimed by every
/// instance that starts acting as primary. Assignment commits re-read it and
/// abandon the work when a newer instance has claimed a higher epoch, which
/// is what keeps a reviving primary and a promoted secondary from both
/// assigning the same item.
pub(crate) fn load_epoch(store: &dyn QueueStore) -> StorageResult<u64> {
    Ok(store
        .get_state(keys::EPOCH_KEY)?
        .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0))
}

/// Bump the stored epoch and stamp a first heartbeat, atomically.
pub(crate) fn claim_epoch(
    store: &dyn QueueStore,
    instance: &str,
    now: u64,
) -> StorageResult<u64> {
    let next = load_epoch(store)? + 1;
    let heartbeat = HeartbeatRecord {
        epoch: next,
        at: now,
        instance: instance.to_string(),
    };
    store.write_batch(vec![
        WriteBatchOp::PutState {
            key: keys::EPOCH_KEY.to_string(),
            value: next.to_be_bytes().to_vec(),
        },
        WriteBatchOp::PutState {
            key: keys::HEARTBEAT_KEY.to_string(),
            value: serde_json::to_vec(&heartbeat)?,
        },
    ])?;
    Ok(next)
}

/// The primary load balancer: owns the assignment thread and its command
/// channel. Consumes ready-for-work announcements, assigns incoming work to
/// the worker with the most spare capacity, and heartbeats for any standby.
pub struct Balancer {
    command_tx: crossbeam_channel::Sender<BalancerCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Balancer {
    /// Start the primary on a dedicated OS thread, claiming a fresh fencing
    /// epoch.
    pub fn start_primary(
        config: &BusConfig,
        store: Arc<dyn QueueStore>,
    ) -> Result<Self, BalancerError> {
        config.validate()?;
        let primary_uri = config
            .balancer
            .primary
            .clone()
            .ok_or(ConfigError::MissingBalancerEndpoint)?;
        let endpoint = Endpoint::parse(&primary_uri)?;
        let strategy = queue::strategy_from_config(&config.transport, store.clone())?;
        strategy.ensure_queue_exists(&endpoint)?;
        let input_queue = strategy.resolve(&endpoint);
        let ready_queue = ready_queue_for(config, &strategy, &input_queue)?;

        let epoch = claim_epoch(store.as_ref(), endpoint.uri(), now_nanos())?;
        let listener = ReadyForWorkListener::new(
            store.clone(),
            Duration::from_millis(config.balancer.liveness_window_ms),
        );
        let settings = CoreSettings {
            input_queue,
            ready_queue,
            epoch,
            heartbeat_interval: Duration::from_millis(config.balancer.heartbeat_interval_ms),
            idle_timeout: Duration::from_millis(config.transport.idle_timeout_ms),
            instance: endpoint.uri().to_string(),
        };

        let (command_tx, command_rx) = crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY);
        let thread_strategy = strategy.clone();
        let handle = thread::Builder::new()
            .name("correio-balancer".to_string())
            .spawn(move || {
                let mut core =
                    BalancerCore::new(store, thread_strategy, command_rx, listener, settings);
                core.run();
            })
            .map_err(|e| BalancerError::Spawn(e.to_string()))?;

        info!(endpoint = %endpoint, epoch, "load balancer started as primary");
        Ok(Self {
            command_tx,
            thread: Some(handle),
        })
    }

    /// Announce spare capacity for a worker, bypassing the queue.
    pub fn announce(&self, worker: Endpoint, capacity: u32) -> Result<(), BalancerError> {
        self.send_command(BalancerCommand::Announce { worker, capacity })
    }

    pub fn stats(&self) -> Result<BalancerStats, BalancerError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.send_command(BalancerCommand::Stats { reply: reply_tx })?;
        reply_rx
            .blocking_recv()
            .map_err(|_| BalancerError::ChannelDisconnected)
    }

    fn send_command(&self, command: BalancerCommand) -> Result<(), BalancerError> {
        self.command_tx.try_send(command).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => BalancerError::ChannelFull,
            crossbeam_channel::TrySendError::Disconnected(_) => {
                BalancerError::ChannelDisconnected
            }
        })
    }

    /// Stop accepting assignments, let the in-flight one finish, and join
    /// the core thread.
    pub fn shutdown(mut self) -> Result<(), BalancerError> {
        info!("initiating balancer shutdown");
        let _ = self.command_tx.send(BalancerCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            handle.join().map_err(|_| BalancerError::ThreadPanicked)?;
        }
        info!("balancer shutdown complete");
        Ok(())
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.command_tx.send(BalancerCommand::Shutdown);
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Resolve the ready-for-work queue when it differs from the input queue.
fn ready_queue_for(
    config: &BusConfig,
    strategy: &Arc<dyn crate::queue::QueueStrategy>,
    input_queue: &PhysicalQueue,
) -> Result<Option<PhysicalQueue>, BalancerError> {
    let Some(uri) = &config.balancer.ready_for_work else {
        return Ok(None);
    };
    let endpoint = Endpoint::parse(uri)?;
    let queue = strategy.resolve(&endpoint);
    if queue == *input_queue {
        return Ok(None);
    }
    strategy.ensure_queue_exists(&endpoint)?;
    Ok(Some(queue))
}
