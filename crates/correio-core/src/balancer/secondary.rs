use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{error, info, warn};

use crate::balancer::primary::{BalancerCore, CoreSettings};
use crate::balancer::ready::ReadyForWorkListener;
use crate::balancer::{claim_epoch, read_heartbeat, ready_queue_for, BalancerCommand};
use crate::config::BusConfig;
use crate::endpoint::Endpoint;
use crate::error::{BalancerError, ConfigError};
use crate::message::now_nanos;
use crate::queue::{self, QueueStrategy};
use crate::storage::QueueStore;

/// Which side of the failover protocol an instance is currently playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Standby,
    Primary,
}

/// Passive standby for the load balancer. Watches the primary's heartbeat;
/// when none lands inside the liveness window, it promotes itself (a single
/// atomic transition, irreversible for the process lifetime), claims the
/// next fencing epoch, and runs the full primary loop against the same
/// queues.
pub struct SecondaryBalancer {
    promoted: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    stop_tx: crossbeam_channel::Sender<()>,
    // Held so the promoted core's command channel stays connected.
    _command_tx: crossbeam_channel::Sender<BalancerCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

struct MonitorContext {
    store: Arc<dyn QueueStore>,
    strategy: Arc<dyn QueueStrategy>,
    command_rx: crossbeam_channel::Receiver<BalancerCommand>,
    stop: Arc<AtomicBool>,
    stop_rx: crossbeam_channel::Receiver<()>,
    promoted: Arc<AtomicBool>,
    primary: Endpoint,
    instance: String,
    heartbeat_interval: Duration,
    liveness_window: Duration,
    idle_timeout: Duration,
    config: BusConfig,
}

impl SecondaryBalancer {
    pub fn start(
        config: &BusConfig,
        store: Arc<dyn QueueStore>,
    ) -> Result<Self, BalancerError> {
        config.validate()?;
        let primary_uri = config
            .balancer
            .primary
            .clone()
            .ok_or(ConfigError::MissingBalancerEndpoint)?;
        let primary = Endpoint::parse(&primary_uri)?;
        let instance = config
            .balancer
            .secondary
            .clone()
            .unwrap_or_else(|| primary_uri.clone());
        let strategy = queue::strategy_from_config(&config.transport, store.clone())?;

        let promoted = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let (command_tx, command_rx) =
            crossbeam_channel::bounded(super::COMMAND_CHANNEL_CAPACITY);

        let ctx = MonitorContext {
            store,
            strategy,
            command_rx,
            stop: stop.clone(),
            stop_rx,
            promoted: promoted.clone(),
            primary,
            instance,
            heartbeat_interval: Duration::from_millis(config.balancer.heartbeat_interval_ms),
            liveness_window: Duration::from_millis(config.balancer.liveness_window_ms),
            idle_timeout: Duration::from_millis(config.transport.idle_timeout_ms),
            config: config.clone(),
        };
        let handle = thread::Builder::new()
            .name("correio-balancer-standby".to_string())
            .spawn(move || monitor(ctx))
            .map_err(|e| BalancerError::Spawn(e.to_string()))?;

        Ok(Self {
            promoted,
            stop,
            stop_tx,
            _command_tx: command_tx,
            thread: Some(handle),
        })
    }

    pub fn role(&self) -> Role {
        if self.promoted.load(Ordering::Acquire) {
            Role::Primary
        } else {
            Role::Standby
        }
    }

    pub fn shutdown(mut self) -> Result<(), BalancerError> {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.thread.take() {
            handle.join().map_err(|_| BalancerError::ThreadPanicked)?;
        }
        Ok(())
    }
}

impl Drop for SecondaryBalancer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop.store(true, Ordering::Relaxed);
            let _ = self.stop_tx.try_send(());
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
        }
    }
}

/// The standby loop: poll the heartbeat once per heartbeat interval and
/// promote when it has gone stale past the liveness window. The window is
/// validated to exceed the interval, so a merely slow primary gets at least
/// one full extra beat before anyone moves.
fn monitor(ctx: MonitorContext) {
    info!(primary = %ctx.primary, instance = %ctx.instance, "secondary balancer standing by");
    let liveness_ns = ctx.liveness_window.as_nanos() as u64;
    // Promotion is measured from the freshest heartbeat we have observed, or
    // from standby start when none has ever been written.
    let mut last_seen = now_nanos();

    loop {
        match ctx.stop_rx.recv_timeout(ctx.heartbeat_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if ctx.stop.load(Ordering::Relaxed) {
            return;
        }

        match read_heartbeat(ctx.store.as_ref()) {
            Ok(Some(heartbeat)) => {
                if heartbeat.at > last_seen {
                    last_seen = heartbeat.at;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to read primary heartbeat");
                continue;
            }
        }

        if now_nanos().saturating_sub(last_seen) <= liveness_ns {
            continue;
        }

        // Single winner, never reset: promotion is irreversible for this
        // process even if the old primary later revives.
        if ctx
            .promoted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        warn!(
            primary = %ctx.primary,
            instance = %ctx.instance,
            "primary heartbeat stale beyond liveness window, promoting to primary"
        );
        promote(ctx);
        return;
    }
}

fn promote(ctx: MonitorContext) {
    let epoch = match claim_epoch(ctx.store.as_ref(), &ctx.instance, now_nanos()) {
        Ok(epoch) => epoch,
        Err(e) => {
            error!(error = %e, "failed to claim fencing epoch, cannot promote");
            return;
        }
    };
    if let Err(e) = ctx.strategy.ensure_queue_exists(&ctx.primary) {
        warn!(error = %e, "failed to ensure balancer queue during promotion");
    }
    let input_queue = ctx.strategy.resolve(&ctx.primary);
    let ready_queue = match ready_queue_for(&ctx.config, &ctx.strategy, &input_queue) {
        Ok(queue) => queue,
        Err(e) => {
            warn!(error = %e, "failed to resolve ready-for-work queue during promotion");
            None
        }
    };
    let listener = ReadyForWorkListener::new(ctx.store.clone(), ctx.liveness_window);
    let settings = CoreSettings {
        input_queue,
        ready_queue,
        epoch,
        heartbeat_interval: ctx.heartbeat_interval,
        idle_timeout: ctx.idle_timeout,
        instance: ctx.instance,
    };
    let mut core = BalancerCore::new(
        ctx.store,
        ctx.strategy,
        ctx.command_rx,
        listener,
        settings,
    )
    .with_stop(ctx.stop);
    core.run();
}
