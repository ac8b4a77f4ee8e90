mod error_action;
mod pipeline;
mod txn;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BusConfig, TransportConfig};
use crate::crypto::EncryptionService;
use crate::endpoint::{Endpoint, EndpointRouter, Route, StaticRouter};
use crate::error::{ConfigError, DispatchError, TransportError, TransportResult};
use crate::message::{control, headers, Message};
use crate::queue::{self, PhysicalQueue, QueueStrategy};
use crate::serializer::{JsonSerializer, MessageSerializer};
use crate::storage::QueueStore;
use crate::subscription::{RocksDbSubscriptionStore, SubscriptionStorage};

pub use error_action::{ErrorAction, FailureDisposition, FailureKind};
pub use pipeline::{DeliveryContext, SubscriptionAction, TransportAction, TransportPipeline};
pub use txn::QueueTransaction;

/// The business layer: receives the decoded payload of every message the
/// pipeline declined. A returned error is counted against the message's
/// retry budget.
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, message: &Message, body: &Value) -> Result<(), DispatchError>;
}

/// Pluggable collaborators for [`Transport::with_options`]. The defaults are
/// what the container wires for a plain endpoint: JSON serialization, no
/// encryption, host-matching routing, the durable subscription store, and a
/// pipeline of the error action plus subscription handling.
pub struct TransportOptions {
    pub serializer: Arc<dyn MessageSerializer>,
    pub encryption: Option<Arc<dyn EncryptionService>>,
    pub router: Option<Arc<dyn EndpointRouter>>,
    pub subscriptions: Option<Arc<dyn SubscriptionStorage>>,
    /// Extra pipeline stages, appended after the built-in ones.
    pub actions: Vec<Box<dyn TransportAction>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            serializer: Arc::new(JsonSerializer),
            encryption: None,
            router: None,
            subscriptions: None,
            actions: Vec::new(),
        }
    }
}

/// Transactional message movement between endpoints.
///
/// Owns a pool of worker threads that dequeue from the local physical queue,
/// run the action pipeline plus business dispatch, and commit or roll back
/// the queue transaction on the combined outcome. Outbound sends enqueue
/// atomically within the caller's ambient transaction when one is given.
pub struct Transport {
    config: TransportConfig,
    store: Arc<dyn QueueStore>,
    strategy: Arc<dyn QueueStrategy>,
    serializer: Arc<dyn MessageSerializer>,
    encryption: Option<Arc<dyn EncryptionService>>,
    subscriptions: Arc<dyn SubscriptionStorage>,
    router: Arc<dyn EndpointRouter>,
    pipeline: TransportPipeline,
    error_action: Arc<ErrorAction>,
    dispatcher: Arc<dyn MessageDispatcher>,
    claims: Arc<DashSet<Uuid>>,
    ensured: DashSet<String>,
    local: Endpoint,
    local_queue: PhysicalQueue,
    ready_endpoint: Option<Endpoint>,
    shutting_down: AtomicBool,
    wakeup_tx: crossbeam_channel::Sender<()>,
    wakeup_rx: crossbeam_channel::Receiver<()>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Transport {
    pub fn new(
        config: BusConfig,
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_options(config, store, dispatcher, TransportOptions::default())
    }

    pub fn with_options(
        config: BusConfig,
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<dyn MessageDispatcher>,
        options: TransportOptions,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let local = config.local_endpoint()?;
        let strategy = queue::strategy_from_config(&config.transport, store.clone())?;
        let local_queue = strategy.resolve(&local);

        if config.transport.encryption_key.is_some() && options.encryption.is_none() {
            warn!("encryption_key configured but no encryption service wired in");
        }

        let subscriptions = options
            .subscriptions
            .unwrap_or_else(|| Arc::new(RocksDbSubscriptionStore::new(store.clone())));
        let router = options
            .router
            .unwrap_or_else(|| Arc::new(StaticRouter::new(local.host())));

        let error_action = Arc::new(ErrorAction::new(config.transport.max_retries));
        let mut actions: Vec<Box<dyn TransportAction>> = vec![
            Box::new(error_action.clone()),
            Box::new(SubscriptionAction::new(subscriptions.clone())),
        ];
        actions.extend(options.actions);

        let ready_endpoint = match &config.balancer.ready_for_work {
            Some(uri) => {
                let endpoint = Endpoint::parse(uri)?;
                // The balancer's own transport must not announce to itself.
                (endpoint != local).then_some(endpoint)
            }
            None => None,
        };

        let (wakeup_tx, wakeup_rx) = crossbeam_channel::bounded(config.transport.worker_count);

        Ok(Arc::new(Self {
            config: config.transport,
            store,
            strategy,
            serializer: options.serializer,
            encryption: options.encryption,
            subscriptions,
            router,
            pipeline: TransportPipeline::new(actions),
            error_action,
            dispatcher,
            claims: Arc::new(DashSet::new()),
            ensured: DashSet::new(),
            local,
            local_queue,
            ready_endpoint,
            shutting_down: AtomicBool::new(false),
            wakeup_tx,
            wakeup_rx,
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn local_queue(&self) -> &PhysicalQueue {
        &self.local_queue
    }

    pub fn error_action(&self) -> &ErrorAction {
        &self.error_action
    }

    pub fn subscriptions(&self) -> &dyn SubscriptionStorage {
        self.subscriptions.as_ref()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Open an ambient transaction for a batch of sends.
    pub fn begin(&self) -> QueueTransaction {
        QueueTransaction::new(self.store.clone(), self.claims.clone())
    }

    /// Enqueue to the destination endpoint in a transaction of its own.
    pub fn send(&self, message: Message) -> TransportResult<()> {
        if self.is_shutting_down() {
            return Err(TransportError::ShuttingDown);
        }
        let mut txn = self.begin();
        self.stage_send(&mut txn, message)?;
        txn.commit()?;
        self.wake();
        Ok(())
    }

    /// Enqueue within the caller's ambient transaction; committed or rolled
    /// back with it. With `transactional = false` the ambient transaction is
    /// ignored and the enqueue commits immediately.
    pub fn send_in(&self, txn: &mut QueueTransaction, message: Message) -> TransportResult<()> {
        if !self.config.transactional {
            return self.send(message);
        }
        if self.is_shutting_down() {
            return Err(TransportError::ShuttingDown);
        }
        self.stage_send(txn, message)
    }

    /// Fan out one copy per subscriber of `message_type`, atomically.
    /// Returns the number of copies sent; zero subscribers is a no-op.
    pub fn publish(&self, message_type: &str, message: Message) -> TransportResult<usize> {
        if self.is_shutting_down() {
            return Err(TransportError::ShuttingDown);
        }
        let subscribers = self.subscriptions.subscribers(message_type)?;
        if subscribers.is_empty() {
            debug!(%message_type, "publish with no subscribers");
            return Ok(0);
        }
        let mut txn = self.begin();
        for subscriber in &subscribers {
            let mut copy = message.clone();
            copy.id = Uuid::new_v4();
            copy.destination = subscriber.clone();
            copy.set_message_type(message_type);
            copy.headers
                .set(headers::CORRELATION_ID, message.id.to_string());
            self.stage_send(&mut txn, copy)?;
        }
        txn.commit()?;
        self.wake();
        debug!(%message_type, count = subscribers.len(), "published to subscribers");
        Ok(subscribers.len())
    }

    /// Ask `publisher` to add this endpoint as a subscriber of `message_type`.
    pub fn subscribe(&self, message_type: &str, publisher: &Endpoint) -> TransportResult<()> {
        self.send_control(publisher, control::SUBSCRIBE, message_type)
    }

    /// Ask `publisher` to drop this endpoint's subscription to `message_type`.
    pub fn unsubscribe(&self, message_type: &str, publisher: &Endpoint) -> TransportResult<()> {
        self.send_control(publisher, control::UNSUBSCRIBE, message_type)
    }

    fn send_control(
        &self,
        publisher: &Endpoint,
        control_type: &str,
        message_type: &str,
    ) -> TransportResult<()> {
        let mut msg = Message::new(self.local.clone(), publisher.clone(), Vec::new());
        msg.set_message_type(control_type);
        msg.headers.set(headers::SUBSCRIPTION_TYPE, message_type);
        self.send(msg)
    }

    /// Spawn the worker pool. The local queue is created first, so a fresh
    /// endpoint is ready to receive before the first worker scans it.
    pub fn start(self: &Arc<Self>) -> TransportResult<()> {
        self.strategy.ensure_queue_exists(&self.local)?;
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        for index in 0..self.config.worker_count {
            let transport = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("correio-worker-{index}"))
                .spawn(move || worker::run(transport, index))
                .map_err(|e| TransportError::WorkerSpawn(e.to_string()))?;
            workers.push(handle);
        }
        info!(
            endpoint = %self.local,
            workers = self.config.worker_count,
            "transport started"
        );
        Ok(())
    }

    /// Raise the shutdown flag, wake parked workers, and wait for each to
    /// finish or roll back its current transaction.
    pub fn shutdown(&self) -> TransportResult<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(endpoint = %self.local, "initiating transport shutdown");
        let handles = std::mem::take(&mut *self.workers.lock().expect("worker registry poisoned"));
        for _ in &handles {
            let _ = self.wakeup_tx.try_send(());
        }
        for handle in handles {
            let _ = handle.join();
        }
        self.store.flush().map_err(TransportError::from)?;
        info!(endpoint = %self.local, "transport shutdown complete");
        Ok(())
    }

    fn stage_send(&self, txn: &mut QueueTransaction, mut message: Message) -> TransportResult<()> {
        if message.is_encrypted() {
            let service = self
                .encryption
                .as_ref()
                .ok_or(TransportError::EncryptionKeyMissing)?;
            message.payload = service.encrypt(&message.payload);
        }
        let destination = message.destination.clone();
        self.ensure_endpoint(&destination)?;
        let queue = self.strategy.resolve(&destination);
        txn.stage_enqueue(&queue, &message)?;
        debug!(msg_id = %message.id, destination = %destination, "message staged for send");
        Ok(())
    }

    /// Lazily create the backing queue of a locally routed endpoint, once.
    fn ensure_endpoint(&self, endpoint: &Endpoint) -> TransportResult<()> {
        if !matches!(self.router.route(endpoint), Route::Local) {
            return Ok(());
        }
        if self.ensured.insert(endpoint.uri().to_string()) {
            if let Err(e) = self.strategy.ensure_queue_exists(endpoint) {
                self.ensured.remove(endpoint.uri());
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn wake(&self) {
        let _ = self.wakeup_tx.try_send(());
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Best-effort stop if the container never called shutdown.
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            let handles = match self.workers.lock() {
                Ok(mut workers) => std::mem::take(&mut *workers),
                Err(_) => return,
            };
            for _ in &handles {
                let _ = self.wakeup_tx.try_send(());
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}
