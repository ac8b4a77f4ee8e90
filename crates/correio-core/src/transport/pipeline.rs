use std::sync::Arc;

use tracing::{info, warn};

use crate::error::TransportResult;
use crate::message::{control, headers, Message};
use crate::queue::PhysicalQueue;
use crate::storage::QueueStore;
use crate::subscription::SubscriptionStorage;
use crate::transport::txn::QueueTransaction;

/// Everything a pipeline stage may need about the message being delivered:
/// the stored envelope, where it was dequeued from, and its storage key.
pub struct DeliveryContext<'a> {
    pub message: &'a Message,
    pub source: &'a PhysicalQueue,
    pub storage_key: &'a [u8],
    pub store: &'a dyn QueueStore,
}

/// One stage of the receive pipeline, invoked per dequeued message before
/// business dispatch. Returning `Ok(true)` consumes the message: later
/// stages and business dispatch are skipped, and the transaction commits.
pub trait TransportAction: Send + Sync {
    fn try_handle(
        &self,
        delivery: &DeliveryContext<'_>,
        txn: &mut QueueTransaction,
    ) -> TransportResult<bool>;
}

/// Ordered chain of actions, composed once at startup.
pub struct TransportPipeline {
    actions: Vec<Box<dyn TransportAction>>,
}

impl TransportPipeline {
    pub fn new(actions: Vec<Box<dyn TransportAction>>) -> Self {
        Self { actions }
    }

    /// Run the chain. The first action to return `true` wins.
    pub(crate) fn run(
        &self,
        delivery: &DeliveryContext<'_>,
        txn: &mut QueueTransaction,
    ) -> TransportResult<bool> {
        for action in &self.actions {
            if action.try_handle(delivery, txn)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Pipeline stage consuming subscribe/unsubscribe control messages into the
/// durable subscription store. The sender's endpoint is the subscriber.
pub struct SubscriptionAction {
    subscriptions: Arc<dyn SubscriptionStorage>,
}

impl SubscriptionAction {
    pub fn new(subscriptions: Arc<dyn SubscriptionStorage>) -> Self {
        Self { subscriptions }
    }
}

impl TransportAction for SubscriptionAction {
    fn try_handle(
        &self,
        delivery: &DeliveryContext<'_>,
        _txn: &mut QueueTransaction,
    ) -> TransportResult<bool> {
        let message = delivery.message;
        let message_type = match message.message_type() {
            Some(t) if t == control::SUBSCRIBE || t == control::UNSUBSCRIBE => t,
            _ => return Ok(false),
        };
        let Some(subscription_type) = message.headers.get(headers::SUBSCRIPTION_TYPE) else {
            // Malformed control message: consume it, there is nothing to retry.
            warn!(msg_id = %message.id, %message_type, "control message without subscription type");
            return Ok(true);
        };
        if message_type == control::SUBSCRIBE {
            self.subscriptions
                .subscribe(subscription_type, &message.source)?;
            info!(%subscription_type, subscriber = %message.source, "subscription added");
        } else {
            self.subscriptions
                .unsubscribe(subscription_type, &message.source)?;
            info!(%subscription_type, subscriber = %message.source, "subscription removed");
        }
        Ok(true)
    }
}
