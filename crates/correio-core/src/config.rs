use serde::Deserialize;

use crate::endpoint::Endpoint;
use crate::error::ConfigError;

/// Top-level bus configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub transport: TransportConfig,
    pub balancer: BalancerConfig,
}

/// Transport configuration: local endpoint, worker pool, retry budget and
/// transactional behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// This process's logical endpoint (`scheme://host/queue`). Required.
    pub endpoint: String,
    /// Number of worker threads running the receive loop.
    pub worker_count: usize,
    /// Delivery failures tolerated before a message is dead-lettered.
    pub max_retries: u32,
    /// When false, `send_in` ignores the ambient transaction and commits
    /// each enqueue immediately.
    pub transactional: bool,
    /// When false, the dequeue commits as soon as a message is claimed and
    /// failures are handled purely by the retry pipeline's re-enqueue.
    pub consume_in_transaction: bool,
    pub isolation: IsolationLevel,
    pub queue_strategy: QueueStrategyKind,
    /// The shared physical queue name. Required iff `queue_strategy = "subqueue"`.
    pub shared_queue: Option<String>,
    /// Optional key material handed to the container's encryption service.
    /// Absence disables encryption; messages marked for encryption then fail
    /// fast at send.
    pub encryption_key: Option<String>,
    /// How long an idle worker parks before re-scanning its queue.
    pub idle_timeout_ms: u64,
}

/// Load-balancer endpoints and failover timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// The primary balancer's endpoint; also the queue promoted secondaries
    /// assign from.
    pub primary: Option<String>,
    /// The standby instance's own endpoint, recorded in its heartbeats after
    /// promotion.
    pub secondary: Option<String>,
    /// Where transport workers announce spare capacity.
    pub ready_for_work: Option<String>,
    pub heartbeat_interval_ms: u64,
    /// How long the heartbeat may go unrenewed before the standby promotes
    /// itself, and before a ready-worker entry is considered stale. Must
    /// exceed `heartbeat_interval_ms`.
    pub liveness_window_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    /// Commits additionally fsync the storage WAL.
    Serializable,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStrategyKind {
    /// One dedicated physical queue per endpoint.
    #[default]
    Flat,
    /// One shared physical queue partitioned by per-endpoint subqueues.
    Subqueue,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            worker_count: 4,
            max_retries: 5,
            transactional: true,
            consume_in_transaction: true,
            isolation: IsolationLevel::ReadCommitted,
            queue_strategy: QueueStrategyKind::Flat,
            shared_queue: None,
            encryption_key: None,
            idle_timeout_ms: 100,
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            primary: None,
            secondary: None,
            ready_for_work: None,
            heartbeat_interval_ms: 500,
            liveness_window_ms: 2000,
        }
    }
}

impl BusConfig {
    /// Validate the whole configuration. Any error here is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        Endpoint::parse(&self.transport.endpoint)?;
        if self.transport.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.transport.queue_strategy == QueueStrategyKind::Subqueue
            && self
                .transport
                .shared_queue
                .as_deref()
                .map_or(true, str::is_empty)
        {
            return Err(ConfigError::SharedQueueMissing);
        }
        for uri in [
            &self.balancer.primary,
            &self.balancer.secondary,
            &self.balancer.ready_for_work,
        ]
        .into_iter()
        .flatten()
        {
            Endpoint::parse(uri)?;
        }
        if self.balancer.liveness_window_ms <= self.balancer.heartbeat_interval_ms {
            return Err(ConfigError::LivenessWindowTooShort {
                window: self.balancer.liveness_window_ms,
                interval: self.balancer.heartbeat_interval_ms,
            });
        }
        Ok(())
    }

    /// The validated local endpoint.
    pub fn local_endpoint(&self) -> Result<Endpoint, ConfigError> {
        if self.transport.endpoint.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        Endpoint::parse(&self.transport.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> BusConfig {
        let mut config = BusConfig::default();
        config.transport.endpoint = "correio://localhost/orders".to_string();
        config
    }

    #[test]
    fn default_config_values() {
        let config = BusConfig::default();
        assert_eq!(config.transport.worker_count, 4);
        assert_eq!(config.transport.max_retries, 5);
        assert!(config.transport.transactional);
        assert!(config.transport.consume_in_transaction);
        assert_eq!(config.transport.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.transport.queue_strategy, QueueStrategyKind::Flat);
        assert_eq!(config.balancer.heartbeat_interval_ms, 500);
        assert_eq!(config.balancer.liveness_window_ms, 2000);
    }

    #[test]
    fn toml_parsing_with_overrides() {
        let toml_str = r#"
            [transport]
            endpoint = "correio://localhost/orders"
            worker_count = 8
            max_retries = 2
            isolation = "serializable"
            queue_strategy = "subqueue"
            shared_queue = "bus"

            [balancer]
            primary = "correio://localhost/balancer"
            heartbeat_interval_ms = 100
            liveness_window_ms = 400
        "#;
        let config: BusConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transport.worker_count, 8);
        assert_eq!(config.transport.max_retries, 2);
        assert_eq!(config.transport.isolation, IsolationLevel::Serializable);
        assert_eq!(config.transport.queue_strategy, QueueStrategyKind::Subqueue);
        assert_eq!(config.transport.shared_queue.as_deref(), Some("bus"));
        assert_eq!(
            config.balancer.primary.as_deref(),
            Some("correio://localhost/balancer")
        );
        config.validate().unwrap();
    }

    #[test]
    fn toml_parsing_empty_uses_defaults() {
        let config: BusConfig = toml::from_str("").unwrap();
        assert_eq!(config.transport.worker_count, 4);
        assert_eq!(config.transport.idle_timeout_ms, 100);
    }

    #[test]
    fn validate_rejects_empty_endpoint() {
        let config = BusConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyEndpoint)
        ));
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = valid();
        config.transport.worker_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NoWorkers)));
    }

    #[test]
    fn validate_rejects_subqueue_without_shared_queue() {
        let mut config = valid();
        config.transport.queue_strategy = QueueStrategyKind::Subqueue;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedQueueMissing)
        ));
    }

    #[test]
    fn validate_rejects_liveness_window_not_exceeding_heartbeat() {
        let mut config = valid();
        config.balancer.heartbeat_interval_ms = 500;
        config.balancer.liveness_window_ms = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LivenessWindowTooShort { .. })
        ));
    }

    #[test]
    fn validate_rejects_malformed_balancer_endpoint() {
        let mut config = valid();
        config.balancer.primary = Some("not-a-uri".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }
}
