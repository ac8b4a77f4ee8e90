#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use correio_core::{
    BusConfig, DispatchError, Endpoint, EncryptionService, Message, MessageDispatcher,
    QueueStore, RocksDbQueueStore, TransportError,
};
use serde_json::Value;

/// Enable log output for a test run with `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn open_store(dir: &tempfile::TempDir) -> Arc<dyn QueueStore> {
    Arc::new(RocksDbQueueStore::open(dir.path()).unwrap())
}

pub fn endpoint(name: &str) -> Endpoint {
    Endpoint::parse(&format!("correio://localhost/{name}")).unwrap()
}

/// A config with fast timings for tests: 2 workers, 10ms idle scans.
pub fn bus_config(endpoint_name: &str) -> BusConfig {
    let mut config = BusConfig::default();
    config.transport.endpoint = format!("correio://localhost/{endpoint_name}");
    config.transport.worker_count = 2;
    config.transport.idle_timeout_ms = 10;
    config
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Dispatcher that fails the first `fail_times` dispatches, then succeeds,
/// recording every delivered message.
pub struct ScriptedDispatcher {
    fail_times: u32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<Message>>,
}

impl ScriptedDispatcher {
    pub fn succeeding() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(fail_times: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_times,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    /// Total dispatch attempts, failed and successful.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl MessageDispatcher for ScriptedDispatcher {
    fn dispatch(&self, message: &Message, _body: &Value) -> Result<(), DispatchError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_times {
            return Err(DispatchError("simulated handler failure".to_string()));
        }
        self.delivered.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Toy keyed cipher for the encryption tests: XOR with a repeating key and a
/// marker byte so decryption of unsealed bytes fails loudly.
pub struct XorEncryption {
    key: Vec<u8>,
}

impl XorEncryption {
    pub fn new(key: &[u8]) -> Arc<dyn EncryptionService> {
        Arc::new(Self { key: key.to_vec() })
    }

    fn xor(&self, bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl EncryptionService for XorEncryption {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut sealed = vec![0xEE];
        sealed.extend(self.xor(plain));
        sealed
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, TransportError> {
        match sealed.split_first() {
            Some((0xEE, rest)) => Ok(self.xor(rest)),
            _ => Err(TransportError::Crypto("missing seal marker".to_string())),
        }
    }
}
