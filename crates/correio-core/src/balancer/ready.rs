use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::endpoint::Endpoint;
use crate::error::StorageResult;
use crate::storage::{keys, QueueStore};

/// One worker's announced spare capacity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadyWorkerEntry {
    pub worker: Endpoint,
    pub capacity: u32,
    pub registered_at: u64,
    pub renewed_at: u64,
}

/// The ready-for-work table: which workers have announced spare capacity,
/// and how much of it is left.
///
/// Entries are renewed by announcements and drained by assignment. An entry
/// with no renewal inside the liveness window is excluded from acquisition
/// and purged lazily; a stale-but-unpurged entry simply yields no further
/// assignments. The table is written through to durable state so a restarted
/// balancer resumes with the last-known capacity.
pub struct ReadyForWorkListener {
    entries: DashMap<String, ReadyWorkerEntry>,
    store: Arc<dyn QueueStore>,
    liveness_window_ns: u64,
}

impl ReadyForWorkListener {
    pub fn new(store: Arc<dyn QueueStore>, liveness_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            liveness_window_ns: liveness_window.as_nanos() as u64,
        }
    }

    /// Restore persisted entries from the state column family.
    pub fn load(&self) -> StorageResult<usize> {
        for (key, value) in self.store.list_state(keys::WORKER_PREFIX)? {
            match serde_json::from_slice::<ReadyWorkerEntry>(&value) {
                Ok(entry) => {
                    self.entries
                        .insert(entry.worker.uri().to_string(), entry);
                }
                Err(e) => warn!(%key, error = %e, "skipping corrupt ready-worker entry"),
            }
        }
        Ok(self.entries.len())
    }

    /// Upsert a worker's capacity and refresh its renewal timestamp.
    /// A live entry accumulates the announced amount; a stale entry is
    /// replaced by it, since whatever capacity it once had is unaccounted.
    pub fn announce(&self, worker: Endpoint, capacity: u32, now: u64) -> StorageResult<()> {
        let uri = worker.uri().to_string();
        let snapshot = match self.entries.entry(uri) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if self.is_live(entry, now) {
                    entry.capacity = entry.capacity.saturating_add(capacity);
                } else {
                    entry.capacity = capacity;
                    entry.registered_at = now;
                }
                entry.renewed_at = now;
                entry.clone()
            }
            Entry::Vacant(vacant) => vacant
                .insert(ReadyWorkerEntry {
                    worker,
                    capacity,
                    registered_at: now,
                    renewed_at: now,
                })
                .clone(),
        };
        self.persist(&snapshot)
    }

    /// Take one slot from the live worker with the highest capacity, ties
    /// broken by earliest registration to favor long-standing workers.
    pub fn acquire(&self, now: u64) -> Option<Endpoint> {
        loop {
            let best = self
                .entries
                .iter()
                .filter(|e| self.is_live(e.value(), now) && e.value().capacity > 0)
                .max_by(|a, b| {
                    a.value()
                        .capacity
                        .cmp(&b.value().capacity)
                        .then(b.value().registered_at.cmp(&a.value().registered_at))
                })
                .map(|e| e.key().clone())?;

            if let Some(mut entry) = self.entries.get_mut(&best) {
                if self.is_live(&entry, now) && entry.capacity > 0 {
                    entry.capacity -= 1;
                    let snapshot = entry.clone();
                    drop(entry);
                    if let Err(e) = self.persist(&snapshot) {
                        warn!(worker = %snapshot.worker, error = %e, "failed to persist capacity decrement");
                    }
                    return Some(snapshot.worker);
                }
            }
            // Raced with a concurrent update on the chosen entry; rescan.
        }
    }

    /// Drop entries whose renewal is outside the liveness window.
    pub fn purge_stale(&self, now: u64) {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !self.is_live(e.value(), now))
            .map(|e| e.key().clone())
            .collect();
        for uri in stale {
            self.entries.remove(&uri);
            if let Err(e) = self.store.delete_state(&keys::worker_state_key(&uri)) {
                warn!(worker = %uri, error = %e, "failed to purge stale worker entry");
            }
        }
    }

    /// Total capacity across live entries.
    pub fn live_capacity(&self, now: u64) -> u32 {
        self.entries
            .iter()
            .filter(|e| self.is_live(e.value(), now))
            .map(|e| e.value().capacity)
            .sum()
    }

    pub fn worker_count(&self) -> usize {
        self.entries.len()
    }

    fn is_live(&self, entry: &ReadyWorkerEntry, now: u64) -> bool {
        now.saturating_sub(entry.renewed_at) <= self.liveness_window_ns
    }

    fn persist(&self, entry: &ReadyWorkerEntry) -> StorageResult<()> {
        let key = keys::worker_state_key(entry.worker.uri());
        let value = serde_json::to_vec(entry)?;
        self.store.put_state(&key, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::now_nanos;
    use crate::storage::RocksDbQueueStore;

    fn listener() -> (ReadyForWorkListener, Arc<dyn QueueStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(RocksDbQueueStore::open(dir.path()).unwrap());
        (
            ReadyForWorkListener::new(store.clone(), Duration::from_secs(10)),
            store,
            dir,
        )
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::parse(&format!("correio://localhost/{name}")).unwrap()
    }

    #[test]
    fn acquire_prefers_highest_capacity() {
        let (listener, _store, _dir) = listener();
        listener.announce(endpoint("small"), 1, now_nanos()).unwrap();
        listener.announce(endpoint("big"), 5, now_nanos()).unwrap();

        assert_eq!(listener.acquire(now_nanos()), Some(endpoint("big")));
    }

    #[test]
    fn capacity_ties_break_by_earliest_registration() {
        let (listener, _store, _dir) = listener();
        listener.announce(endpoint("old"), 2, 1_000).unwrap();
        listener.announce(endpoint("young"), 2, 2_000).unwrap();

        assert_eq!(listener.acquire(3_000), Some(endpoint("old")));
    }

    #[test]
    fn never_assigns_beyond_announced_capacity() {
        let (listener, _store, _dir) = listener();
        let now = now_nanos();
        listener.announce(endpoint("a"), 1, now).unwrap();
        listener.announce(endpoint("b"), 1, now).unwrap();

        let first = listener.acquire(now).unwrap();
        let second = listener.acquire(now).unwrap();
        assert_ne!(first, second, "each worker has exactly one slot");
        assert_eq!(listener.acquire(now), None, "no third slot exists");
    }

    #[test]
    fn live_announcements_accumulate() {
        let (listener, _store, _dir) = listener();
        let now = now_nanos();
        listener.announce(endpoint("a"), 1, now).unwrap();
        listener.announce(endpoint("a"), 1, now + 1).unwrap();
        assert_eq!(listener.live_capacity(now + 1), 2);
    }

    #[test]
    fn stale_entries_are_excluded_and_reset_on_renewal() {
        let (listener, _store, _dir) = listener();
        let window = Duration::from_secs(10).as_nanos() as u64;
        listener.announce(endpoint("a"), 5, 1_000).unwrap();

        let later = 1_000 + window + 1;
        assert_eq!(listener.acquire(later), None, "stale entry must not serve");
        assert_eq!(listener.live_capacity(later), 0);

        // Renewal after staleness replaces the unaccounted capacity.
        listener.announce(endpoint("a"), 1, later).unwrap();
        assert_eq!(listener.live_capacity(later), 1);
    }

    #[test]
    fn purge_drops_stale_entries() {
        let (listener, _store, _dir) = listener();
        let window = Duration::from_secs(10).as_nanos() as u64;
        listener.announce(endpoint("a"), 1, 1_000).unwrap();
        listener.announce(endpoint("b"), 1, 1_000 + window).unwrap();

        listener.purge_stale(1_000 + window + 1);
        assert_eq!(listener.worker_count(), 1);
    }

    #[test]
    fn table_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn QueueStore> = Arc::new(RocksDbQueueStore::open(dir.path()).unwrap());
        let now = now_nanos();
        {
            let listener = ReadyForWorkListener::new(store.clone(), Duration::from_secs(10));
            listener.announce(endpoint("a"), 3, now).unwrap();
        }
        let listener = ReadyForWorkListener::new(store, Duration::from_secs(10));
        assert_eq!(listener.load().unwrap(), 1);
        assert_eq!(listener.live_capacity(now), 3);
    }
}
