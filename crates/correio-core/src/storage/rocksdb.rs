use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};

use crate::config::IsolationLevel;
use crate::error::{StorageError, StorageResult};
use crate::message::Message;
use crate::queue::QueueRecord;
use crate::storage::traits::{QueueStore, WriteBatchOp};

const CF_MESSAGES: &str = "messages";
const CF_QUEUES: &str = "queues";
const CF_SUBSCRIPTIONS: &str = "subscriptions";
const CF_STATE: &str = "state";

/// All column family names (excluding `default`, which RocksDB always has).
const COLUMN_FAMILIES: &[&str] = &[CF_MESSAGES, CF_QUEUES, CF_SUBSCRIPTIONS, CF_STATE];

type DB = DBWithThreadMode<MultiThreaded>;

/// RocksDB-backed queue store. One database holds the physical queues, the
/// queue records, the durable subscriptions, and the shared balancer state.
pub struct RocksDbQueueStore {
    db: DB,
    /// Serializable isolation fsyncs the WAL on every commit.
    sync_writes: bool,
}

impl RocksDbQueueStore {
    /// Open or create a database at the given path with read-committed
    /// isolation.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with(path, IsolationLevel::ReadCommitted)
    }

    /// Open or create a database with the configured isolation level.
    pub fn open_with(path: impl AsRef<Path>, isolation: IsolationLevel) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self {
            db,
            sync_writes: isolation == IsolationLevel::Serializable,
        })
    }

    fn cf(&self, name: &str) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {name}")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn scan(
        &self,
        cf_name: &str,
        prefix: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key.to_vec(), value.to_vec()));
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }
}

impl QueueStore for RocksDbQueueStore {
    fn put_message(&self, key: &[u8], message: &Message) -> StorageResult<()> {
        let value = serde_json::to_vec(message)?;
        self.db
            .put_cf_opt(&self.cf(CF_MESSAGES)?, key, &value, &self.write_opts())?;
        Ok(())
    }

    fn get_message(&self, key: &[u8]) -> StorageResult<Option<Message>> {
        match self.db.get_cf(&self.cf(CF_MESSAGES)?, key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn delete_message(&self, key: &[u8]) -> StorageResult<()> {
        self.db
            .delete_cf_opt(&self.cf(CF_MESSAGES)?, key, &self.write_opts())?;
        Ok(())
    }

    fn list_messages(
        &self,
        prefix: &[u8],
        limit: usize,
    ) -> StorageResult<Vec<(Vec<u8>, Message)>> {
        self.scan(CF_MESSAGES, prefix, limit)?
            .into_iter()
            .map(|(key, value)| Ok((key, serde_json::from_slice(&value)?)))
            .collect()
    }

    fn put_queue(&self, name: &str, record: &QueueRecord) -> StorageResult<()> {
        let value = serde_json::to_vec(record)?;
        self.db.put_cf_opt(
            &self.cf(CF_QUEUES)?,
            name.as_bytes(),
            &value,
            &self.write_opts(),
        )?;
        Ok(())
    }

    fn get_queue(&self, name: &str) -> StorageResult<Option<QueueRecord>> {
        match self.db.get_cf(&self.cf(CF_QUEUES)?, name.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn list_queues(&self) -> StorageResult<Vec<QueueRecord>> {
        let cf = self.cf(CF_QUEUES)?;
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        let mut records = Vec::new();
        for item in iter {
            let (_, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    fn put_subscription(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.db
            .put_cf_opt(&self.cf(CF_SUBSCRIPTIONS)?, key, value, &self.write_opts())?;
        Ok(())
    }

    fn delete_subscription(&self, key: &[u8]) -> StorageResult<()> {
        self.db
            .delete_cf_opt(&self.cf(CF_SUBSCRIPTIONS)?, key, &self.write_opts())?;
        Ok(())
    }

    fn list_subscriptions(&self, prefix: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self
            .scan(CF_SUBSCRIPTIONS, prefix, usize::MAX)?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    fn put_state(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.db.put_cf_opt(
            &self.cf(CF_STATE)?,
            key.as_bytes(),
            value,
            &self.write_opts(),
        )?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.db.get_cf(&self.cf(CF_STATE)?, key.as_bytes())?)
    }

    fn delete_state(&self, key: &str) -> StorageResult<()> {
        self.db
            .delete_cf_opt(&self.cf(CF_STATE)?, key.as_bytes(), &self.write_opts())?;
        Ok(())
    }

    fn list_state(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.scan(CF_STATE, prefix.as_bytes(), usize::MAX)?
            .into_iter()
            .map(|(key, value)| {
                let key = String::from_utf8(key)
                    .map_err(|e| StorageError::Encoding(format!("non-utf8 state key: {e}")))?;
                Ok((key, value))
            })
            .collect()
    }

    fn write_batch(&self, ops: Vec<WriteBatchOp>) -> StorageResult<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteBatchOp::PutMessage { key, value } => {
                    batch.put_cf(&self.cf(CF_MESSAGES)?, key, value);
                }
                WriteBatchOp::DeleteMessage { key } => {
                    batch.delete_cf(&self.cf(CF_MESSAGES)?, key);
                }
                WriteBatchOp::PutQueue { name, value } => {
                    batch.put_cf(&self.cf(CF_QUEUES)?, name.as_bytes(), value);
                }
                WriteBatchOp::PutSubscription { key, value } => {
                    batch.put_cf(&self.cf(CF_SUBSCRIPTIONS)?, key, value);
                }
                WriteBatchOp::DeleteSubscription { key } => {
                    batch.delete_cf(&self.cf(CF_SUBSCRIPTIONS)?, key);
                }
                WriteBatchOp::PutState { key, value } => {
                    batch.put_cf(&self.cf(CF_STATE)?, key.as_bytes(), value);
                }
                WriteBatchOp::DeleteState { key } => {
                    batch.delete_cf(&self.cf(CF_STATE)?, key.as_bytes());
                }
            }
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
