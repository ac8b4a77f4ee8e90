pub mod keys;
mod rocksdb;
mod traits;

pub use rocksdb::RocksDbQueueStore;
pub use traits::{QueueStore, WriteBatchOp};
