// cke-storage: the Kv seam, its etcd and in-memory backends, and the typed Storage accessor.

pub mod etcd;
pub mod kv;
pub mod memory;
pub mod storage;

pub use etcd::EtcdKv;
pub use kv::{Condition, KeyValue, Kv, LeaderKey, TxnOp, WatchEvent};
pub use memory::MemoryKv;
pub use storage::Storage;
