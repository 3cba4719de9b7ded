pub mod pool;
pub mod sink;
pub mod store;

pub use pool::{ConnectionFactory, PoolConfig, PoolStats, PooledConnection, ResourcePool};
pub use sink::{PooledRecordSink, RecordSink};
pub use store::{RestStore, RestStoreFactory, StoreClient};
