/// Shardgate - a failure-tolerant query router for sharded document stores
///
/// The router sits in front of independently failing shards:
/// 1. The partition directory maps each collection and key range to the
///    shard that owns it, from an immutable snapshot refreshed from a
///    metadata store
/// 2. The connection pool gives every client session its own connection to
///    each shard, opened lazily and reopened on the first use after a fault
/// 3. The operation router fans reads out to every owning shard and returns
///    partial results when some of them fail, and sends each write to its one
///    owner
/// 4. Write acknowledgment is asked for separately and reported as success,
///    an explicit error or an unknown outcome
pub mod config;
pub mod core;
pub mod directory;
pub mod error;
pub mod health;
pub mod router;
pub mod transport;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::ack::WriteOutcome;
pub use crate::core::session::Session;
pub use crate::core::{Document, Filter, KeyBound, KeyRange, ShardId, ShardInfo};
pub use crate::directory::metadata::{ClusterMetadata, InMemoryMetadataStore, MetadataStore};
pub use crate::directory::{PartitionDirectory, PartitionMap};
pub use crate::error::{RouterError, RouterResult};
pub use crate::health::{FailureDetector, HealthStatus};
pub use crate::router::{PartialResult, Router, ShardFailure};
pub use crate::transport::memory::MemoryCluster;
pub use crate::transport::tcp::{ShardServer, TcpShardConnector};
