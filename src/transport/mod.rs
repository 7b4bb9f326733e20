/// Shard transports
///
/// The router talks to shards only through [`ShardConnector`] and
/// [`ShardLink`]. A link carries three kinds of request:
/// - `find`: a read that returns documents or a shard-side error
/// - `insert`: a write that is handed off without waiting for a reply
/// - `last_write`: a separate request asking how the previous insert on the
///   same link ended
///
/// Because the outcome query is its own round trip, it can fail even when the
/// insert reached the shard. That is where unknown write outcomes come from.
pub mod codec;
pub mod memory;
pub mod store;
pub mod tcp;

use crate::core::{Document, Filter, ShardInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;

/// Read request sent to a single shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindRequest {
    pub namespace: String,
    pub key_field: String,
    pub filter: Filter,
    /// Partition map version the request was routed with
    pub routing_version: u64,
}

/// Write request sent to a single shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRequest {
    pub namespace: String,
    pub key_field: String,
    pub document: Document,
    pub routing_version: u64,
}

/// Shard reply to a find
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum FindReply {
    Documents { documents: Vec<Document> },
    Error { message: String },
}

/// Shard-side record of the last insert on a link
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteStatus {
    /// No insert has been seen on this link
    #[default]
    NoWrite,
    Applied,
    Rejected { message: String },
}

/// Opens links to shards
#[async_trait]
pub trait ShardConnector: Send + Sync {
    /// Establish a new physical link to a shard
    async fn connect(&self, shard: &ShardInfo) -> io::Result<Box<dyn ShardLink>>;
}

/// One physical channel to one shard
#[async_trait]
pub trait ShardLink: Send + Sync {
    async fn find(&mut self, request: &FindRequest) -> io::Result<FindReply>;

    /// Hand a write to the shard. Returning `Ok` does not mean it was applied.
    async fn insert(&mut self, request: &InsertRequest) -> io::Result<()>;

    /// Ask the shard what happened to the last insert on this link
    async fn last_write_status(&mut self) -> io::Result<WriteStatus>;
}
