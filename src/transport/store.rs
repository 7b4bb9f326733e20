/// In-memory document store backing test and demo shards
use super::{FindReply, FindRequest, InsertRequest, WriteStatus};
use crate::core::{compare_by_key, Document};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Documents of one shard, grouped by namespace
pub struct ShardStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    /// Requests routed with an older partition map version are refused
    min_routing_version: AtomicU64,
}

impl ShardStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            min_routing_version: AtomicU64::new(0),
        }
    }

    /// Refuse requests routed with a partition map older than `version`
    pub fn require_routing_version(&self, version: u64) {
        self.min_routing_version.store(version, Ordering::SeqCst);
    }

    fn check_version(&self, routing_version: u64) -> Result<(), String> {
        let required = self.min_routing_version.load(Ordering::SeqCst);
        if routing_version < required {
            return Err(format!(
                "stale config: routed with version {} but shard requires {}",
                routing_version, required
            ));
        }
        Ok(())
    }

    /// Apply an insert and report how it went
    pub async fn insert(&self, request: &InsertRequest) -> WriteStatus {
        if let Err(message) = self.check_version(request.routing_version) {
            return WriteStatus::Rejected { message };
        }

        let mut collections = self.collections.write().await;
        let documents = collections.entry(request.namespace.clone()).or_default();

        if let Some(id) = request.document.get("_id") {
            if documents.iter().any(|d| d.get("_id") == Some(id)) {
                return WriteStatus::Rejected {
                    message: format!(
                        "E11000 duplicate key error collection: {} dup key: {{ _id: {} }}",
                        request.namespace, id
                    ),
                };
            }
        }

        documents.push(request.document.clone());
        WriteStatus::Applied
    }

    /// Evaluate a find, returning matches ordered by shard key
    pub async fn find(&self, request: &FindRequest) -> FindReply {
        if let Err(message) = self.check_version(request.routing_version) {
            return FindReply::Error { message };
        }

        let collections = self.collections.read().await;
        let mut documents: Vec<Document> = collections
            .get(&request.namespace)
            .map(|docs| {
                docs.iter()
                    .filter(|d| request.filter.matches(&request.key_field, d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        documents.sort_by(|a, b| compare_by_key(&request.key_field, a, b));

        FindReply::Documents { documents }
    }

    pub async fn document_count(&self, namespace: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(namespace).map_or(0, |docs| docs.len())
    }
}

impl Default for ShardStore {
    fn default() -> Self {
        Self::new()
    }
}
