/// Operation router: resolve targets, fan out, merge
///
/// Reads are sent to every owning shard at once and joined; a shard that
/// fails only marks its own slice of the result. Writes go to exactly one
/// owner and are never retried. Their outcome is asked for separately with
/// [`Router::ack_last_write`].
use crate::config::Config;
use crate::core::ack::WriteOutcome;
use crate::core::pool::ConnectionPool;
use crate::core::session::{LastWrite, Session};
use crate::core::{
    compare_by_key, shard_key_of, split_namespace, Document, Filter, ShardId, ShardInfo,
    DEFAULT_SHARD_KEY,
};
use crate::directory::metadata::{FileMetadataStore, InMemoryMetadataStore, MetadataStore};
use crate::directory::{PartitionDirectory, PartitionMap};
use crate::error::{ErrorSeverity, RouterError, RouterResult};
use crate::health::{FailureDetector, ShardHealth};
use crate::transport::{FindRequest, InsertRequest, ShardConnector};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// A shard that could not contribute to a read
#[derive(Debug)]
pub struct ShardFailure {
    pub shard: ShardId,
    pub error: RouterError,
}

/// Merged read result
#[derive(Debug)]
pub struct PartialResult {
    /// Documents from every shard that answered, ordered by shard key
    pub documents: Vec<Document>,
    pub failures: Vec<ShardFailure>,
    /// Partition map version the read was routed with
    pub routing_version: u64,
}

impl PartialResult {
    /// Whether some targeted shards did not answer
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failed_shards(&self) -> Vec<&ShardId> {
        self.failures.iter().map(|f| &f.shard).collect()
    }
}

pub struct Router {
    directory: Arc<PartitionDirectory>,
    pool: Arc<ConnectionPool>,
    operation_timeout: Duration,
}

impl Router {
    pub fn new(
        directory: Arc<PartitionDirectory>,
        pool: Arc<ConnectionPool>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            pool,
            operation_timeout,
        }
    }

    /// Build a router from configuration. The partition map is not loaded
    /// until [`refresh`](Self::refresh) is called.
    pub fn from_config(config: &Config, connector: Arc<dyn ShardConnector>) -> Self {
        let store: Arc<dyn MetadataStore> = match &config.metadata.file {
            Some(path) => Arc::new(FileMetadataStore::new(path.clone())),
            None => Arc::new(InMemoryMetadataStore::with_metadata(
                config.metadata.cluster_metadata(),
            )),
        };
        let pool = ConnectionPool::new(
            connector,
            Arc::new(FailureDetector::new()),
            config.router.connect_timeout(),
            config.router.session_timeout(),
        );
        Self::new(
            Arc::new(PartitionDirectory::new(store)),
            Arc::new(pool),
            config.router.operation_timeout(),
        )
    }

    pub fn directory(&self) -> &PartitionDirectory {
        &self.directory
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Reload the partition map; the previous one stays in effect on failure
    pub async fn refresh(&self) -> RouterResult<u64> {
        self.directory.refresh().await
    }

    pub async fn open_session(&self) -> Arc<Session> {
        self.pool.open_session().await
    }

    pub async fn close_session(&self, session: &Session) -> usize {
        self.pool.close_session(session).await
    }

    /// Advisory health of every shard that has seen traffic
    pub async fn shard_health(&self) -> Vec<(ShardId, ShardHealth)> {
        self.pool.detector().snapshot().await
    }

    async fn observe(&self, shard: &ShardId, error: &RouterError) {
        if matches!(
            error,
            RouterError::ShardUnreachable { .. } | RouterError::ShardTimeout { .. }
        ) {
            self.pool
                .detector()
                .record_failure(shard, &error.to_string())
                .await;
        }
    }

    fn shard_info(snapshot: &PartitionMap, shard: &ShardId) -> RouterResult<ShardInfo> {
        snapshot
            .shard(shard)
            .cloned()
            .ok_or_else(|| RouterError::internal(format!("shard {} missing from map", shard)))
    }

    async fn read_shard(
        &self,
        session: &Session,
        snapshot: &PartitionMap,
        shard: &ShardId,
        request: &FindRequest,
    ) -> RouterResult<Vec<Document>> {
        let info = Self::shard_info(snapshot, shard)?;
        let mut conn = self.pool.get_connection(session, &info).await?;
        let result = conn.find(request, self.operation_timeout).await;
        if let Err(e) = &result {
            self.observe(shard, e).await;
        }
        result
    }

    /// Read `filter` from every shard owning part of `namespace` that it can
    /// match.
    ///
    /// Fails only when every targeted shard failed; otherwise the failures
    /// are listed next to the merged documents.
    pub async fn route_read(
        &self,
        session: &Session,
        namespace: &str,
        filter: &Filter,
    ) -> RouterResult<PartialResult> {
        let snapshot = self.directory.snapshot().await?;
        let resolution = snapshot.resolve(namespace, &filter.target_range())?;
        debug!(
            "Read on {} targets {:?} at version {}",
            namespace, resolution.shards, resolution.version
        );

        let request = FindRequest {
            namespace: namespace.to_string(),
            key_field: resolution.key_field.clone(),
            filter: filter.clone(),
            routing_version: resolution.version,
        };

        let results = join_all(
            resolution
                .shards
                .iter()
                .map(|shard| self.read_shard(session, &snapshot, shard, &request)),
        )
        .await;

        let mut documents = Vec::new();
        let mut failures = Vec::new();
        for (shard, result) in resolution.shards.iter().zip(results) {
            match result {
                Ok(mut docs) => documents.append(&mut docs),
                Err(error) => {
                    match error.severity() {
                        ErrorSeverity::Critical | ErrorSeverity::Error => {
                            error!("Read on {} failed at shard {}: {}", namespace, shard, error)
                        }
                        ErrorSeverity::Warning => {
                            warn!("Read on {} failed at shard {}: {}", namespace, shard, error)
                        }
                        ErrorSeverity::Info => {
                            debug!("Read on {} failed at shard {}: {}", namespace, shard, error)
                        }
                    }
                    failures.push(ShardFailure {
                        shard: shard.clone(),
                        error,
                    });
                }
            }
        }

        if !resolution.shards.is_empty() && failures.len() == resolution.shards.len() {
            return Err(failures.remove(0).error);
        }

        documents.sort_by(|a, b| compare_by_key(&resolution.key_field, a, b));
        Ok(PartialResult {
            documents,
            failures,
            routing_version: resolution.version,
        })
    }

    /// Send `document` to the shard owning its key.
    ///
    /// `Ok` means the write was handed off, not that it was applied. An error
    /// from establishing the connection or from the send leaves the session's
    /// last write with an unknown outcome; a write refused before any byte
    /// was sent (`InvalidDocument`) is reported as an explicit error.
    pub async fn route_write(
        &self,
        session: &Session,
        namespace: &str,
        document: Document,
    ) -> RouterResult<()> {
        let snapshot = self.directory.snapshot().await?;
        let (key_field, target) = match snapshot.shard_key(namespace) {
            Some(field) => {
                let key = shard_key_of(field, &document).ok_or_else(|| {
                    RouterError::invalid_document(format!(
                        "{} is sharded on {} but the document has no integer {}",
                        namespace, field, field
                    ))
                })?;
                (field.to_string(), snapshot.resolve_key(namespace, key)?)
            }
            None => {
                let primary = split_namespace(namespace)
                    .and_then(|(database, _)| snapshot.primary(database))
                    .cloned()
                    .ok_or_else(|| RouterError::namespace_not_found(namespace))?;
                (DEFAULT_SHARD_KEY.to_string(), primary)
            }
        };
        let info = Self::shard_info(&snapshot, &target)?;
        debug!(
            "Write on {} goes to shard {} at version {}",
            namespace,
            target,
            snapshot.version()
        );

        // A new write discards whatever was tracked for the previous one
        let previous = session
            .replace_last_write(LastWrite::Unsent(target.clone()))
            .await;
        if let Some(previous) = previous.filter(|p| p.shard() != &target) {
            if let Some(slot) = session.existing_slot(previous.shard()).await {
                slot.lock().await.discard_outcome();
            }
        }

        let mut conn = self.pool.get_connection(session, &info).await?;
        session
            .replace_last_write(LastWrite::Sent(target.clone()))
            .await;

        let request = InsertRequest {
            namespace: namespace.to_string(),
            key_field,
            document,
            routing_version: snapshot.version(),
        };
        let result = conn.send_write(&request, self.operation_timeout).await;
        if let Err(e) = &result {
            self.observe(&target, e).await;
        }
        result
    }

    /// Report the outcome of the session's most recent write.
    ///
    /// The answer comes from the connection the write was sent on; nothing is
    /// reconnected. After reporting, nothing is tracked until the next write.
    pub async fn ack_last_write(&self, session: &Session) -> RouterResult<WriteOutcome> {
        match session.take_last_write().await {
            None => Err(RouterError::NoPendingWrite),
            Some(LastWrite::Unsent(shard)) => {
                if let Some(slot) = session.existing_slot(&shard).await {
                    slot.lock().await.discard_outcome();
                }
                Ok(WriteOutcome::Unknown {
                    reason: format!("write could not be sent to shard {}", shard),
                })
            }
            Some(LastWrite::Sent(shard)) => {
                let slot = match session.existing_slot(&shard).await {
                    Some(slot) => slot,
                    None => {
                        return Ok(WriteOutcome::Unknown {
                            reason: format!("connection to shard {} was released", shard),
                        })
                    }
                };
                let mut conn = slot.lock().await;
                let was_faulted = conn.is_faulted();
                let outcome = conn.ack_last_write(self.operation_timeout).await?;
                if !was_faulted && conn.is_faulted() {
                    self.pool
                        .detector()
                        .record_failure(&shard, &outcome.to_string())
                        .await;
                }
                debug!("Last write on shard {} ended: {}", shard, outcome);
                Ok(outcome)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KeyBound;
    use crate::directory::metadata::{ChunkEntry, ClusterMetadata, CollectionEntry, DatabaseEntry};
    use crate::transport::memory::{MemoryCluster, MemoryShard};
    use serde_json::json;

    const SHARDED: &str = "fooSharded.barSharded";
    const UNSHARDED: &str = "fooUnsharded.barUnsharded";

    fn doc(id: i64) -> Document {
        json!({"_id": id, "value": id * 10}).as_object().cloned().unwrap()
    }

    fn metadata() -> ClusterMetadata {
        let shard = |id: &str| ShardInfo::new(ShardId::new(id), format!("memory://{}", id));
        ClusterMetadata {
            version: 1,
            shards: vec![shard("shard0000"), shard("shard0001")],
            databases: vec![
                DatabaseEntry {
                    name: "fooUnsharded".to_string(),
                    primary: ShardId::new("shard0000"),
                },
                DatabaseEntry {
                    name: "fooSharded".to_string(),
                    primary: ShardId::new("shard0000"),
                },
            ],
            collections: vec![CollectionEntry {
                namespace: SHARDED.to_string(),
                shard_key: "_id".to_string(),
                chunks: vec![
                    ChunkEntry {
                        min: KeyBound::MinKey,
                        max: KeyBound::Value(0),
                        shard: ShardId::new("shard0000"),
                    },
                    ChunkEntry {
                        min: KeyBound::Value(0),
                        max: KeyBound::MaxKey,
                        shard: ShardId::new("shard0001"),
                    },
                ],
            }],
        }
    }

    async fn setup() -> (Router, Arc<MemoryShard>, Arc<MemoryShard>) {
        let cluster = MemoryCluster::new();
        let a = cluster.add_shard(ShardId::new("shard0000")).await;
        let b = cluster.add_shard(ShardId::new("shard0001")).await;
        let pool = ConnectionPool::new(
            Arc::new(cluster),
            Arc::new(FailureDetector::new()),
            Duration::from_millis(200),
            Duration::from_secs(60),
        );
        let store = Arc::new(InMemoryMetadataStore::with_metadata(metadata()));
        let router = Router::new(
            Arc::new(PartitionDirectory::new(store)),
            Arc::new(pool),
            Duration::from_millis(200),
        );
        router.refresh().await.unwrap();
        (router, a, b)
    }

    #[tokio::test]
    async fn test_write_routes_by_key() {
        let (router, a, b) = setup().await;
        let session = router.open_session().await;

        router.route_write(&session, SHARDED, doc(-1)).await.unwrap();
        assert_eq!(router.ack_last_write(&session).await.unwrap(), WriteOutcome::Success);
        router.route_write(&session, SHARDED, doc(1)).await.unwrap();
        assert_eq!(router.ack_last_write(&session).await.unwrap(), WriteOutcome::Success);

        assert_eq!(a.store().document_count(SHARDED).await, 1);
        assert_eq!(b.store().document_count(SHARDED).await, 1);
    }

    #[tokio::test]
    async fn test_read_merges_in_key_order() {
        let (router, _a, _b) = setup().await;
        let session = router.open_session().await;
        for id in [3, -2, 1, -5] {
            router.route_write(&session, SHARDED, doc(id)).await.unwrap();
        }

        let result = router
            .route_read(&session, SHARDED, &Filter::All)
            .await
            .unwrap();
        assert!(!result.is_partial());
        let keys: Vec<i64> = result
            .documents
            .iter()
            .filter_map(|d| shard_key_of("_id", d))
            .collect();
        assert_eq!(keys, vec![-5, -2, 1, 3]);
        assert_eq!(result.routing_version, 1);
    }

    #[tokio::test]
    async fn test_read_flags_failed_shard() {
        let (router, _a, b) = setup().await;
        let session = router.open_session().await;
        router.route_write(&session, SHARDED, doc(-1)).await.unwrap();
        router.route_write(&session, SHARDED, doc(1)).await.unwrap();

        b.stop();
        let result = router
            .route_read(&session, SHARDED, &Filter::All)
            .await
            .unwrap();
        assert!(result.is_partial());
        assert_eq!(result.failed_shards(), vec![&ShardId::new("shard0001")]);
        assert_eq!(result.documents.len(), 1);

        // A read that only targets the failed shard fails outright
        assert!(router
            .route_read(&session, SHARDED, &Filter::KeyEq { key: 1 })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_write_without_shard_key_rejected() {
        let (router, _a, _b) = setup().await;
        let session = router.open_session().await;
        let document = json!({"name": "no key"}).as_object().cloned().unwrap();
        assert!(matches!(
            router.route_write(&session, SHARDED, document).await,
            Err(RouterError::InvalidDocument { .. })
        ));
        assert!(matches!(
            router.ack_last_write(&session).await,
            Err(RouterError::NoPendingWrite)
        ));
    }

    #[tokio::test]
    async fn test_unsharded_write_without_key_goes_to_primary() {
        let (router, a, _b) = setup().await;
        let session = router.open_session().await;
        let document = json!({"_id": 1, "name": "x"}).as_object().cloned().unwrap();
        router.route_write(&session, UNSHARDED, document).await.unwrap();
        assert!(router.ack_last_write(&session).await.unwrap().is_success());
        assert_eq!(a.store().document_count(UNSHARDED).await, 1);
    }

    #[tokio::test]
    async fn test_write_to_stopped_shard_is_never_success() {
        let (router, _a, b) = setup().await;
        let session = router.open_session().await;
        b.stop();

        assert!(router.route_write(&session, SHARDED, doc(5)).await.is_err());
        let outcome = router.ack_last_write(&session).await.unwrap();
        assert!(outcome.is_unknown());
        assert!(!router
            .pool()
            .detector()
            .status(&ShardId::new("shard0001"))
            .await
            .is_healthy());
    }

    #[tokio::test]
    async fn test_new_write_discards_previous_outcome() {
        let (router, _a, _b) = setup().await;
        let session = router.open_session().await;
        router.route_write(&session, SHARDED, doc(-1)).await.unwrap();
        router.route_write(&session, SHARDED, doc(1)).await.unwrap();
        router.route_write(&session, SHARDED, doc(1)).await.unwrap();

        match router.ack_last_write(&session).await.unwrap() {
            WriteOutcome::ExplicitError { details } => assert!(details.contains("duplicate key")),
            other => panic!("Expected explicit error, got {}", other),
        }
        assert!(matches!(
            router.ack_last_write(&session).await,
            Err(RouterError::NoPendingWrite)
        ));
    }

    #[tokio::test]
    async fn test_unknown_namespace_and_missing_snapshot() {
        let (router, _a, _b) = setup().await;
        let session = router.open_session().await;
        assert!(matches!(
            router.route_read(&session, "nodb.coll", &Filter::All).await,
            Err(RouterError::NamespaceNotFound { .. })
        ));

        let cold = Router::new(
            Arc::new(PartitionDirectory::new(Arc::new(InMemoryMetadataStore::new()))),
            Arc::new(ConnectionPool::new(
                Arc::new(MemoryCluster::new()),
                Arc::new(FailureDetector::new()),
                Duration::from_millis(100),
                Duration::from_secs(60),
            )),
            Duration::from_millis(100),
        );
        let session = cold.open_session().await;
        assert!(matches!(
            cold.route_read(&session, SHARDED, &Filter::All).await,
            Err(RouterError::MetadataUnavailable { .. })
        ));
    }
}
