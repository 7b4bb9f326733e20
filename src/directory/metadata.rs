/// Metadata store: the external source of the partition map
///
/// The router only reads from a store. Administrative changes (adding shards,
/// enabling sharding, splitting and moving chunks, moving a database's
/// primary) are applied to the store directly and become visible to the
/// router on its next refresh.
use crate::core::{split_namespace, KeyBound, KeyRange, ShardId, ShardInfo, DEFAULT_SHARD_KEY};
use crate::error::{RouterError, RouterResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// A database and the shard holding its unsharded collections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub primary: ShardId,
}

/// One chunk of a sharded collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub min: KeyBound,
    pub max: KeyBound,
    pub shard: ShardId,
}

impl ChunkEntry {
    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.min, self.max)
    }
}

/// A sharded collection and its chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub namespace: String,
    #[serde(default = "default_shard_key")]
    pub shard_key: String,
    pub chunks: Vec<ChunkEntry>,
}

fn default_shard_key() -> String {
    DEFAULT_SHARD_KEY.to_string()
}

/// Everything the router needs to build a partition map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Bumped by every administrative change
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub shards: Vec<ShardInfo>,
    #[serde(default)]
    pub databases: Vec<DatabaseEntry>,
    #[serde(default)]
    pub collections: Vec<CollectionEntry>,
}

/// Source of cluster metadata
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read the current metadata. Fails with `MetadataUnavailable` when the
    /// store cannot be reached.
    async fn load(&self) -> RouterResult<ClusterMetadata>;
}

/// Metadata held in memory and changed through administrative operations
pub struct InMemoryMetadataStore {
    metadata: RwLock<ClusterMetadata>,
    available: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::with_metadata(ClusterMetadata::default())
    }

    pub fn with_metadata(metadata: ClusterMetadata) -> Self {
        Self {
            metadata: RwLock::new(metadata),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn version(&self) -> u64 {
        self.metadata.read().await.version
    }

    pub async fn add_shard(&self, shard: ShardInfo) -> RouterResult<()> {
        let mut metadata = self.metadata.write().await;
        if metadata.shards.iter().any(|s| s.id == shard.id) {
            return Err(RouterError::invalid_partition_map(format!(
                "shard {} already exists",
                shard.id
            )));
        }
        metadata.shards.push(shard);
        metadata.version += 1;
        Ok(())
    }

    /// Create a database on `primary`, or do nothing if it already exists
    pub async fn enable_sharding(&self, database: &str, primary: &ShardId) -> RouterResult<()> {
        let mut metadata = self.metadata.write().await;
        require_shard(&metadata, primary)?;
        if metadata.databases.iter().any(|d| d.name == database) {
            return Ok(());
        }
        metadata.databases.push(DatabaseEntry {
            name: database.to_string(),
            primary: primary.clone(),
        });
        metadata.version += 1;
        Ok(())
    }

    /// Change which shard hosts a database's unsharded collections
    pub async fn move_primary(&self, database: &str, to: &ShardId) -> RouterResult<()> {
        let mut metadata = self.metadata.write().await;
        require_shard(&metadata, to)?;
        let entry = metadata
            .databases
            .iter_mut()
            .find(|d| d.name == database)
            .ok_or_else(|| RouterError::namespace_not_found(database))?;
        entry.primary = to.clone();
        metadata.version += 1;
        Ok(())
    }

    /// Shard a collection with a single chunk on its database's primary
    pub async fn shard_collection(&self, namespace: &str, shard_key: &str) -> RouterResult<()> {
        let mut metadata = self.metadata.write().await;
        let (database, _) = split_namespace(namespace)
            .ok_or_else(|| RouterError::namespace_not_found(namespace))?;
        let primary = metadata
            .databases
            .iter()
            .find(|d| d.name == database)
            .map(|d| d.primary.clone())
            .ok_or_else(|| RouterError::namespace_not_found(namespace))?;

        if metadata.collections.iter().any(|c| c.namespace == namespace) {
            return Err(RouterError::invalid_partition_map(format!(
                "{} is already sharded",
                namespace
            )));
        }

        metadata.collections.push(CollectionEntry {
            namespace: namespace.to_string(),
            shard_key: shard_key.to_string(),
            chunks: vec![ChunkEntry {
                min: KeyBound::MinKey,
                max: KeyBound::MaxKey,
                shard: primary,
            }],
        });
        metadata.version += 1;
        Ok(())
    }

    /// Split the chunk containing `middle` into `[min, middle)` and `[middle, max)`
    pub async fn split(&self, namespace: &str, middle: i64) -> RouterResult<()> {
        let mut metadata = self.metadata.write().await;
        let collection = find_collection(&mut metadata, namespace)?;
        let index = chunk_index(collection, middle)?;

        let chunk = collection.chunks[index].clone();
        if chunk.min == KeyBound::Value(middle) {
            return Err(RouterError::invalid_partition_map(format!(
                "{} is already a chunk boundary of {}",
                middle, namespace
            )));
        }

        collection.chunks[index].max = KeyBound::Value(middle);
        collection.chunks.insert(
            index + 1,
            ChunkEntry {
                min: KeyBound::Value(middle),
                max: chunk.max,
                shard: chunk.shard,
            },
        );
        metadata.version += 1;
        Ok(())
    }

    /// Reassign the chunk containing `key` to shard `to`
    pub async fn move_chunk(&self, namespace: &str, key: i64, to: &ShardId) -> RouterResult<()> {
        let mut metadata = self.metadata.write().await;
        require_shard(&metadata, to)?;
        let collection = find_collection(&mut metadata, namespace)?;
        let index = chunk_index(collection, key)?;
        collection.chunks[index].shard = to.clone();
        metadata.version += 1;
        Ok(())
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn require_shard(metadata: &ClusterMetadata, shard: &ShardId) -> RouterResult<()> {
    if metadata.shards.iter().any(|s| &s.id == shard) {
        Ok(())
    } else {
        Err(RouterError::invalid_partition_map(format!(
            "unknown shard {}",
            shard
        )))
    }
}

fn find_collection<'a>(
    metadata: &'a mut ClusterMetadata,
    namespace: &str,
) -> RouterResult<&'a mut CollectionEntry> {
    metadata
        .collections
        .iter_mut()
        .find(|c| c.namespace == namespace)
        .ok_or_else(|| {
            RouterError::invalid_partition_map(format!("{} is not sharded", namespace))
        })
}

fn chunk_index(collection: &CollectionEntry, key: i64) -> RouterResult<usize> {
    collection
        .chunks
        .iter()
        .position(|c| c.range().contains(key))
        .ok_or_else(|| {
            RouterError::invalid_partition_map(format!(
                "no chunk of {} contains {}",
                collection.namespace, key
            ))
        })
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn load(&self) -> RouterResult<ClusterMetadata> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(RouterError::metadata_unavailable(
                "metadata store is not reachable",
            ));
        }
        Ok(self.metadata.read().await.clone())
    }
}

/// Metadata read from a TOML file on every load
pub struct FileMetadataStore {
    path: PathBuf,
}

impl FileMetadataStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Write metadata in the format `load` expects
    pub async fn save(&self, metadata: &ClusterMetadata) -> RouterResult<()> {
        let content = toml::to_string_pretty(metadata)
            .map_err(|e| RouterError::internal(format!("cannot encode metadata: {}", e)))?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn load(&self) -> RouterResult<ClusterMetadata> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RouterError::metadata_unavailable(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))
        })?;
        toml::from_str(&content).map_err(|e| {
            RouterError::metadata_unavailable(format!(
                "cannot parse {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn two_shard_store() -> InMemoryMetadataStore {
        let store = InMemoryMetadataStore::new();
        store
            .add_shard(ShardInfo::new(ShardId::new("shard0000"), "127.0.0.1:27018"))
            .await
            .unwrap();
        store
            .add_shard(ShardInfo::new(ShardId::new("shard0001"), "127.0.0.1:27019"))
            .await
            .unwrap();
        store
            .enable_sharding("fooSharded", &ShardId::new("shard0000"))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_shard_split_and_move() {
        let store = two_shard_store().await;
        store
            .shard_collection("fooSharded.barSharded", "_id")
            .await
            .unwrap();
        store.split("fooSharded.barSharded", 0).await.unwrap();
        store
            .move_chunk("fooSharded.barSharded", 0, &ShardId::new("shard0001"))
            .await
            .unwrap();

        let metadata = store.load().await.unwrap();
        let chunks = &metadata.collections[0].chunks;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].range(), KeyRange::new(KeyBound::MinKey, KeyBound::Value(0)));
        assert_eq!(chunks[0].shard, ShardId::new("shard0000"));
        assert_eq!(chunks[1].range(), KeyRange::new(KeyBound::Value(0), KeyBound::MaxKey));
        assert_eq!(chunks[1].shard, ShardId::new("shard0001"));
        assert_eq!(metadata.version, 6);
    }

    #[tokio::test]
    async fn test_admin_operations_validate_input() {
        let store = two_shard_store().await;
        assert!(store
            .enable_sharding("other", &ShardId::new("missing"))
            .await
            .is_err());
        assert!(store.shard_collection("nodb.coll", "_id").await.is_err());
        assert!(store.split("fooSharded.unsharded", 0).await.is_err());

        store
            .shard_collection("fooSharded.barSharded", "_id")
            .await
            .unwrap();
        store.split("fooSharded.barSharded", 0).await.unwrap();
        assert!(store.split("fooSharded.barSharded", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = two_shard_store().await;
        store.set_available(false);
        assert!(matches!(
            store.load().await,
            Err(RouterError::MetadataUnavailable { .. })
        ));
        store.set_available(true);
        assert!(store.load().await.is_ok());
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let store = two_shard_store().await;
        store
            .shard_collection("fooSharded.barSharded", "_id")
            .await
            .unwrap();
        store.split("fooSharded.barSharded", 0).await.unwrap();
        let metadata = store.load().await.unwrap();

        let temp_file = NamedTempFile::new().unwrap();
        let file_store = FileMetadataStore::new(temp_file.path());
        file_store.save(&metadata).await.unwrap();
        assert_eq!(file_store.load().await.unwrap(), metadata);
    }

    #[tokio::test]
    async fn test_file_store_missing_file() {
        let file_store = FileMetadataStore::new("/nonexistent/shardgate/metadata.toml");
        assert!(matches!(
            file_store.load().await,
            Err(RouterError::MetadataUnavailable { .. })
        ));
    }
}
