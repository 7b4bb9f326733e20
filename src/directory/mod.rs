/// Partition directory: collection + key range to owning shard
///
/// A [`PartitionMap`] is an immutable, versioned snapshot built from cluster
/// metadata. The [`PartitionDirectory`] holds the current snapshot and swaps
/// it wholesale on refresh; resolutions that already took a snapshot keep it.
pub mod metadata;

use crate::core::{split_namespace, KeyBound, KeyRange, ShardId, ShardInfo};
use crate::error::{RouterError, RouterResult};
use metadata::{ClusterMetadata, MetadataStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub range: KeyRange,
    pub shard: ShardId,
}

#[derive(Debug, Clone)]
struct ShardedCollection {
    shard_key: String,
    /// Sorted by range, tiling `[MinKey, MaxKey)`
    chunks: Vec<Chunk>,
}

/// Targets of one operation, resolved against a single snapshot version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub version: u64,
    pub key_field: String,
    pub sharded: bool,
    /// Owning shards in key order, without duplicates
    pub shards: Vec<ShardId>,
}

/// Immutable routing snapshot
#[derive(Debug, Clone)]
pub struct PartitionMap {
    version: u64,
    shards: BTreeMap<ShardId, ShardInfo>,
    primaries: HashMap<String, ShardId>,
    collections: HashMap<String, ShardedCollection>,
    /// Metadata this snapshot was built from
    source: ClusterMetadata,
}

impl PartitionMap {
    /// Validate metadata and build a snapshot from it
    pub fn build(metadata: ClusterMetadata) -> RouterResult<Self> {
        let source = metadata.clone();
        let mut shards = BTreeMap::new();
        for shard in metadata.shards {
            if shards.contains_key(&shard.id) {
                return Err(RouterError::invalid_partition_map(format!(
                    "shard {} listed twice",
                    shard.id
                )));
            }
            shards.insert(shard.id.clone(), shard);
        }

        let mut primaries = HashMap::new();
        for database in metadata.databases {
            if !shards.contains_key(&database.primary) {
                return Err(RouterError::invalid_partition_map(format!(
                    "database {} has unknown primary {}",
                    database.name, database.primary
                )));
            }
            if primaries
                .insert(database.name.clone(), database.primary)
                .is_some()
            {
                return Err(RouterError::invalid_partition_map(format!(
                    "database {} listed twice",
                    database.name
                )));
            }
        }

        let mut collections = HashMap::new();
        for collection in metadata.collections {
            let namespace = collection.namespace;
            let (database, _) = split_namespace(&namespace).ok_or_else(|| {
                RouterError::invalid_partition_map(format!("bad namespace {:?}", namespace))
            })?;
            if !primaries.contains_key(database) {
                return Err(RouterError::invalid_partition_map(format!(
                    "collection {} belongs to unknown database {}",
                    namespace, database
                )));
            }

            let mut chunks: Vec<Chunk> = collection
                .chunks
                .iter()
                .map(|c| Chunk {
                    range: c.range(),
                    shard: c.shard.clone(),
                })
                .collect();
            chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
            check_chunks(&namespace, &chunks, &shards)?;

            let entry = ShardedCollection {
                shard_key: collection.shard_key,
                chunks,
            };
            if collections.insert(namespace.clone(), entry).is_some() {
                return Err(RouterError::invalid_partition_map(format!(
                    "collection {} listed twice",
                    namespace
                )));
            }
        }

        Ok(Self {
            version: metadata.version,
            shards,
            primaries,
            collections,
            source,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The metadata this snapshot was built from
    pub fn metadata(&self) -> &ClusterMetadata {
        &self.source
    }

    pub fn shard(&self, id: &ShardId) -> Option<&ShardInfo> {
        self.shards.get(id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardInfo> {
        self.shards.values()
    }

    /// Shard-key field of a sharded collection
    pub fn shard_key(&self, namespace: &str) -> Option<&str> {
        self.collections.get(namespace).map(|c| c.shard_key.as_str())
    }

    pub fn primary(&self, database: &str) -> Option<&ShardId> {
        self.primaries.get(database)
    }

    /// Databases and their primaries, ordered by name
    pub fn databases(&self) -> Vec<(&str, &ShardId)> {
        let mut databases: Vec<_> = self
            .primaries
            .iter()
            .map(|(name, primary)| (name.as_str(), primary))
            .collect();
        databases.sort();
        databases
    }

    /// Sharded namespaces, ordered by name
    pub fn sharded_namespaces(&self) -> Vec<&str> {
        let mut namespaces: Vec<&str> = self.collections.keys().map(String::as_str).collect();
        namespaces.sort_unstable();
        namespaces
    }

    /// Chunks of a sharded collection, in key order
    pub fn chunks(&self, namespace: &str) -> Option<&[Chunk]> {
        self.collections.get(namespace).map(|c| c.chunks.as_slice())
    }

    /// Owning shards of `range` in `namespace`
    pub fn resolve(&self, namespace: &str, range: &KeyRange) -> RouterResult<Resolution> {
        let (database, _) = split_namespace(namespace)
            .ok_or_else(|| RouterError::namespace_not_found(namespace))?;

        if let Some(collection) = self.collections.get(namespace) {
            let mut shards: Vec<ShardId> = Vec::new();
            for chunk in collection.chunks.iter().filter(|c| c.range.overlaps(range)) {
                if !shards.contains(&chunk.shard) {
                    shards.push(chunk.shard.clone());
                }
            }
            return Ok(Resolution {
                version: self.version,
                key_field: collection.shard_key.clone(),
                sharded: true,
                shards,
            });
        }

        let primary = self
            .primaries
            .get(database)
            .ok_or_else(|| RouterError::namespace_not_found(namespace))?;
        Ok(Resolution {
            version: self.version,
            key_field: crate::core::DEFAULT_SHARD_KEY.to_string(),
            sharded: false,
            shards: vec![primary.clone()],
        })
    }

    /// The single owner of `key` in `namespace`
    pub fn resolve_key(&self, namespace: &str, key: i64) -> RouterResult<ShardId> {
        let range = KeyRange::new(
            KeyBound::Value(key),
            key.checked_add(1).map_or(KeyBound::MaxKey, KeyBound::Value),
        );
        self.resolve(namespace, &range)?
            .shards
            .into_iter()
            .next()
            .ok_or_else(|| RouterError::internal(format!("no owner for {} in {}", key, namespace)))
    }
}

fn check_chunks(
    namespace: &str,
    chunks: &[Chunk],
    shards: &BTreeMap<ShardId, ShardInfo>,
) -> RouterResult<()> {
    let mut expected = KeyBound::MinKey;
    for chunk in chunks {
        if !shards.contains_key(&chunk.shard) {
            return Err(RouterError::invalid_partition_map(format!(
                "chunk {} of {} is on unknown shard {}",
                chunk.range, namespace, chunk.shard
            )));
        }
        if chunk.range.is_empty() {
            return Err(RouterError::invalid_partition_map(format!(
                "chunk {} of {} is empty",
                chunk.range, namespace
            )));
        }
        if chunk.range.min != expected {
            return Err(RouterError::invalid_partition_map(format!(
                "chunks of {} leave a gap or overlap at {}",
                namespace, chunk.range.min
            )));
        }
        expected = chunk.range.max;
    }
    if expected != KeyBound::MaxKey {
        return Err(RouterError::invalid_partition_map(format!(
            "chunks of {} do not reach MaxKey",
            namespace
        )));
    }
    Ok(())
}

/// Holder of the current partition map
pub struct PartitionDirectory {
    store: Arc<dyn MetadataStore>,
    current: RwLock<Option<Arc<PartitionMap>>>,
}

impl PartitionDirectory {
    /// Create a directory with no snapshot; call [`refresh`](Self::refresh)
    /// before resolving.
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    /// Reload the map from the metadata store.
    ///
    /// On failure the previous snapshot stays in effect. Identical metadata
    /// keeps the current snapshot; any other change is rebuilt even when the
    /// version was not bumped. Returns the version now in effect.
    pub async fn refresh(&self) -> RouterResult<u64> {
        let metadata = match self.store.load().await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Partition map refresh failed: {}", e);
                return Err(e);
            }
        };

        let mut current = self.current.write().await;
        if let Some(map) = current.as_ref() {
            if map.metadata() == &metadata {
                debug!("Partition map unchanged at version {}", map.version());
                return Ok(map.version());
            }
            if map.version() == metadata.version {
                warn!(
                    "Partition metadata changed without a version bump (version {})",
                    metadata.version
                );
            }
        }

        let map = PartitionMap::build(metadata).map_err(|e| {
            warn!("Rejected partition map: {}", e);
            e
        })?;
        let version = map.version();
        let previous = current.replace(Arc::new(map)).map(|m| m.version());
        info!(
            "Partition map updated to version {} (was {:?})",
            version, previous
        );
        Ok(version)
    }

    /// The snapshot currently in effect
    pub async fn snapshot(&self) -> RouterResult<Arc<PartitionMap>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or_else(|| RouterError::metadata_unavailable("partition map was never loaded"))
    }

    pub async fn version(&self) -> Option<u64> {
        self.current.read().await.as_ref().map(|m| m.version())
    }

    pub async fn shard(&self, id: &ShardId) -> RouterResult<Option<ShardInfo>> {
        Ok(self.snapshot().await?.shard(id).cloned())
    }

    pub async fn resolve(&self, namespace: &str, range: &KeyRange) -> RouterResult<Resolution> {
        self.snapshot().await?.resolve(namespace, range)
    }

    pub async fn resolve_key(&self, namespace: &str, key: i64) -> RouterResult<ShardId> {
        self.snapshot().await?.resolve_key(namespace, key)
    }
}
