/// In-process shard transport
///
/// `MemoryCluster` hosts shards inside the router process. Shards can be
/// stopped and started again; stopping one breaks every link opened to it,
/// the same way a killed shard process resets its TCP connections. A restart
/// does not revive old links, so callers must reconnect.
use super::store::ShardStore;
use super::{FindReply, FindRequest, InsertRequest, ShardConnector, ShardLink, WriteStatus};
use crate::core::{ShardId, ShardInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A shard living in the router process
pub struct MemoryShard {
    id: ShardId,
    store: Arc<ShardStore>,
    running: AtomicBool,
    /// Bumped on every stop so links from an earlier run stay broken
    generation: AtomicU64,
    latency_ms: AtomicU64,
}

impl MemoryShard {
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            store: Arc::new(ShardStore::new()),
            running: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn store(&self) -> Arc<ShardStore> {
        Arc::clone(&self.store)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the shard, resetting every open link
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Memory shard {} stopped", self.id);
    }

    /// Start the shard again. Data survives; links do not.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Memory shard {} started", self.id);
    }

    /// Delay applied to every connect and request
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn check_alive(&self, generation: u64) -> io::Result<()> {
        if !self.is_running() || self.generation.load(Ordering::SeqCst) != generation {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("connection to shard {} reset", self.id),
            ));
        }
        Ok(())
    }
}

/// Connector and registry for in-process shards
#[derive(Clone, Default)]
pub struct MemoryCluster {
    shards: Arc<RwLock<HashMap<ShardId, Arc<MemoryShard>>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a running shard, replacing any shard with the same id
    pub async fn add_shard(&self, id: ShardId) -> Arc<MemoryShard> {
        let shard = Arc::new(MemoryShard::new(id.clone()));
        let mut shards = self.shards.write().await;
        shards.insert(id, Arc::clone(&shard));
        shard
    }

    pub async fn shard(&self, id: &ShardId) -> Option<Arc<MemoryShard>> {
        let shards = self.shards.read().await;
        shards.get(id).cloned()
    }
}

#[async_trait]
impl ShardConnector for MemoryCluster {
    async fn connect(&self, info: &ShardInfo) -> io::Result<Box<dyn ShardLink>> {
        let shard = self.shard(&info.id).await.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such shard {}", info.id),
            )
        })?;

        shard.delay().await;
        if !shard.is_running() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("shard {} refused connection", info.id),
            ));
        }

        let generation = shard.generation.load(Ordering::SeqCst);
        Ok(Box::new(MemoryLink {
            shard,
            generation,
            last_write: WriteStatus::NoWrite,
        }))
    }
}

/// A link to a `MemoryShard`. The shard-side last-write record lives here,
/// one per link.
pub struct MemoryLink {
    shard: Arc<MemoryShard>,
    generation: u64,
    last_write: WriteStatus,
}

#[async_trait]
impl ShardLink for MemoryLink {
    async fn find(&mut self, request: &FindRequest) -> io::Result<FindReply> {
        self.shard.delay().await;
        self.shard.check_alive(self.generation)?;
        Ok(self.shard.store.find(request).await)
    }

    async fn insert(&mut self, request: &InsertRequest) -> io::Result<()> {
        self.shard.delay().await;
        self.shard.check_alive(self.generation)?;
        self.last_write = self.shard.store.insert(request).await;
        Ok(())
    }

    async fn last_write_status(&mut self) -> io::Result<WriteStatus> {
        self.shard.delay().await;
        self.shard.check_alive(self.generation)?;
        Ok(self.last_write.clone())
    }
}
