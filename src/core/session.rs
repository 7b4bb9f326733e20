/// Client sessions and their private shard connections
use crate::core::connection::ShardConnection;
use crate::core::ShardId;
use crate::utils::generate_id;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, RwLock};

/// A connection slot inside a session. Each slot is locked independently, so
/// work against one shard never waits on another shard's connection.
pub type ConnectionSlot = Arc<Mutex<ShardConnection>>;

/// Where the session's most recent write went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastWrite {
    /// Handed to the session's connection for this shard
    Sent(ShardId),
    /// Could not be handed to any connection for this shard
    Unsent(ShardId),
}

impl LastWrite {
    pub fn shard(&self) -> &ShardId {
        match self {
            LastWrite::Sent(shard) | LastWrite::Unsent(shard) => shard,
        }
    }
}

/// A logical client identity owning at most one connection per shard
pub struct Session {
    id: String,
    created_at: SystemTime,
    last_activity: RwLock<SystemTime>,
    connections: Mutex<FnvHashMap<ShardId, ConnectionSlot>>,
    last_write: Mutex<Option<LastWrite>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new() -> Self {
        let now = SystemTime::now();
        Self {
            id: generate_id("session"),
            created_at: now,
            last_activity: RwLock::new(now),
            connections: Mutex::new(FnvHashMap::default()),
            last_write: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn touch(&self) {
        *self.last_activity.write().await = SystemTime::now();
    }

    /// Time since the session was last used
    pub async fn idle_for(&self) -> Duration {
        let last = *self.last_activity.read().await;
        SystemTime::now().duration_since(last).unwrap_or_default()
    }

    /// The slot for `shard`, created empty on first use. `None` once the
    /// session is closed.
    pub async fn slot(&self, shard: &ShardId) -> Option<ConnectionSlot> {
        let mut connections = self.connections.lock().await;
        if self.is_closed() {
            return None;
        }
        Some(Arc::clone(
            connections
                .entry(shard.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ShardConnection::new(shard.clone())))),
        ))
    }

    /// The slot for `shard` if one was ever created
    pub async fn existing_slot(&self, shard: &ShardId) -> Option<ConnectionSlot> {
        let connections = self.connections.lock().await;
        connections.get(shard).cloned()
    }

    /// Shards this session holds a slot for, ordered by id
    pub async fn shard_ids(&self) -> Vec<ShardId> {
        let connections = self.connections.lock().await;
        let mut ids: Vec<ShardId> = connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of slots currently holding a usable link
    pub async fn live_connection_count(&self) -> usize {
        let slots: Vec<ConnectionSlot> = {
            let connections = self.connections.lock().await;
            connections.values().cloned().collect()
        };

        let mut live = 0;
        for slot in slots {
            if !slot.lock().await.needs_connect() {
                live += 1;
            }
        }
        live
    }

    /// Record where a new write is going, returning the previous record
    pub async fn replace_last_write(&self, write: LastWrite) -> Option<LastWrite> {
        self.last_write.lock().await.replace(write)
    }

    /// Where the most recent write went, without consuming it
    pub async fn last_write(&self) -> Option<LastWrite> {
        self.last_write.lock().await.clone()
    }

    pub async fn take_last_write(&self) -> Option<LastWrite> {
        self.last_write.lock().await.take()
    }

    /// Close every connection and mark the session closed. Returns the number
    /// of slots released.
    pub async fn close(&self) -> usize {
        let slots: Vec<ConnectionSlot> = {
            let mut connections = self.connections.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            connections.drain().map(|(_, slot)| slot).collect()
        };

        for slot in &slots {
            slot.lock().await.close();
        }
        self.last_write.lock().await.take();
        slots.len()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
