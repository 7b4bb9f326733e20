/// Passive failure detection for shard connections
///
/// Nothing in this module polls. Health changes only as a side effect of real
/// traffic: an I/O error or timeout marks a shard unreachable, and the next
/// successful connection attempt marks it healthy again. The recorded status
/// is advisory; it never stops the pool from trying a shard.
use crate::core::ShardId;
use fnv::FnvHashMap;
use std::fmt;
use std::time::SystemTime;
use tokio::sync::RwLock;

/// Health status of a shard
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unreachable { reason: String },
    /// No traffic has reached the shard yet
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unreachable { reason } => write!(f, "Unreachable: {}", reason),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy shard
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// State of one physical connection as seen by the pool
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No link has been opened yet, or it was closed
    #[default]
    Disconnected,
    Connected,
    /// The last operation hit an I/O error or timed out; reconnect before use
    Faulted { reason: String },
}

impl LinkState {
    pub fn is_usable(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Per-shard health record
#[derive(Debug, Clone)]
pub struct ShardHealth {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_change: Option<SystemTime>,
}

impl Default for ShardHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            last_change: None,
        }
    }
}

/// Shared, advisory health registry fed by observed failures
#[derive(Default)]
pub struct FailureDetector {
    shards: RwLock<FnvHashMap<ShardId, ShardHealth>>,
}

impl FailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an I/O failure or timeout observed during a real operation
    pub async fn record_failure(&self, shard: &ShardId, reason: &str) {
        let mut shards = self.shards.write().await;
        let health = shards.entry(shard.clone()).or_default();

        health.consecutive_failures += 1;
        if health.status.is_healthy() || health.status == HealthStatus::Unknown {
            tracing::warn!("Shard {} marked unreachable: {}", shard, reason);
            health.last_change = Some(SystemTime::now());
        }
        health.status = HealthStatus::Unreachable {
            reason: reason.to_string(),
        };
    }

    /// Record a successful connection attempt
    pub async fn record_success(&self, shard: &ShardId) {
        let mut shards = self.shards.write().await;
        let health = shards.entry(shard.clone()).or_default();

        if !health.status.is_healthy() {
            if matches!(health.status, HealthStatus::Unreachable { .. }) {
                tracing::info!("Shard {} reachable again", shard);
            }
            health.status = HealthStatus::Healthy;
            health.last_change = Some(SystemTime::now());
        }
        health.consecutive_failures = 0;
    }

    pub async fn status(&self, shard: &ShardId) -> HealthStatus {
        let shards = self.shards.read().await;
        shards
            .get(shard)
            .map(|h| h.status.clone())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Health of every shard seen so far, ordered by shard id
    pub async fn snapshot(&self) -> Vec<(ShardId, ShardHealth)> {
        let shards = self.shards.read().await;
        let mut all: Vec<_> = shards
            .iter()
            .map(|(id, health)| (id.clone(), health.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
