/// Connection pool manager: per-session, per-shard connection lifecycle
///
/// Connections are opened lazily on first use. Before every operation the pool
/// looks at the slot's link state; a missing or faulted link is replaced by a
/// fresh connection attempt. There is no cached "shard is down" verdict: every
/// use of a faulted slot tries again, and the failure detector is updated with
/// the result of that attempt.
use crate::core::connection::ShardConnection;
use crate::core::session::Session;
use crate::core::ShardInfo;
use crate::error::{RouterError, RouterResult};
use crate::health::FailureDetector;
use crate::transport::ShardConnector;
use crate::utils::format_duration;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio::time::timeout;
use tracing::{debug, info};

/// A locked connection ready for one operation
pub type ConnectionGuard = OwnedMutexGuard<ShardConnection>;

pub struct ConnectionPool {
    connector: Arc<dyn ShardConnector>,
    detector: Arc<FailureDetector>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    connect_timeout: Duration,
    session_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn ShardConnector>,
        detector: Arc<FailureDetector>,
        connect_timeout: Duration,
        session_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            detector,
            sessions: RwLock::new(HashMap::new()),
            connect_timeout,
            session_timeout,
        }
    }

    pub fn detector(&self) -> Arc<FailureDetector> {
        Arc::clone(&self.detector)
    }

    /// Register a new session. No shard is contacted until first use.
    pub async fn open_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.id().to_string(), Arc::clone(&session));
        debug!("Opened session {}", session.id());
        session
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    /// Return the session's connection to `shard`, opening one if the slot is
    /// empty or faulted.
    ///
    /// A failed attempt only touches this shard's slot; the session's other
    /// connections are left as they are.
    pub async fn get_connection(
        &self,
        session: &Session,
        shard: &ShardInfo,
    ) -> RouterResult<ConnectionGuard> {
        let closed = || RouterError::SessionClosed {
            session: session.id().to_string(),
        };
        session.touch().await;

        let slot = session.slot(&shard.id).await.ok_or_else(closed)?;
        let mut conn = slot.lock_owned().await;
        // `close` may have released this slot while we waited for it
        if session.is_closed() {
            return Err(closed());
        }
        if !conn.needs_connect() {
            return Ok(conn);
        }

        if conn.is_faulted() {
            debug!(
                "Session {} reconnecting to faulted shard {}",
                session.id(),
                shard.id
            );
        }

        match timeout(self.connect_timeout, self.connector.connect(shard)).await {
            Ok(Ok(link)) => {
                conn.install(link);
                self.detector.record_success(&shard.id).await;
                Ok(conn)
            }
            Ok(Err(e)) => {
                let reason = format!("connect failed: {}", e);
                conn.fault(&reason);
                self.detector.record_failure(&shard.id, &reason).await;
                Err(RouterError::shard_unreachable(&shard.id, reason))
            }
            Err(_) => {
                let reason = "connect timed out";
                conn.fault(reason);
                self.detector.record_failure(&shard.id, reason).await;
                Err(RouterError::shard_timeout(&shard.id, "connect"))
            }
        }
    }

    /// Release every connection of a session and forget it
    pub async fn close_session(&self, session: &Session) -> usize {
        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session.id());
        }
        let released = session.close().await;
        info!(
            "Closed session {} after {} ({} connections released)",
            session.id(),
            format_duration(
                SystemTime::now()
                    .duration_since(session.created_at())
                    .unwrap_or_default()
            ),
            released
        );
        released
    }

    /// Close sessions idle for longer than the session timeout
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let candidates: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut expired = 0;
        for session in candidates {
            if session.idle_for().await > self.session_timeout {
                self.close_session(&session).await;
                expired += 1;
            }
        }

        if expired > 0 {
            debug!("Cleaned up {} expired sessions", expired);
        }
        expired
    }

    /// Live connections held by one session
    pub async fn connection_count(&self, session: &Session) -> usize {
        session.live_connection_count().await
    }

    /// Get total session count
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}
