/// Physical connection bound to one (session, shard) pair
///
/// The connection owns its link, its link state and the acknowledgment state
/// of the last write sent over it. It never reconnects on its own: the pool
/// checks `needs_connect()` at the start of each operation and installs a new
/// link when required.
use crate::core::ack::{AckState, WriteOutcome};
use crate::core::{Document, ShardId};
use crate::error::{RouterError, RouterResult};
use crate::health::LinkState;
use crate::transport::{FindReply, FindRequest, InsertRequest, ShardLink, WriteStatus};
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

pub struct ShardConnection {
    shard: ShardId,
    link: Option<Box<dyn ShardLink>>,
    state: LinkState,
    ack: AckState,
    /// Number of links installed over the connection's lifetime
    links_opened: u64,
}

impl fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConnection")
            .field("shard", &self.shard)
            .field("state", &self.state)
            .field("ack", &self.ack)
            .field("links_opened", &self.links_opened)
            .finish()
    }
}

impl ShardConnection {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            link: None,
            state: LinkState::Disconnected,
            ack: AckState::Idle,
            links_opened: 0,
        }
    }

    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn links_opened(&self) -> u64 {
        self.links_opened
    }

    pub fn is_faulted(&self) -> bool {
        matches!(self.state, LinkState::Faulted { .. })
    }

    /// Whether a new link must be opened before the next operation
    pub fn needs_connect(&self) -> bool {
        self.link.is_none() || !self.state.is_usable()
    }

    /// Install a freshly opened link. A write tracked on the previous link can
    /// no longer be confirmed.
    pub fn install(&mut self, link: Box<dyn ShardLink>) {
        self.ack.channel_lost("connection was replaced before the write was acknowledged");
        self.link = Some(link);
        self.state = LinkState::Connected;
        self.links_opened += 1;
    }

    /// Drop the link after an I/O error or timeout
    pub fn fault(&mut self, reason: &str) {
        debug!("Connection to shard {} faulted: {}", self.shard, reason);
        self.link = None;
        self.state = LinkState::Faulted {
            reason: reason.to_string(),
        };
        self.ack.channel_lost(reason);
    }

    /// Release the link without recording a fault
    pub fn close(&mut self) {
        self.link = None;
        self.state = LinkState::Disconnected;
        self.ack.channel_lost("connection closed");
    }

    /// Forget any tracked write outcome
    pub fn discard_outcome(&mut self) {
        self.ack.reset();
    }

    fn link_mut(&mut self) -> RouterResult<&mut Box<dyn ShardLink>> {
        let shard = self.shard.clone();
        self.link
            .as_mut()
            .ok_or_else(|| RouterError::shard_unreachable(&shard, "connection not established"))
    }

    /// Map a transport failure onto the connection and the error taxonomy
    fn fail(&mut self, operation: &str, error: Option<io::Error>) -> RouterError {
        match error {
            // Refused before any byte was written; the link is still clean
            Some(e) if e.kind() == io::ErrorKind::InvalidInput => RouterError::invalid_document(
                format!("{} not sent to shard {}: {}", operation, self.shard, e),
            ),
            Some(e) if e.kind() == io::ErrorKind::InvalidData => {
                self.fault(&format!("{} returned a malformed frame", operation));
                RouterError::protocol(format!("shard {}: {}", self.shard, e))
            }
            Some(e) => {
                let reason = format!("{} failed: {}", operation, e);
                self.fault(&reason);
                RouterError::shard_unreachable(&self.shard, reason)
            }
            None => {
                self.fault(&format!("{} timed out", operation));
                RouterError::shard_timeout(&self.shard, operation)
            }
        }
    }

    /// Run a find on this connection
    pub async fn find(
        &mut self,
        request: &FindRequest,
        op_timeout: Duration,
    ) -> RouterResult<Vec<Document>> {
        let link = self.link_mut()?;
        match timeout(op_timeout, link.find(request)).await {
            Ok(Ok(FindReply::Documents { documents })) => Ok(documents),
            Ok(Ok(FindReply::Error { message })) => Err(RouterError::RemoteError {
                shard: self.shard.clone(),
                message,
            }),
            Ok(Err(e)) => Err(self.fail("find", Some(e))),
            Err(_) => Err(self.fail("find", None)),
        }
    }

    /// Hand a write to the shard and start tracking its outcome.
    ///
    /// On `Ok` the outcome is pending and must be asked for with
    /// [`ack_last_write`](Self::ack_last_write). On `Err` the outcome is
    /// already resolved: unknown when the shard may have received the write,
    /// an explicit error when the write was refused before being sent.
    pub async fn send_write(
        &mut self,
        request: &InsertRequest,
        op_timeout: Duration,
    ) -> RouterResult<()> {
        self.ack.begin_write();
        let link = self.link_mut()?;
        match timeout(op_timeout, link.insert(request)).await {
            Ok(Ok(())) => {
                self.ack.write_handed_off();
                Ok(())
            }
            Ok(Err(e)) => {
                let error = self.fail("insert", Some(e));
                if let RouterError::InvalidDocument { message } = &error {
                    self.ack.resolve(WriteOutcome::ExplicitError {
                        details: message.clone(),
                    });
                }
                Err(error)
            }
            Err(_) => Err(self.fail("insert", None)),
        }
    }

    /// Report what happened to the last write on this connection.
    ///
    /// The query goes over the same link the write used; if that link is gone
    /// the answer is `Unknown`. Reporting returns the state to idle.
    pub async fn ack_last_write(&mut self, op_timeout: Duration) -> RouterResult<WriteOutcome> {
        if self.ack.is_awaiting_ack() {
            let outcome = match self.link.as_mut() {
                None => WriteOutcome::Unknown {
                    reason: "connection lost before acknowledgment".to_string(),
                },
                Some(link) => match timeout(op_timeout, link.last_write_status()).await {
                    Ok(Ok(WriteStatus::Applied)) => WriteOutcome::Success,
                    Ok(Ok(WriteStatus::Rejected { message })) => {
                        WriteOutcome::ExplicitError { details: message }
                    }
                    Ok(Ok(WriteStatus::NoWrite)) => WriteOutcome::Unknown {
                        reason: "shard has no record of the write".to_string(),
                    },
                    Ok(Err(e)) => {
                        let reason = format!("acknowledgment query failed: {}", e);
                        self.fault(&reason);
                        WriteOutcome::Unknown { reason }
                    }
                    Err(_) => {
                        let reason = "acknowledgment query timed out".to_string();
                        self.fault(&reason);
                        WriteOutcome::Unknown { reason }
                    }
                },
            };
            self.ack.resolve(outcome);
        } else if self.ack == AckState::WriteSent {
            // The send never returned; whatever reached the shard is unknowable
            self.ack.channel_lost("write interrupted before hand-off");
        }

        self.ack.take_resolved().ok_or(RouterError::NoPendingWrite)
    }
}
