/// Write acknowledgment state tracked on each shard connection
///
/// A connection remembers the outcome of exactly one write: the most recent.
/// The state advances `Idle -> WriteSent -> AckPending -> Resolved -> Idle`,
/// and a new write always restarts it from `WriteSent`.
use crate::core::ShardId;
use crate::error::{RouterError, RouterResult};
use std::fmt;

/// What happened to the last write on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The shard confirmed the write was applied
    Success,
    /// The shard responded and refused the write; details are the shard's own words
    ExplicitError { details: String },
    /// The shard went away while the write or its acknowledgment was in flight.
    /// The write may or may not have been applied.
    Unknown { reason: String },
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WriteOutcome::Success)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, WriteOutcome::Unknown { .. })
    }

    /// Convert into a `Result`, keeping the ambiguous case distinct
    pub fn into_result(self, shard: &ShardId) -> RouterResult<()> {
        match self {
            WriteOutcome::Success => Ok(()),
            WriteOutcome::ExplicitError { details } => Err(RouterError::ExplicitWriteError {
                shard: shard.clone(),
                details,
            }),
            WriteOutcome::Unknown { .. } => Err(RouterError::UnknownWriteOutcome {
                shard: shard.clone(),
            }),
        }
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Success => write!(f, "Success"),
            WriteOutcome::ExplicitError { details } => write!(f, "ExplicitError: {}", details),
            WriteOutcome::Unknown { reason } => write!(f, "Unknown: {}", reason),
        }
    }
}

/// Acknowledgment state machine of a single connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckState {
    #[default]
    Idle,
    /// The write is being handed to the link
    WriteSent,
    /// The link accepted the write; its outcome has not been asked for yet
    AckPending,
    /// The outcome is known and waiting to be reported
    Resolved(WriteOutcome),
}

impl AckState {
    /// A new write discards whatever was tracked before
    pub fn begin_write(&mut self) {
        *self = AckState::WriteSent;
    }

    /// The link took the write without an I/O error
    pub fn write_handed_off(&mut self) {
        if *self == AckState::WriteSent {
            *self = AckState::AckPending;
        }
    }

    /// The physical channel the write travelled on is gone.
    ///
    /// Any write still in flight or awaiting acknowledgment becomes `Unknown`;
    /// an outcome already resolved is kept.
    pub fn channel_lost(&mut self, reason: &str) {
        if matches!(self, AckState::WriteSent | AckState::AckPending) {
            *self = AckState::Resolved(WriteOutcome::Unknown {
                reason: reason.to_string(),
            });
        }
    }

    pub fn resolve(&mut self, outcome: WriteOutcome) {
        *self = AckState::Resolved(outcome);
    }

    pub fn is_awaiting_ack(&self) -> bool {
        *self == AckState::AckPending
    }

    /// Report a resolved outcome and return to `Idle`
    pub fn take_resolved(&mut self) -> Option<WriteOutcome> {
        match std::mem::take(self) {
            AckState::Resolved(outcome) => Some(outcome),
            other => {
                *self = other;
                None
            }
        }
    }

    pub fn reset(&mut self) {
        *self = AckState::Idle;
    }
}
