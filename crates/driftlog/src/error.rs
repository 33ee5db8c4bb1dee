//! Error types for the listener, its collaborators, and the write path.

use std::sync::Arc;

use driftlog_kernel::KernelError;
use driftlog_types::{ChannelName, Conflict, RevisionError};

/// Failure reported by a hot or cold source.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel '{0}' not found")]
    UnknownChannel(ChannelName),

    #[error("source closed")]
    Closed,
}

/// Failure loading or saving checkpointed revisions.
#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a commit attempt.
///
/// A conflict is not a `CommitError`: it comes back as
/// `Ok(CommitResult::Conflicting)`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("commit still conflicting after {attempts} attempts (expected {}, actual {})", last.expected, last.actual)]
    RetriesExhausted { attempts: u32, last: Conflict },
}

/// What subscribers and `subscribe` callers observe.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ListenerError {
    #[error("source failed on channel '{channel}': {source}")]
    Source {
        channel: ChannelName,
        source: SourceError,
    },

    #[error("failed to load checkpoint for channel '{channel}': {source}")]
    CheckpointLoad {
        channel: ChannelName,
        source: Arc<CheckpointError>,
    },

    #[error("demand must be positive, got {requested}")]
    InvalidDemand { requested: u64 },

    #[error("tracked revisions rejected an update: {0}")]
    Revision(#[from] RevisionError),

    #[error("listener closed")]
    Closed,

    #[error("channel '{0}' is not attached")]
    Detached(ChannelName),
}
