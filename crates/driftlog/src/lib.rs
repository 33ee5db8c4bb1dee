//! # Driftlog
//!
//! Client layer for partitioned, append-only event logs.
//!
//! Driftlog sits between an application and a log transport and provides:
//!
//! - **Optimistic commits** - Every append carries the revision it expects
//!   to land at; a stale expectation is a [`CommitResult::Conflicting`],
//!   never a silent overwrite
//! - **Gap-free consumption** - Live (hot) delivery and historical (cold)
//!   replay are merged so each subscriber sees every record of every
//!   assigned partition exactly once, in order
//! - **Durable positions** - Consumed revisions are loaded and saved
//!   through a [`RevisionCallback`] across rebalances and restarts
//! - **Backpressure** - Subscribers pull with `request(n)`; sources are
//!   paused while anyone is out of demand
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Driftlog                            │
//! │  ┌───────────┐   ┌──────────┐   ┌────────────┐   ┌─────────┐  │
//! │  │ Committer │ → │  Kernel  │ → │ Hot / Cold │ → │Listener │  │
//! │  │  (write)  │   │(pure FSM)│   │  sources   │   │(per chan)│ │
//! │  └───────────┘   └──────────┘   └────────────┘   └─────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use driftlog::{ChannelSender, DriftlogConfig, MemoryCheckpoints, MemoryLog, RevisionAwareListener};
//!
//! let config = DriftlogConfig::load()?;
//! let log = MemoryLog::new(&config);
//! log.create_channel("orders", 4)?;
//!
//! let listener = RevisionAwareListener::new(&log, Arc::new(log.clone()), config);
//! let (sender, mut deliveries) = ChannelSender::new();
//! let subscription = listener
//!     .subscribe("orders", Box::new(sender), Arc::new(MemoryCheckpoints::new()))
//!     .await?;
//! subscription.request(64);
//! ```
//!
//! # Modules
//!
//! - **Write side**: [`commit`] - [`Committer`] and conflict retry
//! - **Read side**: [`source`], [`listener`], [`flow`], [`checkpoint`]
//! - **Reference transport**: [`memory`] - [`MemoryLog`]

pub mod checkpoint;
pub mod commit;
pub mod error;
pub mod flow;
pub mod listener;
pub mod memory;
pub mod source;

// Read side
pub use checkpoint::{FileCheckpoints, MemoryCheckpoints, RevisionCallback};
pub use flow::{Demand, FlowControlled, HotValve, Throttle, UNBOUNDED};
pub use listener::{
    Action, ChannelSender, ChannelSubscriber, Delivery, Phase, Publisher, Reconciler,
    RevisionAwareListener, Subscription,
};
pub use source::{
    ColdEvent, ColdSink, ColdSource, ColdSourceFactory, HotEvent, HotSink, HotSource,
    HotSourceFactory, RebalanceKind,
};

// Write side
pub use commit::{Committer, CommitterFactory, commit_with_retry};

// Errors
pub use error::{CheckpointError, CommitError, ListenerError, SourceError};

// Reference transport
pub use memory::{MemoryColdSource, MemoryCommitter, MemoryHotSource, MemoryLog};

// Re-export core types from driftlog-types
pub use driftlog_types::{
    ChannelName, ChannelRevisions, CommitResult, Committed, Conflict, Header, Position, Recorded,
    Revision, RevisionError, Revisions, Timestamp, UNKNOWN_OFFSET, Uncommitted, partition_for_key,
};

// Re-export configuration
pub use driftlog_config::{DriftlogConfig, ErrorPolicy, StartPosition};

// Re-export kernel errors surfaced through commits
pub use driftlog_kernel::KernelError;
