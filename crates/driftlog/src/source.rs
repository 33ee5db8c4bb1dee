//! Hot and cold source contracts.
//!
//! A [`HotSource`] pushes newly committed records and rebalance
//! notifications for every subscribed channel. A [`ColdSource`] replays
//! already committed records of one channel forward from explicit
//! positions and signals completion when nothing more is available.
//!
//! Sources report into a sink rather than through callbacks: a
//! [`HotSink`] or [`ColdSink`] handed to the factory. A sink either feeds
//! the listener's per-channel workers or, for standalone use and tests,
//! a plain `mpsc` channel.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use driftlog_types::{ChannelName, Committed, Revisions};
use tokio::sync::mpsc;

use crate::error::SourceError;
use crate::listener::worker::{ChannelCommand, Registry};

/// Direction of a partition ownership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebalanceKind {
    Assigned,
    Revoked,
}

/// Everything a hot source can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotEvent {
    /// A newly committed record.
    Committed(Committed),
    /// The transport changed which partitions of `channel` this consumer owns.
    Rebalance {
        channel: ChannelName,
        kind: RebalanceKind,
        partitions: Vec<u32>,
    },
    /// A transport failure. `None` affects every subscribed channel.
    Failed {
        channel: Option<ChannelName>,
        error: SourceError,
    },
}

impl HotEvent {
    pub fn assigned(channel: impl Into<ChannelName>, partitions: Vec<u32>) -> Self {
        HotEvent::Rebalance {
            channel: channel.into(),
            kind: RebalanceKind::Assigned,
            partitions,
        }
    }

    pub fn revoked(channel: impl Into<ChannelName>, partitions: Vec<u32>) -> Self {
        HotEvent::Rebalance {
            channel: channel.into(),
            kind: RebalanceKind::Revoked,
            partitions,
        }
    }

    /// The channel this event concerns, if it concerns only one.
    pub fn channel(&self) -> Option<&ChannelName> {
        match self {
            HotEvent::Committed(committed) => Some(committed.channel()),
            HotEvent::Rebalance { channel, .. } => Some(channel),
            HotEvent::Failed { channel, .. } => channel.as_ref(),
        }
    }
}

/// Everything a cold source can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdEvent {
    /// A replayed record.
    Committed(Committed),
    /// No further records are currently available.
    Completed,
    /// The read failed. Distinct from completion.
    Failed(SourceError),
}

// ============================================================================
// Sinks
// ============================================================================

#[derive(Debug, Clone)]
enum HotTarget {
    Listener(Weak<Registry>),
    Channel(mpsc::UnboundedSender<HotEvent>),
}

/// Where a hot source delivers its events.
#[derive(Debug, Clone)]
pub struct HotSink {
    target: HotTarget,
}

impl HotSink {
    pub(crate) fn listener(registry: &Arc<Registry>) -> Self {
        Self {
            target: HotTarget::Listener(Arc::downgrade(registry)),
        }
    }

    /// A sink that forwards every event into an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HotEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                target: HotTarget::Channel(tx),
            },
            rx,
        )
    }

    /// Delivers one event. Events for channels nobody listens to are dropped.
    pub fn deliver(&self, event: HotEvent) {
        match &self.target {
            HotTarget::Channel(tx) => {
                let _ = tx.send(event);
            }
            HotTarget::Listener(registry) => {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                match event.channel().cloned() {
                    Some(channel) => {
                        if !registry.send(&channel, ChannelCommand::Hot(event)) {
                            tracing::trace!(channel = %channel, "hot event for unattached channel dropped");
                        }
                    }
                    None => registry.broadcast(|| ChannelCommand::Hot(event.clone())),
                }
            }
        }
    }

    pub fn commit(&self, committed: Committed) {
        self.deliver(HotEvent::Committed(committed));
    }

    pub fn fail(&self, channel: Option<ChannelName>, error: SourceError) {
        self.deliver(HotEvent::Failed { channel, error });
    }
}

#[derive(Debug, Clone)]
enum ColdTarget {
    Worker {
        tx: mpsc::UnboundedSender<ChannelCommand>,
        generation: u64,
    },
    Channel(mpsc::UnboundedSender<ColdEvent>),
}

/// Where a cold source delivers its events.
///
/// A sink created by the listener is stamped with the generation of the
/// cold source it belongs to.
#[derive(Debug, Clone)]
pub struct ColdSink {
    target: ColdTarget,
}

impl ColdSink {
    pub(crate) fn worker(tx: mpsc::UnboundedSender<ChannelCommand>, generation: u64) -> Self {
        Self {
            target: ColdTarget::Worker { tx, generation },
        }
    }

    /// A sink that forwards every event into an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ColdEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                target: ColdTarget::Channel(tx),
            },
            rx,
        )
    }

    pub fn deliver(&self, event: ColdEvent) {
        match &self.target {
            ColdTarget::Worker { tx, generation } => {
                let _ = tx.send(ChannelCommand::Cold {
                    generation: *generation,
                    event,
                });
            }
            ColdTarget::Channel(tx) => {
                let _ = tx.send(event);
            }
        }
    }

    /// True once nobody will receive further events.
    pub fn is_closed(&self) -> bool {
        match &self.target {
            ColdTarget::Worker { tx, .. } => tx.is_closed(),
            ColdTarget::Channel(tx) => tx.is_closed(),
        }
    }
}

// ============================================================================
// Contracts
// ============================================================================

/// Push-based live subscription.
///
/// Delivery order within one partition matches commit order. Nothing is
/// guaranteed across partitions.
#[async_trait]
pub trait HotSource: Send + Sync {
    /// Starts delivery for `channel` and returns its partition count.
    async fn subscribe(&self, channel: &ChannelName) -> Result<u32, SourceError>;

    /// Stops delivery for `channel`.
    async fn unsubscribe(&self, channel: &ChannelName) -> Result<(), SourceError>;

    /// Stops or restarts pushing records of `channel`.
    fn set_paused(&self, channel: &ChannelName, paused: bool);
}

pub trait HotSourceFactory: Send + Sync {
    fn create_hot_source(&self, sink: HotSink) -> Arc<dyn HotSource>;
}

/// Pull-based resumable reader of one channel.
///
/// Dropping the source stops it.
#[async_trait]
pub trait ColdSource: Send + Sync {
    /// Starts or continues reading forward from each given position.
    async fn resume(&self, revisions: Revisions) -> Result<(), SourceError>;

    /// Ceases reading `partitions`.
    fn stop(&self, partitions: &[u32]);

    /// Stops or restarts delivering records.
    fn set_paused(&self, paused: bool);
}

pub trait ColdSourceFactory: Send + Sync {
    fn create_cold_source(
        &self,
        channel: &ChannelName,
        sink: ColdSink,
    ) -> Result<Box<dyn ColdSource>, SourceError>;
}
