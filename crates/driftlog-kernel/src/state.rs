//! Kernel state management.
//!
//! The kernel tracks every channel and the head of each of its partitions:
//! the offset the next accepted record will land at. State transitions take
//! ownership and return a new state.

use std::collections::BTreeMap;

use driftlog_types::{ChannelName, Revision};
use serde::{Deserialize, Serialize};

/// Partition heads of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLog {
    heads: Vec<u64>,
}

impl ChannelLog {
    fn new(partitions: u32) -> Self {
        Self {
            heads: vec![0; partitions as usize],
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.heads.len() as u32
    }

    /// Offset the next record on `partition` will land at.
    pub fn head(&self, partition: u32) -> Option<u64> {
        self.heads.get(partition as usize).copied()
    }
}

/// The kernel's in-memory state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct State {
    channels: BTreeMap<ChannelName, ChannelLog>,
}

impl State {
    /// Creates a new empty state.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, channel: &ChannelName) -> Option<&ChannelLog> {
        self.channels.get(channel)
    }

    pub fn channel_exists(&self, channel: &ChannelName) -> bool {
        self.channels.contains_key(channel)
    }

    /// Head offset of one partition, if the channel and partition exist.
    pub fn head(&self, channel: &ChannelName, partition: u32) -> Option<u64> {
        self.channels.get(channel)?.head(partition)
    }

    /// Head of one partition as a [`Revision`].
    pub fn head_revision(&self, channel: &ChannelName, partition: u32) -> Option<Revision> {
        self.head(channel, partition)
            .map(|offset| Revision::new(partition, offset))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub(crate) fn with_channel(mut self, channel: ChannelName, partitions: u32) -> Self {
        self.channels.insert(channel, ChannelLog::new(partitions));
        self
    }

    /// Advances one partition head by one record.
    ///
    /// Internal to the kernel - external code should use `apply_committed`
    /// which validates the precondition first.
    pub(crate) fn with_advanced_head(mut self, channel: &ChannelName, partition: u32) -> Self {
        if let Some(slot) = self
            .channels
            .get_mut(channel)
            .and_then(|log| log.heads.get_mut(partition as usize))
        {
            *slot += 1;
        }
        self
    }
}
