//! Commands accepted by the kernel.

use driftlog_types::{ChannelName, Timestamp, Uncommitted};
use serde::{Deserialize, Serialize};

/// A command to apply to the log state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Create a channel with a fixed number of partitions.
    CreateChannel {
        channel: ChannelName,
        partitions: u32,
    },

    /// Append one record if its expected revision matches the log head.
    Commit {
        attempt: Uncommitted,
        timestamp: Timestamp,
    },
}

impl Command {
    pub fn create_channel(channel: impl Into<ChannelName>, partitions: u32) -> Self {
        Command::CreateChannel {
            channel: channel.into(),
            partitions,
        }
    }

    pub fn commit(attempt: Uncommitted, timestamp: Timestamp) -> Self {
        Command::Commit { attempt, timestamp }
    }
}
