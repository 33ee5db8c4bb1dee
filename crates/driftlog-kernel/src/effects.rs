//! Effects produced by the kernel.
//!
//! Effects represent side effects that the runtime must execute after
//! a command is applied. The kernel is pure - it produces effects but
//! never executes them directly.

use driftlog_types::{ChannelName, Committed, Conflict};
use serde::{Deserialize, Serialize};

/// An effect to be executed by the runtime, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Persist channel metadata after creation.
    ChannelMetadataWrite {
        channel: ChannelName,
        partitions: u32,
    },

    /// Write the accepted record to durable storage.
    StorageAppend(Committed),

    /// Hand the accepted record to the hot-publish path.
    ///
    /// Always follows the matching `StorageAppend`: a record is never
    /// visible to live readers before it is stored.
    Publish(Committed),

    /// The attempt was rejected; nothing was written.
    Rejected(Conflict),
}
