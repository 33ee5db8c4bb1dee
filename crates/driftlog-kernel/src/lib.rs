//! # driftlog-kernel: Functional core of the `Driftlog` commit protocol
//!
//! The kernel decides whether an append attempt is accepted. It receives
//! commands and produces a new state plus effects for the runtime to
//! execute.
//!
//! ## Key Principles
//!
//! - **No IO**: The kernel never touches disk, network, or any external resource
//! - **No clocks**: Commit timestamps are supplied by the caller
//! - **Pure functions**: `apply_committed(state, command) -> (state, effects)`
//!
//! ## Architecture
//!
//! - [`command`]: Commands that can be applied (`CreateChannel`, `Commit`)
//! - [`effects`]: Effects for the runtime to execute (`StorageAppend`, `Publish`)
//! - [`state`]: Per-channel, per-partition log heads
//! - [`kernel`]: The `apply_committed` function that ties it all together
//!
//! ## Example
//!
//! ```
//! use driftlog_kernel::{Command, State, apply_commit, apply_committed};
//! use driftlog_types::{ChannelName, Recorded, Revisions, Timestamp, Uncommitted};
//!
//! let (state, _) = apply_committed(State::new(), Command::create_channel("orders", 1)).unwrap();
//! let attempt = Uncommitted::new("orders", 0, Recorded::new("k", "v"), Revisions::from_pairs([(0, 0)]));
//!
//! let (state, result, _effects) = apply_commit(state, attempt, Timestamp::EPOCH).unwrap();
//! assert!(result.is_committed());
//! assert_eq!(state.head(&ChannelName::new("orders"), 0), Some(1));
//! ```

pub mod command;
pub mod effects;
pub mod kernel;
pub mod state;

#[cfg(test)]
mod tests;

pub use command::Command;
pub use effects::Effect;
pub use kernel::{KernelError, apply_commit, apply_committed};
pub use state::{ChannelLog, State};
