//! The kernel - pure functional core of the commit protocol.
//!
//! The kernel applies commands to produce new state and effects. It is
//! completely pure: no IO, no clocks, no randomness. This makes it
//! deterministic and easy to test.
//!
//! # Example
//!
//! ```ignore
//! let state = State::new();
//! let cmd = Command::commit(attempt, Timestamp::now());
//!
//! let (new_state, effects) = apply_committed(state, cmd)?;
//! // Runtime executes effects...
//! ```

use driftlog_types::{
    ChannelName, CommitResult, Committed, Conflict, Revision, Timestamp, Uncommitted,
};

use crate::command::Command;
use crate::effects::Effect;
use crate::state::State;

/// Applies a command to the state, producing new state and effects.
///
/// A commit whose expected revision differs from the partition head is not
/// an error: it yields a single [`Effect::Rejected`] and leaves the state
/// untouched.
pub fn apply_committed(state: State, cmd: Command) -> Result<(State, Vec<Effect>), KernelError> {
    let mut effects = Vec::new();

    match cmd {
        Command::CreateChannel {
            channel,
            partitions,
        } => {
            // Precondition: channel doesn't exist yet
            if state.channel_exists(&channel) {
                return Err(KernelError::ChannelExists(channel));
            }
            // Precondition: a channel has at least one partition
            if partitions == 0 {
                return Err(KernelError::ZeroPartitions(channel));
            }

            effects.push(Effect::ChannelMetadataWrite {
                channel: channel.clone(),
                partitions,
            });

            let new_state = state.with_channel(channel.clone(), partitions);

            // Postcondition: every partition starts at offset zero
            debug_assert!((0..partitions).all(|p| new_state.head(&channel, p) == Some(0)));

            Ok((new_state, effects))
        }

        Command::Commit { attempt, timestamp } => {
            let Uncommitted {
                channel,
                partition,
                record,
                expected,
            } = attempt;

            // Precondition: channel must exist
            let log = state
                .channel(&channel)
                .ok_or_else(|| KernelError::ChannelNotFound(channel.clone()))?;

            // Precondition: partition must be in range
            let head = log
                .head(partition)
                .ok_or_else(|| KernelError::PartitionOutOfRange {
                    channel: channel.clone(),
                    partition,
                    partitions: log.partition_count(),
                })?;

            let actual = Revision::new(partition, head);
            let expected = Revision::new(partition, expected.get(partition));

            // Optimistic concurrency: expected must equal the current head
            if expected != actual {
                effects.push(Effect::Rejected(Conflict { expected, actual }));
                debug_assert_eq!(effects.len(), 1);
                return Ok((state, effects));
            }

            let committed = Committed::new(channel.clone(), record, actual, timestamp);
            let next = committed.next_expected();

            effects.push(Effect::StorageAppend(committed.clone()));
            effects.push(Effect::Publish(committed));

            // Postcondition: exactly 2 effects (storage + publish, in that order)
            debug_assert_eq!(effects.len(), 2);

            let new_state = state.with_advanced_head(&channel, partition);

            // Postcondition: the new head is where the next record lands
            assert_eq!(
                new_state.head(&channel, partition),
                Some(next.offset),
                "head disagrees with next expected revision {next}"
            );

            Ok((new_state, effects))
        }
    }
}

/// Applies one append attempt and reports its [`CommitResult`].
///
/// Convenience over [`apply_committed`] for the write path: the result is
/// extracted from the effects, which are still returned for the runtime
/// to execute.
pub fn apply_commit(
    state: State,
    attempt: Uncommitted,
    timestamp: Timestamp,
) -> Result<(State, CommitResult, Vec<Effect>), KernelError> {
    let (state, effects) = apply_committed(state, Command::commit(attempt, timestamp))?;

    let result = effects
        .iter()
        .find_map(|effect| match effect {
            Effect::StorageAppend(committed) => Some(CommitResult::Committed(committed.clone())),
            Effect::Rejected(conflict) => Some(CommitResult::Conflicting(*conflict)),
            _ => None,
        })
        .ok_or(KernelError::MissingOutcome)?;

    Ok((state, result, effects))
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("channel '{0}' already exists")]
    ChannelExists(ChannelName),

    #[error("channel '{0}' not found")]
    ChannelNotFound(ChannelName),

    #[error("channel '{0}' must have at least one partition")]
    ZeroPartitions(ChannelName),

    #[error("partition {partition} out of range for channel '{channel}' ({partitions} partitions)")]
    PartitionOutOfRange {
        channel: ChannelName,
        partition: u32,
        partitions: u32,
    },

    #[error("commit produced neither an append nor a rejection")]
    MissingOutcome,
}
