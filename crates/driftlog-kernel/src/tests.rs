//! Unit tests for driftlog-kernel
//!
//! The kernel is pure (no IO), making it ideal for unit testing.
//! Every code path can be tested without mocks.

use driftlog_types::{
    ChannelName, CommitResult, Conflict, Recorded, Revision, Revisions, Timestamp, Uncommitted,
};
use test_case::test_case;

use crate::command::Command;
use crate::effects::Effect;
use crate::kernel::{KernelError, apply_commit, apply_committed};
use crate::state::State;

// ============================================================================
// Test Helpers
// ============================================================================

fn orders() -> ChannelName {
    ChannelName::new("orders")
}

fn state_with_orders(partitions: u32) -> State {
    let (state, _) = apply_committed(State::new(), Command::create_channel(orders(), partitions))
        .expect("failed to create test channel");
    state
}

fn attempt(partition: u32, expected: u64) -> Uncommitted {
    Uncommitted::new(
        orders(),
        partition,
        Recorded::new(format!("key-{expected}"), format!("value-{expected}")),
        Revisions::from_pairs([(partition, expected)]),
    )
}

// ============================================================================
// CreateChannel Tests
// ============================================================================

#[test]
fn create_channel_starts_every_partition_at_zero() {
    let state = state_with_orders(3);

    assert!(state.channel_exists(&orders()));
    for partition in 0..3 {
        assert_eq!(state.head(&orders(), partition), Some(0));
    }
    assert_eq!(state.head(&orders(), 3), None);
}

#[test]
fn create_channel_writes_metadata() {
    let (_, effects) =
        apply_committed(State::new(), Command::create_channel(orders(), 2)).expect("create");
    assert_eq!(
        effects,
        vec![Effect::ChannelMetadataWrite {
            channel: orders(),
            partitions: 2
        }]
    );
}

#[test]
fn create_duplicate_channel_fails() {
    let state = state_with_orders(1);
    let result = apply_committed(state, Command::create_channel(orders(), 1));
    assert!(matches!(result, Err(KernelError::ChannelExists(name)) if name == orders()));
}

#[test]
fn create_channel_without_partitions_fails() {
    let result = apply_committed(State::new(), Command::create_channel(orders(), 0));
    assert!(matches!(result, Err(KernelError::ZeroPartitions(_))));
}

// ============================================================================
// Commit Tests
// ============================================================================

#[test]
fn commit_at_head_is_accepted() {
    let state = state_with_orders(1);
    let (state, result, effects) =
        apply_commit(state, attempt(0, 0), Timestamp::from_nanos(7)).expect("commit");

    let CommitResult::Committed(committed) = result else {
        panic!("expected commit, got {result:?}");
    };
    assert_eq!(committed.actual(), Revision::new(0, 0));
    assert_eq!(committed.next_expected(), Revision::new(0, 1));
    assert_eq!(committed.timestamp(), Timestamp::from_nanos(7));
    assert_eq!(state.head(&orders(), 0), Some(1));

    // Publish-after-commit: storage first, then the hot path
    assert_eq!(
        effects,
        vec![
            Effect::StorageAppend(committed.clone()),
            Effect::Publish(committed)
        ]
    );
}

#[test]
fn each_commit_lands_where_the_previous_one_said_next() {
    let mut state = state_with_orders(2);
    for expected in 0..5 {
        let (next_state, result, _) =
            apply_commit(state, attempt(1, expected), Timestamp::EPOCH).expect("commit");
        let committed = result.committed().cloned().expect("accepted");
        assert_eq!(committed.actual(), Revision::new(1, expected));
        assert_eq!(
            next_state.head(&orders(), 1),
            Some(committed.next_expected().offset)
        );
        state = next_state;
    }
    assert_eq!(state.head(&orders(), 0), Some(0));
}

#[test_case(1; "expected ahead of head")]
#[test_case(u64::MAX; "expected unknown")]
fn commit_with_wrong_expectation_conflicts(expected: u64) {
    let state = state_with_orders(1);
    let before = state.clone();

    let (state, result, effects) =
        apply_commit(state, attempt(0, expected), Timestamp::EPOCH).expect("commit");

    let conflict = Conflict {
        expected: Revision::new(0, expected),
        actual: Revision::new(0, 0),
    };
    assert_eq!(result, CommitResult::Conflicting(conflict));
    assert_eq!(effects, vec![Effect::Rejected(conflict)]);
    assert_eq!(state, before, "a conflict must not change the log");
}

#[test]
fn stale_writer_conflicts_after_concurrent_commit() {
    let state = state_with_orders(1);
    let (state, _, _) = apply_commit(state, attempt(0, 0), Timestamp::EPOCH).expect("first");

    // A second writer that read the same head loses
    let (state, result, _) = apply_commit(state, attempt(0, 0), Timestamp::EPOCH).expect("second");
    assert_eq!(
        result.conflict().map(|c| c.actual),
        Some(Revision::new(0, 1))
    );
    assert_eq!(state.head(&orders(), 0), Some(1));
}

#[test]
fn partitions_advance_independently() {
    let state = state_with_orders(2);
    let (state, _, _) = apply_commit(state, attempt(1, 0), Timestamp::EPOCH).expect("p1");
    let (state, _, _) = apply_commit(state, attempt(1, 1), Timestamp::EPOCH).expect("p1");

    assert_eq!(state.head(&orders(), 0), Some(0));
    assert_eq!(state.head(&orders(), 1), Some(2));
}

#[test]
fn commit_to_unknown_channel_fails() {
    let result = apply_commit(State::new(), attempt(0, 0), Timestamp::EPOCH);
    assert!(matches!(result, Err(KernelError::ChannelNotFound(_))));
}

#[test]
fn commit_to_out_of_range_partition_fails() {
    let state = state_with_orders(2);
    let result = apply_commit(state, attempt(5, 0), Timestamp::EPOCH);
    assert!(matches!(
        result,
        Err(KernelError::PartitionOutOfRange {
            partition: 5,
            partitions: 2,
            ..
        })
    ));
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Successful commits land at the previous head and expect head + 1;
        /// conflicting commits report the true head and change nothing.
        #[test]
        fn commits_are_monotonic_and_conflicts_are_exact(
            expectations in prop::collection::vec(0u64..12, 1..40),
        ) {
            let mut state = state_with_orders(1);
            let mut head = 0u64;

            for expected in expectations {
                let before = state.clone();
                let (next, result, _) = apply_commit(state, attempt(0, expected), Timestamp::EPOCH)
                    .expect("commit");
                state = next;

                match result {
                    CommitResult::Committed(c) => {
                        prop_assert_eq!(expected, head);
                        prop_assert_eq!(c.actual(), Revision::new(0, head));
                        prop_assert_eq!(c.next_expected().offset, head + 1);
                        head += 1;
                    }
                    CommitResult::Conflicting(conflict) => {
                        prop_assert_ne!(expected, head);
                        prop_assert_eq!(conflict.expected, Revision::new(0, expected));
                        prop_assert_eq!(conflict.actual, Revision::new(0, head));
                        prop_assert_eq!(&state, &before);
                    }
                }
                prop_assert_eq!(state.head(&orders(), 0), Some(head));
            }
        }

        #[test]
        fn replay_determinism(partitions in 1u32..5, writes in prop::collection::vec((0u32..5, 0u64..4), 0..30)) {
            let run = || {
                let mut state = state_with_orders(partitions);
                let mut results = Vec::new();
                for (partition, expected) in &writes {
                    match apply_commit(state.clone(), attempt(*partition, *expected), Timestamp::EPOCH) {
                        Ok((next, result, _)) => {
                            state = next;
                            results.push(Some(result));
                        }
                        Err(_) => results.push(None),
                    }
                }
                (state, results)
            };
            prop_assert_eq!(run(), run());
        }
    }
}
