//! Tests for the in-memory transport.

use std::time::Duration;

use driftlog_config::DriftlogConfig;
use driftlog_kernel::KernelError;
use driftlog_types::{
    ChannelName, CommitResult, Conflict, Recorded, Revision, Revisions, Uncommitted,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use super::*;
use crate::commit::commit_with_retry;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

fn orders() -> ChannelName {
    ChannelName::new("orders")
}

fn log_with_orders(partitions: u32) -> MemoryLog {
    let log = MemoryLog::new(&DriftlogConfig::testing());
    log.create_channel(orders(), partitions)
        .expect("create channel");
    log
}

fn attempt(partition: u32, expected: u64) -> Uncommitted {
    Uncommitted::new(
        orders(),
        partition,
        Recorded::new(format!("key-{expected}"), format!("value-{expected}")),
        Revisions::from_pairs([(partition, expected)]),
    )
}

fn fill(log: &MemoryLog, partition: u32, count: u64) {
    for offset in 0..count {
        let result = log.append(attempt(partition, offset)).expect("append");
        assert!(result.is_committed());
    }
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("sender dropped")
}

async fn assert_quiet<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
    if let Ok(event) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

fn offset_of(event: &HotEvent) -> u64 {
    match event {
        HotEvent::Committed(c) => c.actual().offset,
        other => panic!("expected a record, got {other:?}"),
    }
}

// ============================================================================
// Log
// ============================================================================

#[test]
fn append_lands_at_head_and_advances_it() {
    let log = log_with_orders(2);

    let result = log.append(attempt(1, 0)).expect("append");
    let committed = result.committed().expect("committed");
    assert_eq!(committed.actual(), Revision::new(1, 0));
    assert_eq!(committed.next_expected(), Revision::new(1, 1));

    assert_eq!(log.head(&orders(), 1), Some(Revision::new(1, 1)));
    assert_eq!(
        log.heads(&orders()),
        Some(Revisions::from_pairs([(0, 0), (1, 1)]))
    );
    assert_eq!(log.read(&orders(), 1, 0, 10), vec![committed.clone()]);
}

#[test]
fn stale_expectation_conflicts_without_writing() {
    let log = log_with_orders(1);
    fill(&log, 0, 2);

    let result = log.append(attempt(0, 1)).expect("append");
    assert_eq!(
        result,
        CommitResult::Conflicting(Conflict {
            expected: Revision::new(0, 1),
            actual: Revision::new(0, 2),
        })
    );
    assert_eq!(log.read(&orders(), 0, 0, 10).len(), 2);
}

#[test]
fn timestamps_increase_with_every_commit() {
    let log = log_with_orders(1);
    fill(&log, 0, 5);
    let records = log.read(&orders(), 0, 0, 10);
    assert!(records.windows(2).all(|w| w[0].timestamp() < w[1].timestamp()));
}

#[test]
fn read_respects_offset_and_limit() {
    let log = log_with_orders(1);
    fill(&log, 0, 6);

    let offsets: Vec<u64> = log
        .read(&orders(), 0, 2, 3)
        .iter()
        .map(|c| c.actual().offset)
        .collect();
    assert_eq!(offsets, vec![2, 3, 4]);
    assert!(log.read(&orders(), 0, 6, 3).is_empty());
    assert!(log.read(&orders(), 9, 0, 3).is_empty());
}

#[test]
fn append_to_unknown_channel_fails() {
    let log = MemoryLog::default();
    let err = log.append(attempt(0, 0)).unwrap_err();
    assert_eq!(err, KernelError::ChannelNotFound(orders()));
}

#[test]
fn duplicate_channel_is_rejected() {
    let log = log_with_orders(1);
    let err = log.create_channel(orders(), 4).unwrap_err();
    assert_eq!(err, KernelError::ChannelExists(orders()));
    assert_eq!(log.partition_count(&orders()), Some(1));
}

// ============================================================================
// Committer
// ============================================================================

#[tokio::test]
async fn committer_is_bound_to_its_channel() {
    let log = log_with_orders(1);
    log.create_channel("payments", 1).expect("create channel");

    let committer = log.create_committer(&orders()).expect("committer");
    let result = committer.commit(attempt(0, 0)).await.expect("commit");
    assert!(result.is_committed());

    let mut foreign = attempt(0, 0);
    foreign.channel = ChannelName::new("payments");
    assert!(matches!(
        committer.commit(foreign).await,
        Err(CommitError::Transport(_))
    ));
}

#[test]
fn committer_for_unknown_channel_fails() {
    let log = MemoryLog::default();
    let err = log.create_committer(&orders()).err().expect("error");
    assert_eq!(err, CommitError::Kernel(KernelError::ChannelNotFound(orders())));
}

#[tokio::test]
async fn retry_rereads_and_lands_on_new_head() {
    let log = log_with_orders(1);
    fill(&log, 0, 3);
    let committer = log.create_committer(&orders()).expect("committer");

    let reader = log.clone();
    let committed = commit_with_retry(committer.as_ref(), attempt(0, 0), 5, |conflict| {
        let heads = reader.heads(&orders()).unwrap_or_default();
        assert_eq!(conflict.actual, Revision::new(0, 3));
        async move { Ok::<_, CommitError>(heads) }
    })
    .await
    .expect("retry");

    assert_eq!(committed.actual(), Revision::new(0, 3));
}

#[tokio::test]
async fn retry_gives_up_after_max_attempts() {
    let log = log_with_orders(1);
    fill(&log, 0, 1);
    let committer = log.create_committer(&orders()).expect("committer");

    let err = commit_with_retry(committer.as_ref(), attempt(0, 0), 3, |_| async {
        Ok::<_, CommitError>(Revisions::from_pairs([(0, 0)]))
    })
    .await
    .unwrap_err();

    assert_eq!(
        err,
        CommitError::RetriesExhausted {
            attempts: 3,
            last: Conflict {
                expected: Revision::new(0, 0),
                actual: Revision::new(0, 1),
            },
        }
    );
    assert_eq!(log.read(&orders(), 0, 0, 10).len(), 1);
}

// ============================================================================
// Hot source
// ============================================================================

#[tokio::test]
async fn hot_subscribe_assigns_then_publishes() {
    let log = log_with_orders(2);
    let (sink, mut rx) = HotSink::channel();
    let hot = log.create_hot_source(sink);

    assert_eq!(hot.subscribe(&orders()).await, Ok(2));
    assert_eq!(next(&mut rx).await, HotEvent::assigned("orders", vec![0, 1]));
    assert_eq!(log.hot_subscriber_count(&orders()), 1);

    fill(&log, 1, 2);
    assert_eq!(offset_of(&next(&mut rx).await), 0);
    assert_eq!(offset_of(&next(&mut rx).await), 1);

    // A second subscribe is a no-op.
    assert_eq!(hot.subscribe(&orders()).await, Ok(2));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn hot_subscribe_to_unknown_channel_fails() {
    let log = MemoryLog::default();
    let (sink, _rx) = HotSink::channel();
    let hot = log.create_hot_source(sink);

    assert_eq!(
        hot.subscribe(&orders()).await,
        Err(SourceError::UnknownChannel(orders()))
    );
    assert_eq!(log.hot_subscriber_count(&orders()), 0);
}

#[tokio::test]
async fn hot_unsubscribe_stops_delivery() {
    let log = log_with_orders(1);
    let (sink, mut rx) = HotSink::channel();
    let hot = log.create_hot_source(sink);
    hot.subscribe(&orders()).await.expect("subscribe");
    next(&mut rx).await;

    hot.unsubscribe(&orders()).await.expect("unsubscribe");
    assert_eq!(log.hot_subscriber_count(&orders()), 0);
    fill(&log, 0, 1);
    assert_quiet(&mut rx).await;

    assert_eq!(
        hot.unsubscribe(&orders()).await,
        Err(SourceError::UnknownChannel(orders()))
    );
}

#[tokio::test]
async fn muted_commits_are_stored_but_not_pushed() {
    let log = log_with_orders(1);
    let (sink, mut rx) = HotSink::channel();
    let hot = log.create_hot_source(sink);
    hot.subscribe(&orders()).await.expect("subscribe");
    next(&mut rx).await;

    log.mute_hot(&orders(), true);
    fill(&log, 0, 2);
    assert_quiet(&mut rx).await;

    log.mute_hot(&orders(), false);
    log.append(attempt(0, 2)).expect("append");
    assert_eq!(offset_of(&next(&mut rx).await), 2);
    assert_eq!(log.read(&orders(), 0, 0, 10).len(), 3);
}

#[tokio::test]
async fn paused_hot_source_holds_records_until_resumed() {
    let log = log_with_orders(1);
    let (sink, mut rx) = HotSink::channel();
    let hot = log.create_hot_source(sink);
    hot.subscribe(&orders()).await.expect("subscribe");
    next(&mut rx).await;

    hot.set_paused(&orders(), true);
    tokio::time::sleep(Duration::from_millis(20)).await;
    fill(&log, 0, 2);
    assert_quiet(&mut rx).await;

    hot.set_paused(&orders(), false);
    assert_eq!(offset_of(&next(&mut rx).await), 0);
    assert_eq!(offset_of(&next(&mut rx).await), 1);
}

#[tokio::test]
async fn rebalance_and_failure_hooks_reach_hot_subscribers() {
    let log = log_with_orders(4);
    let (sink, mut rx) = HotSink::channel();
    let hot = log.create_hot_source(sink);
    hot.subscribe(&orders()).await.expect("subscribe");
    next(&mut rx).await;

    log.revoke(&orders(), vec![2, 3]);
    assert_eq!(next(&mut rx).await, HotEvent::revoked("orders", vec![2, 3]));
    log.assign(&orders(), vec![3]);
    assert_eq!(next(&mut rx).await, HotEvent::assigned("orders", vec![3]));

    log.fail_hot(None, SourceError::Transport("broker gone".to_string()));
    assert_eq!(
        next(&mut rx).await,
        HotEvent::Failed {
            channel: None,
            error: SourceError::Transport("broker gone".to_string()),
        }
    );
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn dropping_hot_source_detaches_it() {
    let log = log_with_orders(1);
    let (sink, _rx) = HotSink::channel();
    let hot = log.create_hot_source(sink);
    hot.subscribe(&orders()).await.expect("subscribe");
    assert_eq!(log.hot_subscriber_count(&orders()), 1);

    drop(hot);
    assert_eq!(log.hot_subscriber_count(&orders()), 0);
}

// ============================================================================
// Cold source
// ============================================================================

#[tokio::test]
async fn cold_reads_forward_then_completes() {
    let log = log_with_orders(2);
    fill(&log, 0, 4);
    let (sink, mut rx) = ColdSink::channel();
    let cold = log.create_cold_source(&orders(), sink).expect("cold");

    cold.resume(Revisions::from_pairs([(0, 1)]))
        .await
        .expect("resume");
    for offset in 1..4 {
        match next(&mut rx).await {
            ColdEvent::Committed(c) => assert_eq!(c.actual(), Revision::new(0, offset)),
            other => panic!("expected a record, got {other:?}"),
        }
    }
    assert_eq!(next(&mut rx).await, ColdEvent::Completed);
}

#[tokio::test]
async fn cold_resume_never_rewinds() {
    let log = log_with_orders(1);
    fill(&log, 0, 3);
    let (sink, mut rx) = ColdSink::channel();
    let cold = MemoryColdSource::spawn(log.clone(), orders(), sink);

    cold.resume(Revisions::from_pairs([(0, 2)]))
        .await
        .expect("resume");
    cold.resume(Revisions::from_pairs([(0, 0)]))
        .await
        .expect("resume");
    assert_eq!(cold.positions(), Revisions::from_pairs([(0, 2)]));

    assert!(matches!(next(&mut rx).await, ColdEvent::Committed(c) if c.actual().offset == 2));
    assert_eq!(next(&mut rx).await, ColdEvent::Completed);
}

#[tokio::test]
async fn cold_picks_up_records_appended_while_reading() {
    let log = log_with_orders(1);
    let (sink, mut rx) = ColdSink::channel();
    let cold = log.create_cold_source(&orders(), sink).expect("cold");

    cold.resume(Revisions::from_pairs([(0, 0)]))
        .await
        .expect("resume");
    tokio::task::yield_now().await;
    fill(&log, 0, 2);

    let mut offsets = Vec::new();
    loop {
        match next(&mut rx).await {
            ColdEvent::Committed(c) => offsets.push(c.actual().offset),
            ColdEvent::Completed => break,
            ColdEvent::Failed(error) => panic!("cold read failed: {error}"),
        }
    }
    assert_eq!(offsets, vec![0, 1]);
}

#[tokio::test]
async fn stopped_partitions_are_not_read() {
    let log = log_with_orders(2);
    fill(&log, 0, 2);
    fill(&log, 1, 2);
    let (sink, mut rx) = ColdSink::channel();
    let cold = MemoryColdSource::spawn(log.clone(), orders(), sink);

    cold.set_paused(true);
    cold.resume(Revisions::from_pairs([(0, 0), (1, 0)]))
        .await
        .expect("resume");
    cold.stop(&[1]);
    assert_eq!(cold.positions(), Revisions::from_pairs([(0, 0)]));
    cold.set_paused(false);

    let mut partitions = Vec::new();
    loop {
        match next(&mut rx).await {
            ColdEvent::Committed(c) => partitions.push(c.actual().partition),
            ColdEvent::Completed => break,
            ColdEvent::Failed(error) => panic!("cold read failed: {error}"),
        }
    }
    assert_eq!(partitions, vec![0, 0]);
}

#[tokio::test]
async fn cold_source_for_unknown_channel_fails() {
    let log = MemoryLog::default();
    let (sink, _rx) = ColdSink::channel();
    assert!(matches!(
        log.create_cold_source(&orders(), sink),
        Err(SourceError::UnknownChannel(_))
    ));
}

#[tokio::test]
async fn fail_cold_reports_and_drop_detaches() {
    let log = log_with_orders(1);
    let (sink, mut rx) = ColdSink::channel();
    let cold = log.create_cold_source(&orders(), sink).expect("cold");
    assert_eq!(log.cold_reader_count(&orders()), 1);

    log.fail_cold(&orders(), SourceError::Transport("disk".to_string()));
    assert_eq!(
        next(&mut rx).await,
        ColdEvent::Failed(SourceError::Transport("disk".to_string()))
    );

    drop(cold);
    assert_eq!(log.cold_reader_count(&orders()), 0);
}
