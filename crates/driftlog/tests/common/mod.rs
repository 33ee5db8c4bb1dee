//! Shared fixtures for listener integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use driftlog::{
    ChannelName, ChannelSender, Delivery, DriftlogConfig, MemoryLog, Recorded, RevisionAwareListener,
    Uncommitted,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(150);

pub fn orders() -> ChannelName {
    ChannelName::new("orders")
}

/// A memory log with an `orders` channel and a listener over it.
pub struct Harness {
    pub log: MemoryLog,
    pub listener: RevisionAwareListener,
}

impl Harness {
    pub fn new(partitions: u32) -> Self {
        Self::with_config(partitions, DriftlogConfig::testing())
    }

    pub fn with_config(partitions: u32, config: DriftlogConfig) -> Self {
        let log = MemoryLog::new(&config);
        log.create_channel(orders(), partitions)
            .expect("create channel");
        let listener = RevisionAwareListener::new(&log, Arc::new(log.clone()), config);
        Self { log, listener }
    }

    /// A second listener over the same log, as after a process restart.
    pub fn restart(&self) -> RevisionAwareListener {
        RevisionAwareListener::new(
            &self.log,
            Arc::new(self.log.clone()),
            self.listener.config().clone(),
        )
    }

    /// Appends one record to `partition` at its current head.
    pub fn commit(&self, partition: u32) -> u64 {
        let heads = self.log.heads(&orders()).expect("channel exists");
        let offset = heads.get(partition);
        let attempt = Uncommitted::new(
            orders(),
            partition,
            Recorded::new(format!("order-{partition}-{offset}"), "{}"),
            heads,
        );
        let result = self.log.append(attempt).expect("append");
        assert!(result.is_committed(), "unexpected conflict: {result:?}");
        offset
    }

    pub fn commit_many(&self, partition: u32, count: u64) {
        for _ in 0..count {
            self.commit(partition);
        }
    }
}

pub fn sender() -> (Box<ChannelSender>, UnboundedReceiver<Delivery>) {
    let (sender, rx) = ChannelSender::new();
    (Box::new(sender), rx)
}

pub async fn next(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("subscriber channel closed")
}

/// Next delivered `(partition, offset)`; panics on an error delivery.
pub async fn next_revision(rx: &mut UnboundedReceiver<Delivery>) -> (u32, u64) {
    match next(rx).await {
        Ok(committed) => (committed.actual().partition, committed.actual().offset),
        Err(error) => panic!("unexpected error delivery: {error}"),
    }
}

pub async fn next_offsets(rx: &mut UnboundedReceiver<Delivery>, count: usize) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(next_revision(rx).await.1);
    }
    offsets
}

pub async fn assert_quiet(rx: &mut UnboundedReceiver<Delivery>) {
    if let Ok(delivery) = timeout(QUIET, rx.recv()).await {
        panic!("unexpected delivery: {delivery:?}");
    }
}

/// Polls `condition` until it holds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_phase(listener: &RevisionAwareListener, phase: driftlog::Phase) {
    let deadline = Instant::now() + WAIT;
    loop {
        let current = listener.phase(&orders()).await;
        if current == phase {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {phase:?}, still {current:?}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}

/// Polls until `partition` of `orders` is tracked past `offset`.
pub async fn wait_for_tracked(listener: &RevisionAwareListener, partition: u32, offset: u64) {
    let deadline = Instant::now() + WAIT;
    loop {
        let tracked = listener.tracked(&orders()).await.unwrap_or_default();
        if tracked.contains_partition(partition) && tracked.get(partition) > offset {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {partition}@{offset}, tracked {tracked}"
        );
        sleep(Duration::from_millis(10)).await;
    }
}
