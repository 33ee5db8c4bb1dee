//! In-memory reference transport.
//!
//! [`MemoryLog`] runs the commit kernel over an in-process log and
//! provides all three transport roles: a [`Committer`] per channel, a hot
//! source built on a `tokio::sync::broadcast` feed per channel, and cold
//! readers that replay stored records. It also exposes hooks to simulate
//! what real transports do to a consumer: rebalances, transport errors,
//! and lost live records.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use driftlog_config::DriftlogConfig;
use driftlog_kernel::{Command, Effect, KernelError, State, apply_commit, apply_committed};
use driftlog_types::{
    ChannelName, CommitResult, Committed, Revision, Revisions, Timestamp, Uncommitted,
};
use tokio::sync::{broadcast, watch};

use crate::commit::{Committer, CommitterFactory};
use crate::error::{CommitError, SourceError};
use crate::source::{
    ColdEvent, ColdSink, ColdSource, ColdSourceFactory, HotEvent, HotSink, HotSource,
    HotSourceFactory, RebalanceKind,
};

mod cold;
mod hot;

pub use cold::MemoryColdSource;
pub use hot::MemoryHotSource;

#[derive(Debug)]
struct HotRegistration {
    source: u64,
    channel: ChannelName,
    sink: HotSink,
}

#[derive(Debug, Default)]
struct LogState {
    kernel: State,
    partitions: HashMap<ChannelName, Vec<Vec<Committed>>>,
    feeds: HashMap<ChannelName, broadcast::Sender<Committed>>,
    muted: HashSet<ChannelName>,
    hot: Vec<HotRegistration>,
    cold: HashMap<u64, (ChannelName, ColdSink)>,
    last_timestamp: Option<Timestamp>,
}

impl LogState {
    fn execute_effect(&mut self, effect: Effect, hot_capacity: usize) {
        match effect {
            Effect::ChannelMetadataWrite {
                channel,
                partitions,
            } => {
                self.partitions
                    .insert(channel.clone(), vec![Vec::new(); partitions as usize]);
                let (feed, _) = broadcast::channel(hot_capacity);
                self.feeds.insert(channel, feed);
            }
            Effect::StorageAppend(committed) => {
                let partition = committed.actual().partition as usize;
                if let Some(records) = self
                    .partitions
                    .get_mut(committed.channel())
                    .and_then(|p| p.get_mut(partition))
                {
                    records.push(committed);
                }
            }
            Effect::Publish(committed) => {
                if self.muted.contains(committed.channel()) {
                    tracing::trace!(channel = %committed.channel(), actual = %committed.actual(), "hot publish muted");
                    return;
                }
                if let Some(feed) = self.feeds.get(committed.channel()) {
                    // No live readers is not an error.
                    let _ = feed.send(committed);
                }
            }
            Effect::Rejected(conflict) => {
                tracing::trace!(expected = %conflict.expected, actual = %conflict.actual, "commit rejected");
            }
        }
    }
}

struct LogInner {
    state: Mutex<LogState>,
    appended: watch::Sender<u64>,
    next_id: AtomicU64,
    hot_capacity: usize,
    cold_idle_timeout: Duration,
    cold_batch_size: usize,
}

/// An in-process partitioned log. Clones share the same log.
#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    pub fn new(config: &DriftlogConfig) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState::default()),
                appended,
                next_id: AtomicU64::new(1),
                hot_capacity: config.hot.channel_capacity.max(1),
                cold_idle_timeout: config.cold.idle_timeout(),
                cold_batch_size: config.cold.batch_size.max(1),
            }),
        }
    }

    pub fn create_channel(
        &self,
        channel: impl Into<ChannelName>,
        partitions: u32,
    ) -> Result<(), KernelError> {
        let channel = channel.into();
        let mut state = self.lock();
        let (kernel, effects) = apply_committed(
            state.kernel.clone(),
            Command::create_channel(channel.clone(), partitions),
        )?;
        state.kernel = kernel;
        for effect in effects {
            state.execute_effect(effect, self.inner.hot_capacity);
        }
        tracing::debug!(channel = %channel, partitions, "channel created");
        Ok(())
    }

    /// Applies one append attempt.
    ///
    /// An accepted record is stored before it is published to live
    /// readers.
    pub fn append(&self, attempt: Uncommitted) -> Result<CommitResult, KernelError> {
        let result = {
            let mut state = self.lock();
            let timestamp = Timestamp::now_monotonic(state.last_timestamp);
            let (kernel, result, effects) =
                apply_commit(state.kernel.clone(), attempt, timestamp)?;
            state.kernel = kernel;
            if result.is_committed() {
                state.last_timestamp = Some(timestamp);
            }
            for effect in effects {
                state.execute_effect(effect, self.inner.hot_capacity);
            }
            result
        };
        if result.is_committed() {
            self.inner.appended.send_modify(|count| *count += 1);
        }
        Ok(result)
    }

    pub fn partition_count(&self, channel: &ChannelName) -> Option<u32> {
        self.lock()
            .kernel
            .channel(channel)
            .map(|log| log.partition_count())
    }

    /// Where the next record on `partition` will land.
    pub fn head(&self, channel: &ChannelName, partition: u32) -> Option<Revision> {
        self.lock().kernel.head_revision(channel, partition)
    }

    /// Heads of every partition of `channel`.
    pub fn heads(&self, channel: &ChannelName) -> Option<Revisions> {
        let state = self.lock();
        let log = state.kernel.channel(channel)?;
        Some(Revisions::from_pairs(
            (0..log.partition_count()).filter_map(|p| log.head(p).map(|h| (p, h))),
        ))
    }

    /// Stored records of one partition from offset `from`, at most `limit`.
    pub fn read(
        &self,
        channel: &ChannelName,
        partition: u32,
        from: u64,
        limit: usize,
    ) -> Vec<Committed> {
        let state = self.lock();
        let Some(records) = state
            .partitions
            .get(channel)
            .and_then(|p| p.get(partition as usize))
        else {
            return Vec::new();
        };
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(records.len());
        records[start..].iter().take(limit).cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Test hooks
    // ------------------------------------------------------------------------

    /// Stops (or restarts) publishing new commits of `channel` to live
    /// readers. Commits are still stored, so readers see gaps.
    pub fn mute_hot(&self, channel: &ChannelName, muted: bool) {
        let mut state = self.lock();
        if muted {
            state.muted.insert(channel.clone());
        } else {
            state.muted.remove(channel);
        }
    }

    /// Tells every hot subscriber of `channel` it now owns `partitions`.
    pub fn assign(&self, channel: &ChannelName, partitions: Vec<u32>) {
        self.rebalance(channel, RebalanceKind::Assigned, partitions);
    }

    /// Tells every hot subscriber of `channel` it lost `partitions`.
    pub fn revoke(&self, channel: &ChannelName, partitions: Vec<u32>) {
        self.rebalance(channel, RebalanceKind::Revoked, partitions);
    }

    /// Reports a transport failure to hot subscribers. `None` reaches
    /// every hot source once, for all of its channels.
    pub fn fail_hot(&self, channel: Option<&ChannelName>, error: SourceError) {
        let sinks: Vec<HotSink> = {
            let state = self.lock();
            let mut seen = BTreeSet::new();
            state
                .hot
                .iter()
                .filter(|r| match channel {
                    Some(channel) => &r.channel == channel,
                    None => seen.insert(r.source),
                })
                .map(|r| r.sink.clone())
                .collect()
        };
        for sink in sinks {
            sink.fail(channel.cloned(), error.clone());
        }
    }

    /// Reports a read failure to every cold reader of `channel`.
    pub fn fail_cold(&self, channel: &ChannelName, error: SourceError) {
        let sinks: Vec<ColdSink> = self
            .lock()
            .cold
            .values()
            .filter(|(c, _)| c == channel)
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink.deliver(ColdEvent::Failed(error.clone()));
        }
    }

    pub fn hot_subscriber_count(&self, channel: &ChannelName) -> usize {
        self.lock()
            .hot
            .iter()
            .filter(|r| &r.channel == channel)
            .count()
    }

    pub fn cold_reader_count(&self, channel: &ChannelName) -> usize {
        self.lock()
            .cold
            .values()
            .filter(|(c, _)| c == channel)
            .count()
    }

    fn rebalance(&self, channel: &ChannelName, kind: RebalanceKind, partitions: Vec<u32>) {
        let sinks: Vec<HotSink> = self
            .lock()
            .hot
            .iter()
            .filter(|r| &r.channel == channel)
            .map(|r| r.sink.clone())
            .collect();
        tracing::debug!(channel = %channel, ?kind, ?partitions, subscribers = sinks.len(), "rebalance");
        for sink in sinks {
            sink.deliver(HotEvent::Rebalance {
                channel: channel.clone(),
                kind,
                partitions: partitions.clone(),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Source plumbing
    // ------------------------------------------------------------------------

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn channel_exists(&self, channel: &ChannelName) -> bool {
        self.lock().kernel.channel_exists(channel)
    }

    fn attach_hot(
        &self,
        source: u64,
        channel: &ChannelName,
        sink: HotSink,
    ) -> Result<(u32, broadcast::Receiver<Committed>), SourceError> {
        let mut state = self.lock();
        let partitions = state
            .kernel
            .channel(channel)
            .map(|log| log.partition_count())
            .ok_or_else(|| SourceError::UnknownChannel(channel.clone()))?;
        let feed = state
            .feeds
            .get(channel)
            .map(broadcast::Sender::subscribe)
            .ok_or_else(|| SourceError::UnknownChannel(channel.clone()))?;
        state.hot.push(HotRegistration {
            source,
            channel: channel.clone(),
            sink,
        });
        Ok((partitions, feed))
    }

    fn detach_hot(&self, source: u64, channel: Option<&ChannelName>) {
        self.lock()
            .hot
            .retain(|r| r.source != source || channel.is_some_and(|c| &r.channel != c));
    }

    fn attach_cold(&self, id: u64, channel: &ChannelName, sink: ColdSink) {
        self.lock().cold.insert(id, (channel.clone(), sink));
    }

    fn detach_cold(&self, id: u64) {
        self.lock().cold.remove(&id);
    }

    fn appends(&self) -> watch::Receiver<u64> {
        self.inner.appended.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(&DriftlogConfig::default())
    }
}

/// Writes to one channel of a [`MemoryLog`].
pub struct MemoryCommitter {
    log: MemoryLog,
    channel: ChannelName,
}

#[async_trait]
impl Committer for MemoryCommitter {
    async fn commit(&self, attempt: Uncommitted) -> Result<CommitResult, CommitError> {
        if attempt.channel != self.channel {
            return Err(CommitError::Transport(format!(
                "committer for '{}' cannot write to '{}'",
                self.channel, attempt.channel
            )));
        }
        Ok(self.log.append(attempt)?)
    }
}

impl CommitterFactory for MemoryLog {
    fn create_committer(&self, channel: &ChannelName) -> Result<Arc<dyn Committer>, CommitError> {
        if !self.channel_exists(channel) {
            return Err(KernelError::ChannelNotFound(channel.clone()).into());
        }
        Ok(Arc::new(MemoryCommitter {
            log: self.clone(),
            channel: channel.clone(),
        }))
    }
}

impl HotSourceFactory for MemoryLog {
    fn create_hot_source(&self, sink: HotSink) -> Arc<dyn HotSource> {
        Arc::new(MemoryHotSource::new(self.clone(), sink))
    }
}

impl ColdSourceFactory for MemoryLog {
    fn create_cold_source(
        &self,
        channel: &ChannelName,
        sink: ColdSink,
    ) -> Result<Box<dyn ColdSource>, SourceError> {
        if !self.channel_exists(channel) {
            return Err(SourceError::UnknownChannel(channel.clone()));
        }
        Ok(Box::new(MemoryColdSource::spawn(
            self.clone(),
            channel.clone(),
            sink,
        )))
    }
}

#[cfg(test)]
mod tests;
