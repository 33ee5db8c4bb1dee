//! Live delivery from a [`MemoryLog`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use driftlog_types::{ChannelName, Committed};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::MemoryLog;
use crate::error::SourceError;
use crate::source::{HotEvent, HotSink, HotSource};

struct Feed {
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Hot source over a [`MemoryLog`].
///
/// Subscribing assigns every partition of the channel at once. A reader
/// that falls more than the feed capacity behind skips the records it
/// missed; the listener recovers them from a cold read.
pub struct MemoryHotSource {
    id: u64,
    log: MemoryLog,
    sink: HotSink,
    feeds: Mutex<HashMap<ChannelName, Feed>>,
}

impl MemoryHotSource {
    pub(super) fn new(log: MemoryLog, sink: HotSink) -> Self {
        Self {
            id: log.next_id(),
            log,
            sink,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<ChannelName, Feed>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HotSource for MemoryHotSource {
    async fn subscribe(&self, channel: &ChannelName) -> Result<u32, SourceError> {
        let mut feeds = self.feeds();
        if feeds.contains_key(channel) {
            return self
                .log
                .partition_count(channel)
                .ok_or_else(|| SourceError::UnknownChannel(channel.clone()));
        }

        let (partitions, feed) = self.log.attach_hot(self.id, channel, self.sink.clone())?;
        // Assignment goes out before any record can.
        self.sink
            .deliver(HotEvent::assigned(channel.clone(), (0..partitions).collect()));

        let (paused, paused_rx) = watch::channel(false);
        let task = tokio::spawn(forward(feed, paused_rx, self.sink.clone()));
        feeds.insert(channel.clone(), Feed { paused, task });
        tracing::debug!(channel = %channel, partitions, "hot subscription opened");
        Ok(partitions)
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> Result<(), SourceError> {
        let feed = self.feeds().remove(channel);
        match feed {
            Some(feed) => {
                feed.task.abort();
                self.log.detach_hot(self.id, Some(channel));
                tracing::debug!(channel = %channel, "hot subscription closed");
                Ok(())
            }
            None => Err(SourceError::UnknownChannel(channel.clone())),
        }
    }

    fn set_paused(&self, channel: &ChannelName, paused: bool) {
        if let Some(feed) = self.feeds().get(channel) {
            feed.paused.send_replace(paused);
        }
    }
}

impl Drop for MemoryHotSource {
    fn drop(&mut self) {
        for (_, feed) in self.feeds().drain() {
            feed.task.abort();
        }
        self.log.detach_hot(self.id, None);
    }
}

async fn forward(
    mut feed: broadcast::Receiver<Committed>,
    mut paused: watch::Receiver<bool>,
    sink: HotSink,
) {
    loop {
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return;
            }
        }
        tokio::select! {
            received = feed.recv() => match received {
                Ok(committed) => sink.commit(committed),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "hot reader lagged");
                }
                Err(RecvError::Closed) => return,
            },
            changed = paused.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
