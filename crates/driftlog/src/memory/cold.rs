//! Historical replay from a [`MemoryLog`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use driftlog_types::{ChannelName, Committed, Revisions};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::MemoryLog;
use crate::error::SourceError;
use crate::source::{ColdEvent, ColdSink, ColdSource};

struct Reader {
    log: MemoryLog,
    channel: ChannelName,
    sink: ColdSink,
    /// Next offset to read per partition.
    positions: Mutex<BTreeMap<u32, u64>>,
    wake: Notify,
}

impl Reader {
    fn positions(&self) -> MutexGuard<'_, BTreeMap<u32, u64>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_batch(&self, limit: usize) -> Vec<Committed> {
        let mut positions = self.positions();
        let mut batch = Vec::new();
        for (partition, offset) in positions.iter_mut() {
            let records = self.log.read(&self.channel, *partition, *offset, limit);
            if let Some(last) = records.last() {
                *offset = last.next_expected().offset;
            }
            batch.extend(records);
        }
        batch
    }
}

/// Cold source over a [`MemoryLog`].
///
/// Reads forward from the resumed positions in batches and reports
/// [`ColdEvent::Completed`] once no record has appeared for the idle
/// timeout. It then waits for the next `resume`. Dropping the source
/// stops the reader task.
pub struct MemoryColdSource {
    id: u64,
    reader: Arc<Reader>,
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MemoryColdSource {
    pub(super) fn spawn(log: MemoryLog, channel: ChannelName, sink: ColdSink) -> Self {
        let id = log.next_id();
        log.attach_cold(id, &channel, sink.clone());

        let idle_timeout = log.inner.cold_idle_timeout;
        let batch_size = log.inner.cold_batch_size;
        let appends = log.appends();
        let reader = Arc::new(Reader {
            log,
            channel,
            sink,
            positions: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
        });
        let (paused, paused_rx) = watch::channel(false);
        let task = tokio::spawn(read(
            Arc::clone(&reader),
            appends,
            paused_rx,
            idle_timeout,
            batch_size,
        ));
        Self {
            id,
            reader,
            paused,
            task,
        }
    }

    /// Partitions currently being read and their next offsets.
    pub fn positions(&self) -> Revisions {
        Revisions::from_pairs(self.reader.positions().clone())
    }
}

#[async_trait]
impl ColdSource for MemoryColdSource {
    async fn resume(&self, revisions: Revisions) -> Result<(), SourceError> {
        if !self.reader.log.channel_exists(&self.reader.channel) {
            return Err(SourceError::UnknownChannel(self.reader.channel.clone()));
        }
        {
            let mut positions = self.reader.positions();
            for (partition, offset) in revisions.iter() {
                positions
                    .entry(partition)
                    .and_modify(|current| *current = (*current).max(offset))
                    .or_insert(offset);
            }
        }
        self.reader.wake.notify_one();
        Ok(())
    }

    fn stop(&self, partitions: &[u32]) {
        let mut positions = self.reader.positions();
        for partition in partitions {
            positions.remove(partition);
        }
    }

    fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }
}

impl Drop for MemoryColdSource {
    fn drop(&mut self) {
        self.task.abort();
        self.reader.log.detach_cold(self.id);
    }
}

async fn read(
    reader: Arc<Reader>,
    mut appends: watch::Receiver<u64>,
    mut paused: watch::Receiver<bool>,
    idle_timeout: Duration,
    batch_size: usize,
) {
    loop {
        reader.wake.notified().await;

        loop {
            while *paused.borrow_and_update() {
                if paused.changed().await.is_err() {
                    return;
                }
            }

            let _ = appends.borrow_and_update();
            let batch = reader.next_batch(batch_size);
            if !batch.is_empty() {
                for committed in batch {
                    reader.sink.deliver(ColdEvent::Committed(committed));
                }
                continue;
            }
            if reader.positions().is_empty() {
                break;
            }

            tokio::select! {
                changed = appends.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = reader.wake.notified() => {}
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                () = tokio::time::sleep(idle_timeout) => {
                    tracing::trace!(channel = %reader.channel, "cold read idle, completing");
                    reader.sink.deliver(ColdEvent::Completed);
                    break;
                }
            }
        }
    }
}
