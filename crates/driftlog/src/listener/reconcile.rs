//! Hot/cold reconciliation for one channel.
//!
//! [`Reconciler`] is the pure decision core of the listener: it consumes
//! hot records, cold records, cold completions and rebalances, and
//! answers with [`Action`]s for the worker to execute. It never touches
//! a source itself, which keeps every transition testable without a
//! runtime.
//!
//! Per partition the reconciler tracks the next expected offset. A hot
//! record past that offset opens a gap: the partition enters catch-up and
//! hot records are withheld until the cold reader has replayed up to the
//! highest offset the hot source has shown.

use std::collections::{BTreeMap, BTreeSet};

use driftlog_config::StartPosition;
use driftlog_types::{
    ChannelName, ChannelRevisions, Committed, Position, Revision, RevisionError, Revisions,
};

/// What the worker must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver the record downstream.
    Forward(Committed),
    /// Create the cold source if needed and read forward from these positions.
    ResumeCold(Revisions),
    /// Stop reading these partitions.
    StopCold(Vec<u32>),
    /// Release the cold source.
    DestroyCold,
}

/// Externally visible state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Hot records are forwarded directly.
    Live,
    /// A cold replay is closing a gap.
    CatchingUp,
    /// No active subscription.
    Detached,
}

#[derive(Debug)]
pub struct Reconciler {
    channel: ChannelName,
    start_from: StartPosition,
    max_resume_attempts: u32,
    tracked: ChannelRevisions,
    /// Highest next-expected offset the hot source has shown per partition.
    hot_head: BTreeMap<u32, u64>,
    catching_up: BTreeSet<u32>,
    /// Assigned without a checkpoint under [`StartPosition::Latest`].
    unpositioned: BTreeSet<u32>,
    cold_active: bool,
    resume_attempts: u32,
}

impl Reconciler {
    pub fn new(channel: ChannelName, start_from: StartPosition, max_resume_attempts: u32) -> Self {
        let mut tracked = ChannelRevisions::new();
        tracked.insert(channel.clone(), Revisions::new());
        Self {
            channel,
            start_from,
            max_resume_attempts,
            tracked,
            hot_head: BTreeMap::new(),
            catching_up: BTreeSet::new(),
            unpositioned: BTreeSet::new(),
            cold_active: false,
            resume_attempts: 0,
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn phase(&self) -> Phase {
        if self.cold_active {
            Phase::CatchingUp
        } else {
            Phase::Live
        }
    }

    /// Snapshot of the channel's tracked positions.
    pub fn tracked(&self) -> Revisions {
        self.tracked.get(&self.channel).cloned().unwrap_or_default()
    }

    pub fn catching_up(&self) -> impl Iterator<Item = u32> + '_ {
        self.catching_up.iter().copied()
    }

    pub fn hot_head(&self, partition: u32) -> Option<u64> {
        self.hot_head.get(&partition).copied()
    }

    pub fn is_cold_active(&self) -> bool {
        self.cold_active
    }

    /// A record pushed by the hot source.
    ///
    /// # Errors
    ///
    /// Fails only if tracked state would move backwards, which is fatal
    /// for the channel.
    pub fn on_hot(&mut self, committed: Committed) -> Result<Vec<Action>, RevisionError> {
        if committed.channel() != &self.channel {
            tracing::debug!(
                channel = %self.channel,
                other = %committed.channel(),
                "hot record for another channel discarded"
            );
            return Ok(Vec::new());
        }

        let actual = committed.actual();
        let partition = actual.partition;
        let head = self.hot_head.entry(partition).or_insert(0);
        *head = (*head).max(committed.next_expected().offset);

        if self.unpositioned.remove(&partition) {
            tracing::debug!(channel = %self.channel, %actual, "adopting first live position");
            self.tracked.update(&self.channel, actual)?;
        }

        let mut actions = Vec::new();
        match self.tracked.try_update_committed(&committed) {
            Position::UpToDate => {
                tracing::debug!(channel = %self.channel, %actual, "hot record forwarded");
                actions.push(Action::Forward(committed));
                self.settle(partition, &mut actions);
            }
            Position::Ahead => {
                tracing::debug!(channel = %self.channel, %actual, "hot record already consumed");
            }
            Position::Behind => {
                if self.catching_up.insert(partition) {
                    let from = self.tracked().restrict(&[partition]);
                    tracing::debug!(
                        channel = %self.channel,
                        %actual,
                        %from,
                        "gap before hot record, resuming cold source"
                    );
                    self.cold_active = true;
                    actions.push(Action::ResumeCold(from));
                } else {
                    tracing::debug!(channel = %self.channel, %actual, "hot record withheld during catch-up");
                }
            }
            Position::Failed => {
                tracing::debug!(
                    channel = %self.channel,
                    %actual,
                    position = ?Position::Failed,
                    "hot record for unassigned partition discarded"
                );
            }
        }
        Ok(actions)
    }

    /// A record replayed by the cold source.
    pub fn on_cold(&mut self, committed: Committed) -> Vec<Action> {
        if committed.channel() != &self.channel {
            return Vec::new();
        }

        let actual = committed.actual();
        let position = self.tracked.try_update_committed(&committed);
        let mut actions = Vec::new();
        match position {
            Position::UpToDate => {
                tracing::debug!(channel = %self.channel, %actual, "cold record forwarded");
                self.resume_attempts = 0;
                actions.push(Action::Forward(committed));
                self.settle(actual.partition, &mut actions);
            }
            Position::Ahead | Position::Behind | Position::Failed => {
                tracing::debug!(channel = %self.channel, %actual, ?position, "cold record discarded");
            }
        }
        actions
    }

    /// The cold source ran dry.
    ///
    /// Partitions that still trail the hot head are resumed, up to the
    /// configured number of consecutive completions without progress.
    pub fn on_cold_complete(&mut self) -> Vec<Action> {
        if !self.cold_active {
            return Vec::new();
        }

        let tracked = self.tracked();
        let behind: Vec<u32> = self
            .catching_up
            .iter()
            .copied()
            .filter(|p| {
                self.hot_head
                    .get(p)
                    .is_some_and(|head| !tracked.reached_by(Revision::new(*p, *head)))
            })
            .collect();

        if behind.is_empty() {
            tracing::debug!(channel = %self.channel, "cold replay complete, channel live");
            return self.finish_catch_up();
        }

        self.resume_attempts += 1;
        if self.resume_attempts > self.max_resume_attempts {
            tracing::warn!(
                channel = %self.channel,
                partitions = ?behind,
                attempts = self.resume_attempts,
                "cold replay completed while still behind, giving up until the next gap"
            );
            return self.finish_catch_up();
        }

        let done: Vec<u32> = self
            .catching_up
            .iter()
            .copied()
            .filter(|p| !behind.contains(p))
            .collect();
        self.catching_up = behind.iter().copied().collect();

        let mut actions = Vec::new();
        if !done.is_empty() {
            actions.push(Action::StopCold(done));
        }
        actions.push(Action::ResumeCold(tracked.restrict(&behind)));
        actions
    }

    /// The cold source failed or could not be created; it is gone.
    pub fn on_cold_lost(&mut self) {
        self.catching_up.clear();
        self.cold_active = false;
        self.resume_attempts = 0;
    }

    /// Partitions were assigned and their checkpoints loaded.
    ///
    /// Each partition that ends up with a position is backfilled from it.
    pub fn on_assigned(&mut self, partitions: &[u32], loaded: &Revisions) -> Vec<Action> {
        let mut backfill = Vec::new();

        for &partition in partitions {
            let start = if loaded.contains_partition(partition) {
                loaded.get(partition)
            } else {
                match self.start_from {
                    StartPosition::Earliest => 0,
                    StartPosition::Latest => {
                        if !self.tracked().contains_partition(partition) {
                            self.unpositioned.insert(partition);
                        }
                        continue;
                    }
                }
            };

            self.unpositioned.remove(&partition);
            self.tracked
                .merge(&self.channel, &Revisions::from_pairs([(partition, start)]));

            // Records committed while nobody was attached may never show up
            // on the hot source, so every positioned partition is read cold
            // until the reader runs dry or reaches the hot head.
            if self.catching_up.insert(partition) {
                backfill.push(partition);
            }
        }

        if backfill.is_empty() {
            return Vec::new();
        }
        let from = self.tracked().restrict(&backfill);
        tracing::debug!(channel = %self.channel, %from, "assigned partitions need backfill");
        self.cold_active = true;
        vec![Action::ResumeCold(from)]
    }

    /// Partitions were revoked. Returns their positions for saving.
    pub fn on_revoked(&mut self, partitions: &[u32]) -> (Revisions, Vec<Action>) {
        let saved = self.tracked.remove_partitions(&self.channel, partitions);

        let mut stopped = Vec::new();
        for partition in partitions {
            self.hot_head.remove(partition);
            self.unpositioned.remove(partition);
            if self.catching_up.remove(partition) {
                stopped.push(*partition);
            }
        }

        let actions = if stopped.is_empty() || !self.cold_active {
            Vec::new()
        } else if self.catching_up.is_empty() {
            self.finish_catch_up()
        } else {
            vec![Action::StopCold(stopped)]
        };
        (saved, actions)
    }

    /// Tears the channel down. Returns everything tracked for saving.
    pub fn close(&mut self) -> (Revisions, Vec<Action>) {
        let saved = self.tracked();
        let actions = if self.cold_active {
            vec![Action::DestroyCold]
        } else {
            Vec::new()
        };
        *self = Self::new(
            self.channel.clone(),
            self.start_from,
            self.max_resume_attempts,
        );
        (saved, actions)
    }

    /// Ends catch-up of `partition` once it reached the hot head.
    fn settle(&mut self, partition: u32, actions: &mut Vec<Action>) {
        if !self.catching_up.contains(&partition) {
            return;
        }
        let Some(head) = self.hot_head.get(&partition).copied() else {
            return;
        };
        if !self
            .tracked
            .contains(&self.channel, Revision::new(partition, head))
        {
            return;
        }

        self.catching_up.remove(&partition);
        tracing::debug!(channel = %self.channel, partition, head, "partition caught up");
        if self.catching_up.is_empty() {
            actions.extend(self.finish_catch_up());
        } else {
            actions.push(Action::StopCold(vec![partition]));
        }
    }

    fn finish_catch_up(&mut self) -> Vec<Action> {
        self.catching_up.clear();
        self.resume_attempts = 0;
        if std::mem::replace(&mut self.cold_active, false) {
            vec![Action::DestroyCold]
        } else {
            Vec::new()
        }
    }
}
