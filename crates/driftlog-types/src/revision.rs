//! Partition positions and the per-channel offset table.
//!
//! A [`Revision`] is a single `(partition, offset)` position. [`Revisions`]
//! maps every partition of one channel to an offset, and
//! [`ChannelRevisions`] maps channel names to their [`Revisions`]. The
//! latter is the authoritative "what have we consumed" state of a
//! consumer: every tracked offset is the *next expected* offset of its
//! partition.
//!
//! Tracked offsets are monotonic. Moving one backwards is a programming
//! error and is reported as [`RevisionError::Regression`] instead of being
//! ignored.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{ChannelName, Committed};

/// Sentinel offset meaning "no position yet".
///
/// Chosen as `u64::MAX` so that unsigned comparison places it after every
/// real offset.
pub const UNKNOWN_OFFSET: u64 = u64::MAX;

// ============================================================================
// Revision - Copy (12-byte value)
// ============================================================================

/// A single partition's position.
///
/// Revisions are only comparable within the same partition:
/// `partial_cmp` returns `None` across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub partition: u32,
    pub offset: u64,
}

impl Revision {
    pub const fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }

    /// A revision with no position on `partition`.
    pub const fn unknown(partition: u32) -> Self {
        Self {
            partition,
            offset: UNKNOWN_OFFSET,
        }
    }

    pub fn is_known(&self) -> bool {
        self.offset != UNKNOWN_OFFSET
    }

    /// The revision immediately after this one. Unknown stays unknown.
    pub fn next(&self) -> Self {
        if self.is_known() {
            Self::new(self.partition, self.offset + 1)
        } else {
            *self
        }
    }

    /// Compares offsets of two revisions on the same partition.
    pub fn compare(&self, other: &Revision) -> Option<Ordering> {
        self.partial_cmp(other)
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.partition == other.partition {
            Some(self.offset.cmp(&other.offset))
        } else {
            None
        }
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_known() {
            write!(f, "{}@{}", self.partition, self.offset)
        } else {
            write!(f, "{}@?", self.partition)
        }
    }
}

/// Consistent partition assignment for a precomputed key hash.
///
/// A `partition_count` of zero is treated as one.
pub fn partition_of(hash: u64, partition_count: u32) -> u32 {
    debug_assert!(partition_count > 0, "partition count must be positive");
    (hash % u64::from(partition_count.max(1))) as u32
}

/// Consistent partition assignment for a record key.
///
/// Uses the first eight bytes of the key's BLAKE3 digest so the result is
/// identical across processes, platforms and releases.
pub fn partition_for_key(key: &[u8], partition_count: u32) -> u32 {
    let digest = blake3::hash(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    partition_of(u64::from_le_bytes(prefix), partition_count)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevisionError {
    /// A tracked offset was asked to move backwards.
    #[error("revision regression on partition {partition}: tracked {current}, attempted {attempted}")]
    Regression {
        partition: u32,
        current: u64,
        attempted: u64,
    },
}

// ============================================================================
// Revisions - per-channel partition → offset table
// ============================================================================

/// Mapping `partition → offset` for one channel.
///
/// Stored densely and grown on demand when a higher partition index is
/// first seen. Holes are filled with [`UNKNOWN_OFFSET`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<u32, u64>", into = "BTreeMap<u32, u64>")]
pub struct Revisions {
    offsets: Vec<u64>,
}

impl Revisions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(partition, offset)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, u64)>) -> Self {
        let mut revisions = Self::new();
        for (partition, offset) in pairs {
            revisions.set(partition, offset);
        }
        revisions
    }

    /// Offset tracked for `partition`, or [`UNKNOWN_OFFSET`].
    pub fn get(&self, partition: u32) -> u64 {
        self.offsets
            .get(partition as usize)
            .copied()
            .unwrap_or(UNKNOWN_OFFSET)
    }

    pub fn revision(&self, partition: u32) -> Revision {
        Revision::new(partition, self.get(partition))
    }

    /// Returns true if `partition` has a known offset.
    pub fn contains_partition(&self, partition: u32) -> bool {
        self.get(partition) != UNKNOWN_OFFSET
    }

    /// Advances `revision.partition` to `revision.offset`.
    ///
    /// Accepted when the partition has no position yet or the new offset is
    /// at or past the current one.
    pub fn update(&mut self, revision: Revision) -> Result<(), RevisionError> {
        let current = self.get(revision.partition);
        if current != UNKNOWN_OFFSET && revision.offset < current {
            return Err(RevisionError::Regression {
                partition: revision.partition,
                current,
                attempted: revision.offset,
            });
        }
        self.set(revision.partition, revision.offset);
        Ok(())
    }

    /// True if the tracked offset has advanced to or past `revision`.
    ///
    /// A partition with no position reaches nothing.
    pub fn reached_by(&self, revision: Revision) -> bool {
        let current = self.get(revision.partition);
        current != UNKNOWN_OFFSET && current >= revision.offset
    }

    /// Forgets the position of `partition`, returning it if it was known.
    pub fn remove(&mut self, partition: u32) -> Option<u64> {
        let slot = self.offsets.get_mut(partition as usize)?;
        let previous = std::mem::replace(slot, UNKNOWN_OFFSET);
        while self.offsets.last() == Some(&UNKNOWN_OFFSET) {
            self.offsets.pop();
        }
        (previous != UNKNOWN_OFFSET).then_some(previous)
    }

    /// Copies out the known positions of `partitions` only.
    pub fn restrict(&self, partitions: &[u32]) -> Revisions {
        Revisions::from_pairs(
            partitions
                .iter()
                .filter(|p| self.contains_partition(**p))
                .map(|p| (*p, self.get(*p))),
        )
    }

    /// Merges `other` into `self`, keeping the larger offset per partition.
    pub fn merge_max(&mut self, other: &Revisions) {
        for (partition, offset) in other.iter() {
            let current = self.get(partition);
            if current == UNKNOWN_OFFSET || offset > current {
                self.set(partition, offset);
            }
        }
    }

    /// Merges `other` into `self`, keeping the smaller offset per partition.
    pub fn merge_min(&mut self, other: &Revisions) {
        for (partition, offset) in other.iter() {
            let current = self.get(partition);
            if current == UNKNOWN_OFFSET || offset < current {
                self.set(partition, offset);
            }
        }
    }

    /// Lowers each known offset to the one in `limits` where that is smaller.
    ///
    /// Partitions unknown to `self` stay unknown.
    pub fn cap(&mut self, limits: &Revisions) {
        for (partition, limit) in limits.iter() {
            if self.contains_partition(partition) && limit < self.get(partition) {
                self.set(partition, limit);
            }
        }
    }

    /// Known partitions in ascending order.
    pub fn partitions(&self) -> impl Iterator<Item = u32> + '_ {
        self.iter().map(|(p, _)| p)
    }

    /// Known `(partition, offset)` pairs in ascending partition order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.offsets
            .iter()
            .enumerate()
            .filter(|(_, o)| **o != UNKNOWN_OFFSET)
            .map(|(p, o)| (p as u32, *o))
    }

    /// Number of partitions with a known offset.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.iter().all(|o| *o == UNKNOWN_OFFSET)
    }

    fn set(&mut self, partition: u32, offset: u64) {
        let index = partition as usize;
        if index >= self.offsets.len() {
            if offset == UNKNOWN_OFFSET {
                return;
            }
            self.offsets.resize(index + 1, UNKNOWN_OFFSET);
        }
        self.offsets[index] = offset;
    }
}

impl From<BTreeMap<u32, u64>> for Revisions {
    fn from(map: BTreeMap<u32, u64>) -> Self {
        Revisions::from_pairs(map)
    }
}

impl From<Revisions> for BTreeMap<u32, u64> {
    fn from(revisions: Revisions) -> Self {
        revisions.iter().collect()
    }
}

impl Display for Revisions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, (partition, offset)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{partition}@{offset}")?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Position - result of comparing an incoming revision with tracked state
// ============================================================================

/// Where an incoming record sits relative to tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    /// The record was already consumed.
    Ahead,
    /// The record is exactly the next expected one.
    UpToDate,
    /// One or more records before this one are missing.
    Behind,
    /// The channel or partition is unknown to the tracker.
    Failed,
}

// ============================================================================
// ChannelRevisions - channel name → Revisions
// ============================================================================

/// Consumed positions of every channel in a consumer session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRevisions {
    channels: BTreeMap<ChannelName, Revisions>,
}

impl ChannelRevisions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: &ChannelName) -> Option<&Revisions> {
        self.channels.get(channel)
    }

    /// Replaces the whole table for `channel`.
    pub fn insert(&mut self, channel: ChannelName, revisions: Revisions) {
        self.channels.insert(channel, revisions);
    }

    /// Merges `revisions` into `channel`, keeping the larger offsets.
    pub fn merge(&mut self, channel: &ChannelName, revisions: &Revisions) {
        self.channels
            .entry(channel.clone())
            .or_default()
            .merge_max(revisions);
    }

    /// Advances one partition of `channel`. See [`Revisions::update`].
    pub fn update(
        &mut self,
        channel: &ChannelName,
        revision: Revision,
    ) -> Result<(), RevisionError> {
        self.channels
            .entry(channel.clone())
            .or_default()
            .update(revision)
    }

    /// Known partitions of `channel`.
    pub fn partitions(&self, channel: &ChannelName) -> BTreeSet<u32> {
        self.channels
            .get(channel)
            .map(|r| r.partitions().collect())
            .unwrap_or_default()
    }

    /// True if `channel` has reached `revision`.
    pub fn contains(&self, channel: &ChannelName, revision: Revision) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|r| r.reached_by(revision))
    }

    /// Classifies `actual` against tracked state and, when it is exactly
    /// the next expected record, advances the partition to `next`.
    pub fn try_update(
        &mut self,
        channel: &ChannelName,
        actual: Revision,
        next: Revision,
    ) -> Position {
        debug_assert_eq!(actual.partition, next.partition);
        let Some(revisions) = self.channels.get_mut(channel) else {
            return Position::Failed;
        };
        let tracked = revisions.get(actual.partition);
        if tracked == UNKNOWN_OFFSET {
            return Position::Failed;
        }
        match actual.offset.cmp(&tracked) {
            Ordering::Less => Position::Ahead,
            Ordering::Greater => Position::Behind,
            Ordering::Equal => match revisions.update(next) {
                Ok(()) => Position::UpToDate,
                Err(_) => Position::Failed,
            },
        }
    }

    /// [`ChannelRevisions::try_update`] for a committed record.
    pub fn try_update_committed(&mut self, committed: &Committed) -> Position {
        self.try_update(
            committed.channel(),
            committed.actual(),
            committed.next_expected(),
        )
    }

    /// Removes `partitions` from `channel`, returning their last positions.
    pub fn remove_partitions(&mut self, channel: &ChannelName, partitions: &[u32]) -> Revisions {
        let Some(revisions) = self.channels.get_mut(channel) else {
            return Revisions::new();
        };
        let removed = revisions.restrict(partitions);
        for partition in partitions {
            revisions.remove(*partition);
        }
        removed
    }

    /// Drops all state for `channel`.
    pub fn remove(&mut self, channel: &ChannelName) -> Option<Revisions> {
        self.channels.remove(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&ChannelName, &Revisions)> {
        self.channels.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
