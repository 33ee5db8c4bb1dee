//! # driftlog-types: Core types for `Driftlog`
//!
//! This crate contains shared types used across the `Driftlog` system:
//! - Channel identity ([`ChannelName`])
//! - Positions ([`Revision`], [`Revisions`], [`ChannelRevisions`], [`Position`])
//! - Partition assignment ([`partition_of`], [`partition_for_key`])
//! - Temporal types ([`Timestamp`])
//! - Record lifecycle ([`Recorded`], [`Uncommitted`], [`Committed`], [`CommitResult`], [`Conflict`])
//!
//! Everything here is pure in-memory bookkeeping. Nothing in this crate
//! performs I/O or spawns tasks.

use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod revision;

pub use revision::{
    ChannelRevisions, Position, Revision, RevisionError, Revisions, UNKNOWN_OFFSET, partition_for_key,
    partition_of,
};

// ============================================================================
// Channel Name - Clone (contains String, but rarely cloned)
// ============================================================================

/// Name of a partitioned, append-only record channel.
///
/// The channel is the unit of subscription: consumers subscribe to a
/// channel and receive every partition currently assigned to them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChannelName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&str> for ChannelName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<ChannelName> for String {
    fn from(value: ChannelName) -> Self {
        value.0
    }
}

// ============================================================================
// Timestamp - Copy (8-byte value with monotonic guarantee)
// ============================================================================

/// Wall-clock commit timestamp.
///
/// Stored as nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from nanoseconds since Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns the timestamp as nanoseconds since Unix epoch.
    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp as milliseconds since Unix epoch.
    pub fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Creates a timestamp for the current time.
    ///
    /// A clock set before the Unix epoch yields [`Timestamp::EPOCH`].
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self(nanos)
    }

    /// Creates a timestamp ensuring monotonicity: `max(now, last + 1ns)`.
    ///
    /// Each timestamp is strictly greater than the previous even if the
    /// system clock moves backwards.
    pub fn now_monotonic(last: Option<Timestamp>) -> Self {
        let now = Self::now();
        match last {
            Some(prev) if now.0 <= prev.0 => Timestamp(prev.0.saturating_add(1)),
            _ => now,
        }
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

// ============================================================================
// Record Lifecycle - Clone (payloads are reference-counted `Bytes`)
// ============================================================================

/// Free-form record headers.
///
/// Ordered so that two records with the same headers compare and hash
/// identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Header(BTreeMap<String, Bytes>);

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header entry, replacing any previous value for `name`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.0.iter()
    }
}

/// The shape shared by every record: a key, a value, and headers.
///
/// The key drives partition assignment (see [`partition_for_key`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recorded {
    pub key: Bytes,
    pub value: Bytes,
    pub header: Header,
}

impl Recorded {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            header: Header::new(),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.header = header;
        self
    }
}

/// An append attempt that has not yet been accepted by the log.
///
/// Carries the *expected* revisions precondition: the attempt is only
/// accepted if the log's current head for the target partition equals
/// `expected.get(partition)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uncommitted {
    pub channel: ChannelName,
    pub partition: u32,
    pub record: Recorded,
    pub expected: Revisions,
}

impl Uncommitted {
    /// Creates an attempt targeting an explicit partition.
    pub fn new(
        channel: impl Into<ChannelName>,
        partition: u32,
        record: Recorded,
        expected: Revisions,
    ) -> Self {
        Self {
            channel: channel.into(),
            partition,
            record,
            expected,
        }
    }

    /// Creates an attempt whose partition is derived from the record key.
    pub fn keyed(
        channel: impl Into<ChannelName>,
        partition_count: u32,
        record: Recorded,
        expected: Revisions,
    ) -> Self {
        let partition = partition_for_key(&record.key, partition_count);
        Self::new(channel, partition, record, expected)
    }

    /// The revision this attempt expects to land at.
    pub fn expected_revision(&self) -> Revision {
        Revision::new(self.partition, self.expected.get(self.partition))
    }
}

/// A record confirmed by the log.
///
/// Produced only by a successful commit or by a source replaying data that
/// was already committed. Fields are private so a `Committed` cannot be
/// altered after construction.
///
/// Deserializing rebuilds the record through [`Committed::new`], so the
/// next expected revision is always derived, never read from the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CommittedWire")]
pub struct Committed {
    channel: ChannelName,
    record: Recorded,
    actual: Revision,
    next_expected: Revision,
    timestamp: Timestamp,
}

/// Serialized form of [`Committed`] without its derived fields.
#[derive(Deserialize)]
struct CommittedWire {
    channel: ChannelName,
    record: Recorded,
    actual: Revision,
    timestamp: Timestamp,
}

impl TryFrom<CommittedWire> for Committed {
    type Error = String;

    fn try_from(wire: CommittedWire) -> Result<Self, Self::Error> {
        if !wire.actual.is_known() {
            return Err(format!(
                "committed record on partition {} has no offset",
                wire.actual.partition
            ));
        }
        Ok(Committed::new(
            wire.channel,
            wire.record,
            wire.actual,
            wire.timestamp,
        ))
    }
}

impl Committed {
    /// Creates a committed record landing at `actual`.
    ///
    /// The next expected revision is always `actual.offset + 1` on the same
    /// partition.
    pub fn new(
        channel: ChannelName,
        record: Recorded,
        actual: Revision,
        timestamp: Timestamp,
    ) -> Self {
        debug_assert!(actual.is_known(), "committed record must have a known offset");
        Self {
            channel,
            record,
            next_expected: actual.next(),
            actual,
            timestamp,
        }
    }

    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn record(&self) -> &Recorded {
        &self.record
    }

    pub fn key(&self) -> &Bytes {
        &self.record.key
    }

    pub fn value(&self) -> &Bytes {
        &self.record.value
    }

    pub fn header(&self) -> &Header {
        &self.record.header
    }

    /// The revision the record landed at.
    pub fn actual(&self) -> Revision {
        self.actual
    }

    /// The revision the next record on this partition will land at.
    pub fn next_expected(&self) -> Revision {
        self.next_expected
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// The precondition that failed and the log's true position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conflict {
    pub expected: Revision,
    pub actual: Revision,
}

/// Outcome of one append attempt.
///
/// `Conflicting` is a normal result of optimistic-concurrency contention,
/// not an error: the caller re-reads, recomputes its expectation and
/// retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitResult {
    Committed(Committed),
    Conflicting(Conflict),
}

impl CommitResult {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitResult::Committed(_))
    }

    pub fn committed(&self) -> Option<&Committed> {
        match self {
            CommitResult::Committed(c) => Some(c),
            CommitResult::Conflicting(_) => None,
        }
    }

    pub fn conflict(&self) -> Option<Conflict> {
        match self {
            CommitResult::Committed(_) => None,
            CommitResult::Conflicting(c) => Some(*c),
        }
    }
}
