//! Checkpoint persistence for tracked revisions.
//!
//! The listener loads a channel's positions when partitions are assigned
//! and saves them when partitions are revoked or the channel detaches. A
//! [`RevisionCallback`] is bound to one channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use driftlog_types::{ChannelName, Revisions};

use crate::error::CheckpointError;

#[async_trait]
pub trait RevisionCallback: Send + Sync {
    /// Loads saved positions of `partitions`. Partitions never saved are
    /// absent from the result.
    async fn load_revisions(&self, partitions: &[u32]) -> Result<Revisions, CheckpointError>;

    /// Saves every position in `revisions`, leaving other partitions as
    /// they were.
    async fn save_revisions(&self, revisions: &Revisions) -> Result<(), CheckpointError>;
}

// ============================================================================
// MemoryCheckpoints
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    offsets: Mutex<BTreeMap<u32, u64>>,
    loads: AtomicUsize,
    saves: AtomicUsize,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

/// In-process checkpoint store.
///
/// Clones share the same offsets, so a test can keep one handle to
/// inspect what the listener saved.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpoints {
    inner: Arc<MemoryInner>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `revisions`.
    pub fn with_revisions(revisions: &Revisions) -> Self {
        let store = Self::new();
        store.lock().extend(revisions.iter());
        store
    }

    /// Everything saved so far.
    pub fn snapshot(&self) -> Revisions {
        Revisions::from_pairs(self.lock().clone())
    }

    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }

    /// Makes every following load fail.
    pub fn fail_loads(&self, fail: bool) {
        self.inner.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Makes every following save fail.
    pub fn fail_saves(&self, fail: bool) {
        self.inner.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u32, u64>> {
        self.inner
            .offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RevisionCallback for MemoryCheckpoints {
    async fn load_revisions(&self, partitions: &[u32]) -> Result<Revisions, CheckpointError> {
        self.inner.loads.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_loads.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable("loads disabled".to_string()));
        }
        let offsets = self.lock();
        Ok(Revisions::from_pairs(
            partitions
                .iter()
                .filter_map(|p| offsets.get(p).map(|o| (*p, *o))),
        ))
    }

    async fn save_revisions(&self, revisions: &Revisions) -> Result<(), CheckpointError> {
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_saves.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable("saves disabled".to_string()));
        }
        self.lock().extend(revisions.iter());
        Ok(())
    }
}

// ============================================================================
// FileCheckpoints
// ============================================================================

/// One JSON document per channel: `{"<partition>": <offset>, ...}`.
///
/// Writes go to a temporary file that is then renamed over the document.
#[derive(Debug)]
pub struct FileCheckpoints {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCheckpoints {
    pub fn new(dir: impl AsRef<Path>, channel: &ChannelName) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.json", file_stem(channel))),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Revisions, CheckpointError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Revisions::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Distinct channels always map to distinct file names: ASCII letters,
/// digits and `-` are kept, every other byte becomes `_` plus two hex digits.
fn file_stem(channel: &ChannelName) -> String {
    let mut stem = String::with_capacity(channel.as_str().len());
    for byte in channel.as_str().bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{byte:02x}"));
        }
    }
    stem
}

#[async_trait]
impl RevisionCallback for FileCheckpoints {
    async fn load_revisions(&self, partitions: &[u32]) -> Result<Revisions, CheckpointError> {
        Ok(self.read_all().await?.restrict(partitions))
    }

    async fn save_revisions(&self, revisions: &Revisions) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;

        let mut offsets: BTreeMap<u32, u64> = self.read_all().await?.into();
        offsets.extend(revisions.iter());
        let bytes = serde_json::to_vec_pretty(&offsets)?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::trace!(path = %self.path.display(), %revisions, "checkpoint written");
        Ok(())
    }
}
