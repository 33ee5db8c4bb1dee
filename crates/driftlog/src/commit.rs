//! The write side: optimistic append attempts.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use driftlog_types::{ChannelName, CommitResult, Committed, Conflict, Revisions, Uncommitted};

use crate::error::CommitError;

/// Performs one append attempt against the log.
///
/// The attempt lands only if its expected revision equals the log's head
/// for the target partition. Otherwise nothing is written and the result
/// is [`CommitResult::Conflicting`] carrying the true head.
#[async_trait]
pub trait Committer: Send + Sync {
    async fn commit(&self, attempt: Uncommitted) -> Result<CommitResult, CommitError>;
}

pub trait CommitterFactory: Send + Sync {
    fn create_committer(&self, channel: &ChannelName) -> Result<Arc<dyn Committer>, CommitError>;
}

/// Commits `attempt`, re-reading and retrying on conflict.
///
/// After each conflict `reread` returns the expectation for the next
/// attempt. Gives up with [`CommitError::RetriesExhausted`] once
/// `max_attempts` attempts have conflicted. A `max_attempts` of zero is
/// treated as one.
pub async fn commit_with_retry<F, Fut>(
    committer: &dyn Committer,
    mut attempt: Uncommitted,
    max_attempts: u32,
    mut reread: F,
) -> Result<Committed, CommitError>
where
    F: FnMut(Conflict) -> Fut,
    Fut: Future<Output = Result<Revisions, CommitError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match committer.commit(attempt.clone()).await? {
            CommitResult::Committed(committed) => return Ok(committed),
            CommitResult::Conflicting(conflict) => {
                tracing::debug!(
                    channel = %attempt.channel,
                    expected = %conflict.expected,
                    actual = %conflict.actual,
                    attempts,
                    "commit conflicted"
                );
                if attempts >= max_attempts {
                    return Err(CommitError::RetriesExhausted {
                        attempts,
                        last: conflict,
                    });
                }
                attempt.expected = reread(conflict).await?;
            }
        }
    }
}
