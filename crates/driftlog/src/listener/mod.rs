//! The revision-aware listener.
//!
//! [`RevisionAwareListener`] merges a hot source and lazily created cold
//! sources into one gap-free, duplicate-free stream per channel. Every
//! attached channel is driven by its own worker task (see `worker`), and
//! every decision that worker takes comes from a [`Reconciler`].
//!
//! # Example
//!
//! ```ignore
//! let log = MemoryLog::new(&config);
//! let listener = RevisionAwareListener::new(&log, Arc::new(log.clone()), config);
//!
//! let (sender, mut deliveries) = ChannelSender::new();
//! let subscription = listener
//!     .subscribe("orders", Box::new(sender), Arc::new(MemoryCheckpoints::new()))
//!     .await?;
//! subscription.request(16);
//!
//! while let Some(Ok(committed)) = deliveries.recv().await {
//!     // ...
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use driftlog_config::DriftlogConfig;
use driftlog_types::{ChannelName, Revisions};
use tokio::sync::{mpsc, oneshot};

use crate::checkpoint::RevisionCallback;
use crate::error::ListenerError;
use crate::source::{ColdSourceFactory, HotSink, HotSource, HotSourceFactory};

pub mod reconcile;
mod subscriber;
pub(crate) mod worker;

pub use reconcile::{Action, Phase, Reconciler};
pub use subscriber::{ChannelSender, ChannelSubscriber, Delivery};

use worker::{ChannelCommand, ChannelSnapshot, ChannelWorker, Mailbox, Registry};

struct Shared {
    registry: Arc<Registry>,
    hot: Arc<dyn HotSource>,
    cold_factory: Arc<dyn ColdSourceFactory>,
    config: DriftlogConfig,
    next_token: AtomicU64,
    closed: AtomicBool,
}

/// Reconciles hot and cold delivery for any number of channels.
///
/// Cheap to clone; clones share all channels. Must be used from within a
/// Tokio runtime.
#[derive(Clone)]
pub struct RevisionAwareListener {
    shared: Arc<Shared>,
}

impl RevisionAwareListener {
    pub fn new(
        hot_factory: &dyn HotSourceFactory,
        cold_factory: Arc<dyn ColdSourceFactory>,
        config: DriftlogConfig,
    ) -> Self {
        let registry = Arc::new(Registry::default());
        let hot = hot_factory.create_hot_source(HotSink::listener(&registry));
        Self {
            shared: Arc::new(Shared {
                registry,
                hot,
                cold_factory,
                config,
                next_token: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &DriftlogConfig {
        &self.shared.config
    }

    /// Subscribes to `channel` and resolves with its partition count.
    ///
    /// The first subscriber of a channel attaches it: the hot source is
    /// subscribed and the call resolves once partitions are assigned and
    /// their checkpoints loaded through `callback`, or once the assignment
    /// timeout passes. Later subscribers share the channel and its
    /// callback; their own `callback` is not used.
    ///
    /// # Errors
    ///
    /// Fails if the hot source refuses the channel, the checkpoint cannot
    /// be loaded, or the listener is closed.
    pub async fn subscribe(
        &self,
        channel: impl Into<ChannelName>,
        subscriber: Box<dyn ChannelSubscriber>,
        callback: Arc<dyn RevisionCallback>,
    ) -> Result<Subscription, ListenerError> {
        let channel = channel.into();
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        let mut command = ChannelCommand::Subscribe {
            token,
            subscriber,
            callback,
            reply,
        };

        let mailbox = {
            let mut channels = self.shared.registry.lock();
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(ListenerError::Closed);
            }
            loop {
                let mailbox = channels
                    .entry(channel.clone())
                    .or_insert_with(|| self.spawn_worker(&channel))
                    .clone();
                match mailbox.send(command) {
                    Ok(()) => break mailbox,
                    Err(mpsc::error::SendError(returned)) => {
                        channels.remove(&channel);
                        command = returned;
                    }
                }
            }
        };

        let partition_count = response.await.map_err(|_| ListenerError::Closed)??;
        tracing::debug!(channel = %channel, token, partition_count, "subscribed");
        Ok(Subscription {
            channel,
            token,
            partition_count,
            mailbox,
        })
    }

    /// Cancels `subscription` on `channel`.
    ///
    /// # Errors
    ///
    /// [`ListenerError::Detached`] if the channel is no longer attached
    /// or the subscription belongs elsewhere.
    pub fn unsubscribe(
        &self,
        channel: &ChannelName,
        subscription: &Subscription,
    ) -> Result<(), ListenerError> {
        let channels = self.shared.registry.lock();
        match channels.get(channel) {
            Some(mailbox)
                if channel == subscription.channel()
                    && mailbox.same_channel(&subscription.mailbox) =>
            {
                let _ = mailbox.send(ChannelCommand::Cancel {
                    token: subscription.token,
                });
                Ok(())
            }
            _ => Err(ListenerError::Detached(channel.clone())),
        }
    }

    /// A [`Publisher`] bound to `channel` and `callback`.
    pub fn publisher(
        &self,
        channel: impl Into<ChannelName>,
        callback: Arc<dyn RevisionCallback>,
    ) -> Publisher {
        Publisher {
            listener: self.clone(),
            channel: channel.into(),
            callback,
        }
    }

    pub async fn phase(&self, channel: &ChannelName) -> Phase {
        self.inspect(channel)
            .await
            .map_or(Phase::Detached, |snapshot| snapshot.phase)
    }

    /// Tracked positions of `channel`, if it is attached.
    ///
    /// These include records still waiting for demand; checkpoints stop
    /// short of those.
    pub async fn tracked(&self, channel: &ChannelName) -> Option<Revisions> {
        self.inspect(channel).await.map(|snapshot| snapshot.tracked)
    }

    pub async fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.inspect(channel)
            .await
            .map_or(0, |snapshot| snapshot.subscribers)
    }

    /// Detaches every channel and refuses further subscriptions.
    ///
    /// Subscribers receive [`ListenerError::Closed`]. The positions of
    /// everything handed to subscribers are saved before this returns.
    pub async fn close(&self) {
        let pending: Vec<_> = {
            let channels = self.shared.registry.lock();
            self.shared.closed.store(true, Ordering::SeqCst);
            channels
                .values()
                .filter_map(|mailbox| {
                    let (reply, done) = oneshot::channel();
                    mailbox
                        .send(ChannelCommand::Close { reply })
                        .ok()
                        .map(|()| done)
                })
                .collect()
        };
        tracing::info!(channels = pending.len(), "listener closing");
        for done in pending {
            let _ = done.await;
        }
    }

    async fn inspect(&self, channel: &ChannelName) -> Option<ChannelSnapshot> {
        let (reply, response) = oneshot::channel();
        if !self
            .shared
            .registry
            .send(channel, ChannelCommand::Inspect { reply })
        {
            return None;
        }
        response.await.ok()
    }

    fn spawn_worker(&self, channel: &ChannelName) -> Mailbox {
        ChannelWorker::spawn(
            channel.clone(),
            Arc::clone(&self.shared.registry),
            Arc::clone(&self.shared.hot),
            Arc::clone(&self.shared.cold_factory),
            self.shared.config.clone(),
        )
    }
}

/// A live subscription to one channel.
///
/// Records flow only while demand is outstanding; see
/// [`Subscription::request`]. Dropping the handle does not cancel.
#[derive(Debug)]
pub struct Subscription {
    channel: ChannelName,
    token: u64,
    partition_count: u32,
    mailbox: Mailbox,
}

impl Subscription {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Allows `n` more records to be delivered.
    ///
    /// Zero is invalid: the subscriber receives
    /// [`ListenerError::InvalidDemand`] and the subscription is cancelled.
    pub fn request(&self, n: u64) {
        let _ = self.mailbox.send(ChannelCommand::Request {
            token: self.token,
            n,
        });
    }

    /// Stops delivery. The last cancellation of a channel detaches it.
    pub fn cancel(&self) {
        let _ = self
            .mailbox
            .send(ChannelCommand::Cancel { token: self.token });
    }
}

/// Subscriptions to one channel with a fixed checkpoint callback.
#[derive(Clone)]
pub struct Publisher {
    listener: RevisionAwareListener,
    channel: ChannelName,
    callback: Arc<dyn RevisionCallback>,
}

impl Publisher {
    pub fn channel(&self) -> &ChannelName {
        &self.channel
    }

    pub async fn subscribe(
        &self,
        subscriber: Box<dyn ChannelSubscriber>,
    ) -> Result<Subscription, ListenerError> {
        self.listener
            .subscribe(
                self.channel.clone(),
                subscriber,
                Arc::clone(&self.callback),
            )
            .await
    }
}
