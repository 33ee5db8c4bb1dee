//! Per-channel worker task.
//!
//! Each attached channel is owned by exactly one task. Hot events, cold
//! events, subscriptions and demand all arrive through its mailbox, so
//! tracked revisions and the cold source are only ever touched by that
//! task.
//!
//! The worker retires itself when its last subscriber leaves. Retirement
//! re-checks the mailbox under the registry lock, and new subscriptions
//! are posted under the same lock, so a subscription can never be sent
//! to a worker that is about to exit.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use driftlog_config::{DriftlogConfig, ErrorPolicy};
use driftlog_types::{ChannelName, Committed, Revisions};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};

use crate::checkpoint::RevisionCallback;
use crate::error::{ListenerError, SourceError};
use crate::flow::{Demand, FlowControlled, HotValve, Throttle};
use crate::listener::reconcile::{Action, Phase, Reconciler};
use crate::listener::subscriber::ChannelSubscriber;
use crate::source::{
    ColdEvent, ColdSink, ColdSource, ColdSourceFactory, HotEvent, HotSource, RebalanceKind,
};

pub(crate) type Mailbox = mpsc::UnboundedSender<ChannelCommand>;

pub(crate) enum ChannelCommand {
    Hot(HotEvent),
    Cold {
        generation: u64,
        event: ColdEvent,
    },
    Subscribe {
        token: u64,
        subscriber: Box<dyn ChannelSubscriber>,
        callback: Arc<dyn RevisionCallback>,
        reply: oneshot::Sender<Result<u32, ListenerError>>,
    },
    Request {
        token: u64,
        n: u64,
    },
    Cancel {
        token: u64,
    },
    Inspect {
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelSnapshot {
    pub phase: Phase,
    pub tracked: Revisions,
    pub subscribers: usize,
}

/// Mailboxes of the live channel workers.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    channels: Mutex<HashMap<ChannelName, Mailbox>>,
}

impl Registry {
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<ChannelName, Mailbox>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Posts `command` to the worker of `channel`, if there is one.
    pub(crate) fn send(&self, channel: &ChannelName, command: ChannelCommand) -> bool {
        self.lock()
            .get(channel)
            .is_some_and(|mailbox| mailbox.send(command).is_ok())
    }

    pub(crate) fn broadcast(&self, make: impl Fn() -> ChannelCommand) {
        for mailbox in self.lock().values() {
            let _ = mailbox.send(make());
        }
    }
}

struct Outlet {
    token: u64,
    subscriber: Box<dyn ChannelSubscriber>,
    demand: Demand,
    backlog: VecDeque<Committed>,
    /// Answer to `subscribe`, held until partitions are assigned.
    reply: Option<oneshot::Sender<Result<u32, ListenerError>>>,
}

impl Outlet {
    fn offer(&mut self, committed: &Committed) {
        if self.backlog.is_empty() && self.demand.try_take() {
            self.subscriber.on_commit(committed);
        } else {
            self.backlog.push_back(committed.clone());
        }
    }

    fn drain(&mut self) {
        while !self.backlog.is_empty() && self.demand.try_take() {
            if let Some(committed) = self.backlog.pop_front() {
                self.subscriber.on_commit(&committed);
            }
        }
    }

    /// First offset per partition still waiting for demand.
    fn undelivered(&self) -> Revisions {
        let mut first = BTreeMap::new();
        for committed in &self.backlog {
            let actual = committed.actual();
            first.entry(actual.partition).or_insert(actual.offset);
        }
        Revisions::from(first)
    }

    /// Drops waiting records of `partitions`.
    fn purge(&mut self, partitions: &[u32]) {
        self.backlog
            .retain(|committed| !partitions.contains(&committed.actual().partition));
    }

    fn fail(mut self, error: &ListenerError) {
        match self.reply.take() {
            Some(reply) => {
                let _ = reply.send(Err(error.clone()));
            }
            None => self.subscriber.on_error(error),
        }
    }
}

enum Wake {
    Command(ChannelCommand),
    AssignmentTimeout,
    Stopped,
}

pub(crate) struct ChannelWorker {
    channel: ChannelName,
    mailbox: mpsc::UnboundedReceiver<ChannelCommand>,
    tx: Mailbox,
    registry: Arc<Registry>,
    hot: Arc<dyn HotSource>,
    valve: HotValve,
    cold_factory: Arc<dyn ColdSourceFactory>,
    config: DriftlogConfig,
    reconciler: Reconciler,
    outlets: Vec<Outlet>,
    callback: Option<Arc<dyn RevisionCallback>>,
    /// Undelivered positions of subscribers that left with a backlog.
    withheld: Revisions,
    cold: Option<Box<dyn ColdSource>>,
    generation: u64,
    partition_count: u32,
    attached: bool,
    assignment_deadline: Option<Instant>,
    throttle: Throttle,
}

impl ChannelWorker {
    /// Starts the worker of `channel` and returns its mailbox.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(
        channel: ChannelName,
        registry: Arc<Registry>,
        hot: Arc<dyn HotSource>,
        cold_factory: Arc<dyn ColdSourceFactory>,
        config: DriftlogConfig,
    ) -> Mailbox {
        let (tx, mailbox) = mpsc::unbounded_channel();
        let worker = Self {
            reconciler: Reconciler::new(
                channel.clone(),
                config.listener.start_from,
                config.cold.max_resume_attempts,
            ),
            valve: HotValve::new(Arc::clone(&hot), channel.clone()),
            channel,
            mailbox,
            tx: tx.clone(),
            registry,
            hot,
            cold_factory,
            config,
            outlets: Vec::new(),
            callback: None,
            withheld: Revisions::new(),
            cold: None,
            generation: 0,
            partition_count: 0,
            attached: false,
            assignment_deadline: None,
            throttle: Throttle::default(),
        };
        tokio::spawn(worker.run());
        tx
    }

    async fn run(mut self) {
        tracing::debug!(channel = %self.channel, "channel worker started");
        loop {
            let command = match self.next_wake().await {
                Wake::Command(command) => command,
                Wake::AssignmentTimeout => {
                    tracing::warn!(
                        channel = %self.channel,
                        timeout_ms = self.config.listener.assignment_timeout_ms,
                        "no partitions assigned before timeout"
                    );
                    self.assignment_complete();
                    continue;
                }
                Wake::Stopped => break,
            };
            self.handle(command).await;

            while self.outlets.is_empty() {
                self.detach().await;
                match self.retire() {
                    Some(command) => self.handle(command).await,
                    None => {
                        tracing::debug!(channel = %self.channel, "channel worker stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn next_wake(&mut self) -> Wake {
        let deadline = self.assignment_deadline;
        tokio::select! {
            command = self.mailbox.recv() => command.map_or(Wake::Stopped, Wake::Command),
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                Wake::AssignmentTimeout
            }
        }
    }

    async fn handle(&mut self, command: ChannelCommand) {
        match command {
            ChannelCommand::Hot(event) => self.on_hot(event).await,
            ChannelCommand::Cold { generation, event } => self.on_cold(generation, event).await,
            ChannelCommand::Subscribe {
                token,
                subscriber,
                callback,
                reply,
            } => {
                let outlet = Outlet {
                    token,
                    subscriber,
                    demand: Demand::new(self.config.flow.initial_demand),
                    backlog: VecDeque::new(),
                    reply: Some(reply),
                };
                self.on_subscribe(outlet, callback).await;
            }
            ChannelCommand::Request { token, n } => self.on_request(token, n),
            ChannelCommand::Cancel { token } => self.on_cancel(token),
            ChannelCommand::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ChannelCommand::Close { reply } => {
                tracing::info!(channel = %self.channel, "closing channel");
                self.shutdown(&ListenerError::Closed).await;
                let _ = reply.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------------

    async fn on_subscribe(&mut self, mut outlet: Outlet, callback: Arc<dyn RevisionCallback>) {
        if self.attached {
            tracing::debug!(channel = %self.channel, token = outlet.token, "subscriber joined");
            if self.assignment_deadline.is_none() {
                if let Some(reply) = outlet.reply.take() {
                    if reply.send(Ok(self.partition_count)).is_err() {
                        return;
                    }
                }
            }
            self.outlets.push(outlet);
            self.sync_flow();
            return;
        }

        self.attached = true;
        self.callback = Some(callback);
        let hot = Arc::clone(&self.hot);
        let channel = self.channel.clone();
        match hot.subscribe(&channel).await {
            Ok(partitions) => {
                tracing::info!(channel = %self.channel, partitions, "channel attached");
                self.partition_count = partitions;
                self.assignment_deadline =
                    Some(Instant::now() + self.config.listener.assignment_timeout());
                self.outlets.push(outlet);
                self.sync_flow();
            }
            Err(error) => {
                tracing::error!(channel = %self.channel, %error, "hot subscribe failed");
                self.attached = false;
                self.callback = None;
                outlet.fail(&ListenerError::Source {
                    channel: self.channel.clone(),
                    source: error,
                });
            }
        }
    }

    fn on_request(&mut self, token: u64, n: u64) {
        let Some(index) = self.outlets.iter().position(|o| o.token == token) else {
            return;
        };
        if let Err(error) = self.outlets[index].demand.request(n) {
            tracing::debug!(channel = %self.channel, token, %error, "invalid demand, cancelling");
            for outlet in self.remove_outlets(|o| o.token == token) {
                outlet.fail(&error);
            }
        } else {
            self.outlets[index].drain();
        }
        self.prune();
        self.sync_flow();
    }

    fn on_cancel(&mut self, token: u64) {
        if !self.remove_outlets(|o| o.token == token).is_empty() {
            tracing::debug!(channel = %self.channel, token, "subscriber cancelled");
        }
        self.sync_flow();
    }

    fn deliver(&mut self, committed: &Committed) {
        for outlet in &mut self.outlets {
            outlet.offer(committed);
        }
        self.prune();
    }

    /// Drops subscribers that went away without cancelling.
    fn prune(&mut self) {
        for outlet in self.remove_outlets(|o| o.subscriber.is_closed()) {
            tracing::debug!(channel = %self.channel, token = outlet.token, "subscriber closed");
        }
    }

    /// Removes the outlets matching `leaving`.
    ///
    /// When the last subscriber leaves, whatever it had not been handed yet
    /// holds the next checkpoint back.
    fn remove_outlets(&mut self, leaving: impl FnMut(&Outlet) -> bool) -> Vec<Outlet> {
        let (gone, kept): (Vec<Outlet>, Vec<Outlet>) =
            std::mem::take(&mut self.outlets).into_iter().partition(leaving);
        self.outlets = kept;
        if self.outlets.is_empty() {
            for outlet in &gone {
                self.withheld.merge_min(&outlet.undelivered());
            }
        }
        gone
    }

    /// `tracked` lowered to the first record some subscriber has not been
    /// handed yet.
    fn delivered(&self, tracked: &Revisions) -> Revisions {
        let mut floor = self.withheld.clone();
        for outlet in &self.outlets {
            floor.merge_min(&outlet.undelivered());
        }
        let mut delivered = tracked.clone();
        delivered.cap(&floor);
        if delivered != *tracked {
            tracing::debug!(
                channel = %self.channel,
                %tracked,
                %delivered,
                "checkpoint held back by undelivered records"
            );
        }
        delivered
    }

    /// Pauses the sources while any subscriber is out of demand.
    fn sync_flow(&mut self) {
        let starved = self.outlets.iter().any(|o| o.demand.is_exhausted());
        let valve: &dyn FlowControlled = &self.valve;
        if self.throttle.apply(starved, &[valve]) {
            if let Some(cold) = &self.cold {
                cold.set_paused(starved);
            }
            tracing::debug!(channel = %self.channel, paused = starved, "flow changed");
        }
    }

    fn assignment_complete(&mut self) {
        self.assignment_deadline = None;
        let count = self.partition_count;
        self.outlets.retain_mut(|outlet| match outlet.reply.take() {
            Some(reply) => reply.send(Ok(count)).is_ok(),
            None => true,
        });
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    async fn on_hot(&mut self, event: HotEvent) {
        if !self.attached {
            tracing::trace!(channel = %self.channel, "hot event while detached ignored");
            return;
        }
        match event {
            HotEvent::Committed(committed) => match self.reconciler.on_hot(committed) {
                Ok(actions) => self.apply(actions).await,
                Err(error) => {
                    tracing::error!(channel = %self.channel, %error, "tracked revisions corrupted");
                    self.shutdown(&ListenerError::Revision(error)).await;
                }
            },
            HotEvent::Rebalance {
                kind: RebalanceKind::Assigned,
                partitions,
                ..
            } => self.on_assigned(partitions).await,
            HotEvent::Rebalance {
                kind: RebalanceKind::Revoked,
                partitions,
                ..
            } => self.on_revoked(partitions).await,
            HotEvent::Failed { error, .. } => self.source_failed(error, false).await,
        }
    }

    async fn on_cold(&mut self, generation: u64, event: ColdEvent) {
        if generation != self.generation || self.cold.is_none() {
            tracing::trace!(
                channel = %self.channel,
                generation,
                current = self.generation,
                "event from destroyed cold source ignored"
            );
            return;
        }
        match event {
            ColdEvent::Committed(committed) => {
                let actions = self.reconciler.on_cold(committed);
                self.apply(actions).await;
            }
            ColdEvent::Completed => {
                let actions = self.reconciler.on_cold_complete();
                self.apply(actions).await;
            }
            ColdEvent::Failed(error) => self.source_failed(error, true).await,
        }
    }

    async fn on_assigned(&mut self, partitions: Vec<u32>) {
        tracing::info!(channel = %self.channel, ?partitions, "partitions assigned");
        let loaded = match self.callback.clone() {
            Some(callback) => callback.load_revisions(&partitions).await,
            None => Ok(Revisions::new()),
        };
        match loaded {
            Ok(loaded) => {
                tracing::debug!(channel = %self.channel, %loaded, "checkpoint loaded");
                let actions = self.reconciler.on_assigned(&partitions, &loaded);
                self.apply(actions).await;
                if self.attached {
                    self.assignment_complete();
                }
            }
            Err(error) => {
                tracing::error!(channel = %self.channel, %error, "checkpoint load failed");
                let error = ListenerError::CheckpointLoad {
                    channel: self.channel.clone(),
                    source: Arc::new(error),
                };
                self.shutdown(&error).await;
            }
        }
    }

    async fn on_revoked(&mut self, partitions: Vec<u32>) {
        tracing::info!(channel = %self.channel, ?partitions, "partitions revoked");
        let (tracked, actions) = self.reconciler.on_revoked(&partitions);
        let saved = self.delivered(&tracked);
        for outlet in &mut self.outlets {
            outlet.purge(&partitions);
        }
        for partition in &partitions {
            self.withheld.remove(*partition);
        }
        self.apply(actions).await;
        self.save(&saved).await;
    }

    async fn source_failed(&mut self, error: SourceError, cold: bool) {
        match self.config.listener.error_policy {
            ErrorPolicy::Ignore => {
                tracing::warn!(channel = %self.channel, %error, cold, "source error ignored");
                if cold {
                    self.drop_cold();
                    self.reconciler.on_cold_lost();
                }
            }
            ErrorPolicy::FailFast => {
                tracing::error!(channel = %self.channel, %error, cold, "source failed, tearing down");
                let error = ListenerError::Source {
                    channel: self.channel.clone(),
                    source: error,
                };
                self.shutdown(&error).await;
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        let mut failure = None;
        for action in actions {
            match action {
                Action::Forward(committed) => self.deliver(&committed),
                Action::ResumeCold(revisions) => {
                    if let Err(error) = self.resume_cold(revisions).await {
                        failure.get_or_insert(error);
                    }
                }
                Action::StopCold(partitions) => {
                    if let Some(cold) = &self.cold {
                        cold.stop(&partitions);
                    }
                }
                Action::DestroyCold => self.drop_cold(),
            }
        }
        self.sync_flow();
        if let Some(error) = failure {
            self.source_failed(error, true).await;
        }
    }

    async fn resume_cold(&mut self, revisions: Revisions) -> Result<(), SourceError> {
        if self.cold.is_none() {
            self.generation += 1;
            let sink = ColdSink::worker(self.tx.clone(), self.generation);
            let cold = self.cold_factory.create_cold_source(&self.channel, sink)?;
            if self.throttle.is_paused() {
                cold.set_paused(true);
            }
            tracing::debug!(channel = %self.channel, generation = self.generation, "cold source created");
            self.cold = Some(cold);
        }
        if let Some(cold) = &self.cold {
            tracing::debug!(channel = %self.channel, from = %revisions, "cold source resumed");
            cold.resume(revisions).await?;
        }
        Ok(())
    }

    fn drop_cold(&mut self) {
        if self.cold.take().is_some() {
            tracing::debug!(channel = %self.channel, generation = self.generation, "cold source destroyed");
        }
    }

    async fn save(&mut self, revisions: &Revisions) {
        if revisions.is_empty() {
            return;
        }
        let Some(callback) = self.callback.clone() else {
            return;
        };
        match callback.save_revisions(revisions).await {
            Ok(()) => tracing::debug!(channel = %self.channel, %revisions, "checkpoint saved"),
            Err(error) => {
                tracing::warn!(channel = %self.channel, %error, %revisions, "checkpoint save failed");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Fails every subscriber with `error` and detaches.
    async fn shutdown(&mut self, error: &ListenerError) {
        for outlet in self.remove_outlets(|_| true) {
            outlet.fail(error);
        }
        self.detach().await;
    }

    /// Releases the hot subscription and the cold source and saves
    /// everything tracked.
    async fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        self.assignment_deadline = None;

        let hot = Arc::clone(&self.hot);
        let channel = self.channel.clone();
        if let Err(error) = hot.unsubscribe(&channel).await {
            tracing::warn!(channel = %self.channel, %error, "hot unsubscribe failed");
        }

        let (tracked, _) = self.reconciler.close();
        let saved = self.delivered(&tracked);
        self.withheld = Revisions::new();
        self.drop_cold();
        self.save(&saved).await;
        self.callback = None;
        self.throttle = Throttle::default();
        tracing::info!(channel = %self.channel, tracked = %saved, "channel detached");
    }

    /// Removes this worker from the registry unless a command is waiting.
    fn retire(&mut self) -> Option<ChannelCommand> {
        let registry = Arc::clone(&self.registry);
        let mut channels = registry.lock();
        if let Ok(command) = self.mailbox.try_recv() {
            return Some(command);
        }
        if channels
            .get(&self.channel)
            .is_some_and(|mailbox| mailbox.same_channel(&self.tx))
        {
            channels.remove(&self.channel);
        }
        None
    }

    fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            phase: if self.attached {
                self.reconciler.phase()
            } else {
                Phase::Detached
            },
            tracked: self.reconciler.tracked(),
            subscribers: self.outlets.len(),
        }
    }
}
