//! Downstream consumers of a channel.

use driftlog_types::Committed;
use tokio::sync::mpsc;

use crate::error::ListenerError;

/// Receives a channel's records in order, without gaps or duplicates.
///
/// Called from the channel's worker task; implementations should hand
/// work off rather than block.
pub trait ChannelSubscriber: Send {
    fn on_commit(&mut self, committed: &Committed);

    /// Called at most once. No records follow.
    fn on_error(&mut self, error: &ListenerError);

    /// A closed subscriber is dropped as if it had cancelled.
    fn is_closed(&self) -> bool {
        false
    }
}

/// One item received through a [`ChannelSender`].
pub type Delivery = Result<Committed, ListenerError>;

/// Forwards deliveries into an unbounded `mpsc` channel.
///
/// Dropping the receiver cancels the subscription at the next delivery.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelSender {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChannelSubscriber for ChannelSender {
    fn on_commit(&mut self, committed: &Committed) {
        let _ = self.tx.send(Ok(committed.clone()));
    }

    fn on_error(&mut self, error: &ListenerError) {
        let _ = self.tx.send(Err(error.clone()));
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
