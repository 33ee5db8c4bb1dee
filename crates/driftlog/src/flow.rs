//! Backpressure: demand counting and pausable sources.
//!
//! Downstream declares how many records it can accept with
//! `request(n)`. The listener forwards at most that many, pausing the
//! sources feeding a channel whenever any of its subscribers has run out
//! of demand and resuming them once demand is back.

use std::sync::Arc;

use driftlog_types::ChannelName;

use crate::error::ListenerError;
use crate::source::HotSource;

/// Demand value treated as unbounded: taking from it never decrements.
pub const UNBOUNDED: u64 = u64::MAX;

/// A source whose pushing can be suspended.
pub trait FlowControlled: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Outstanding demand of one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Demand {
    outstanding: u64,
}

impl Demand {
    pub fn new(initial: u64) -> Self {
        Self {
            outstanding: initial,
        }
    }

    /// Adds `n` to the outstanding demand, saturating at [`UNBOUNDED`].
    ///
    /// # Errors
    ///
    /// Requesting zero records is rejected and leaves the demand unchanged.
    pub fn request(&mut self, n: u64) -> Result<(), ListenerError> {
        if n == 0 {
            return Err(ListenerError::InvalidDemand { requested: n });
        }
        self.outstanding = self.outstanding.saturating_add(n);
        Ok(())
    }

    /// Consumes one unit of demand, if any is left.
    pub fn try_take(&mut self) -> bool {
        match self.outstanding {
            0 => false,
            UNBOUNDED => true,
            _ => {
                self.outstanding -= 1;
                true
            }
        }
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    pub fn is_exhausted(&self) -> bool {
        self.outstanding == 0
    }

    pub fn is_unbounded(&self) -> bool {
        self.outstanding == UNBOUNDED
    }
}

/// Pauses one channel of a shared hot source.
pub struct HotValve {
    source: Arc<dyn HotSource>,
    channel: ChannelName,
}

impl HotValve {
    pub fn new(source: Arc<dyn HotSource>, channel: ChannelName) -> Self {
        Self { source, channel }
    }
}

impl FlowControlled for HotValve {
    fn pause(&self) {
        self.source.set_paused(&self.channel, true);
    }

    fn resume(&self) {
        self.source.set_paused(&self.channel, false);
    }
}

/// Remembers whether a group of sources is paused so that transitions
/// are issued once.
#[derive(Debug, Default)]
pub struct Throttle {
    paused: bool,
}

impl Throttle {
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Moves every source in `sources` to the wanted state.
    ///
    /// Returns true if a transition happened.
    pub fn apply(&mut self, pause: bool, sources: &[&dyn FlowControlled]) -> bool {
        if pause == self.paused {
            return false;
        }
        self.paused = pause;
        for source in sources {
            if pause {
                source.pause();
            } else {
                source.resume();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl FlowControlled for Counting {
        fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn demand_counts_down() {
        let mut demand = Demand::new(0);
        assert!(demand.is_exhausted());
        assert!(!demand.try_take());

        demand.request(2).expect("positive demand");
        assert!(demand.try_take());
        assert!(demand.try_take());
        assert!(!demand.try_take());
    }

    #[test]
    fn zero_demand_is_rejected() {
        let mut demand = Demand::new(3);
        let err = demand.request(0).unwrap_err();
        assert!(matches!(err, ListenerError::InvalidDemand { requested: 0 }));
        assert_eq!(demand.outstanding(), 3);
    }

    #[test]
    fn demand_saturates_to_unbounded() {
        let mut demand = Demand::new(UNBOUNDED - 1);
        demand.request(10).expect("positive demand");
        assert!(demand.is_unbounded());
        for _ in 0..100 {
            assert!(demand.try_take());
        }
        assert!(demand.is_unbounded());
    }

    #[test]
    fn throttle_transitions_once() {
        let source = Counting::default();
        let mut throttle = Throttle::default();

        assert!(throttle.apply(true, &[&source]));
        assert!(!throttle.apply(true, &[&source]));
        assert!(throttle.is_paused());
        assert!(throttle.apply(false, &[&source]));

        assert_eq!(source.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(source.resumes.load(Ordering::SeqCst), 1);
    }
}
