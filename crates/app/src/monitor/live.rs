//! Live update channel: every analysis tick is pushed to UI consumers.

use std::sync::{Mutex, PoisonError};

use affect_core::GroupTick;
use tokio::sync::broadcast;
use tracing::trace;

const LIVE_CHANNEL_CAPACITY: usize = 64;

pub trait LiveUpdateSink: Send + Sync {
    fn publish(&self, tick: &GroupTick);
}

/// Keeps the latest tick and fans ticks out to any number of subscribers.
///
/// Slow subscribers lag and skip ticks; publishing never waits on them.
pub struct LiveUpdateHub {
    latest: Mutex<Option<GroupTick>>,
    tx: broadcast::Sender<GroupTick>,
}

impl LiveUpdateHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            latest: Mutex::new(None),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupTick> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<GroupTick> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveUpdateHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveUpdateSink for LiveUpdateHub {
    fn publish(&self, tick: &GroupTick) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(tick.clone());
        // No subscribers is not an error.
        if self.tx.send(tick.clone()).is_err() {
            trace!("live update dropped: no subscribers");
        }
    }
}
