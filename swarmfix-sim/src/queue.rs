//! Masked event queue of a simulated node

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use swarmfix_core::engine::{Event, EventMask};
use tokio::sync::Notify;

/// FIFO of events waiting to be popped by a fixture.
///
/// Events whose category is not enabled in the current mask are dropped at
/// push time, the same way an engine never posts masked notifications.
#[derive(Debug)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    mask: Mutex<EventMask>,
    notify: Notify,
}

impl EventQueue {
    pub fn new(mask: EventMask) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            mask: Mutex::new(mask),
            notify: Notify::new(),
        }
    }

    pub fn mask(&self) -> EventMask {
        *self.mask.lock()
    }

    pub fn set_mask(&self, mask: EventMask) {
        *self.mask.lock() = mask;
    }

    /// Queues an event if its category is enabled.
    ///
    /// Returns whether the event was queued.
    pub fn push(&self, event: Event) -> bool {
        if !self.mask().allows(event.kind) {
            tracing::trace!("Masked event dropped: {}", event);
            return false;
        }
        self.events.lock().push_back(event);
        self.notify.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Waits until the queue is non-empty or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if !self.is_empty() {
            return true;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        !self.is_empty()
    }

    pub fn drain(&self) -> Vec<Event> {
        self.events.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use swarmfix_core::InfoHash;

    use super::*;

    #[test]
    fn test_masked_categories_are_dropped() {
        let queue = EventQueue::new(EventMask::ERROR);
        assert!(!queue.push(Event::transfer_added(InfoHash::new([1u8; 20]))));
        assert!(queue.push(Event::hash_failed(
            InfoHash::new([1u8; 20]),
            swarmfix_core::PieceIndex::new(0)
        )));

        queue.set_mask(EventMask::ALL);
        assert!(queue.push(Event::stats_snapshot(BTreeMap::new())));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_push() {
        let queue = std::sync::Arc::new(EventQueue::new(EventMask::ALL));
        assert!(!queue.wait(Duration::from_millis(100)).await);

        let pusher = std::sync::Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            pusher.push(Event::transfer_added(InfoHash::new([2u8; 20])));
        });
        assert!(queue.wait(Duration::from_secs(5)).await);
    }
}
