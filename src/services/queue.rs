use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// What a full single-slot buffer does with a new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Replace the pending item; the older one is never delivered.
    Overwrite,
    /// Reject the new item while one is pending.
    Drop,
}

/// Backpressure policy of a [`WorkQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Ordered queue. With a capacity, pushes beyond it are rejected (never blocked).
    Fifo { capacity: Option<NonZeroUsize> },
    /// At most one pending item.
    SingleSlot { overflow: Overflow },
}

impl QueuePolicy {
    pub fn unbounded() -> Self {
        Self::Fifo { capacity: None }
    }

    pub fn bounded(capacity: NonZeroUsize) -> Self {
        Self::Fifo {
            capacity: Some(capacity),
        }
    }

    pub fn overwrite() -> Self {
        Self::SingleSlot {
            overflow: Overflow::Overwrite,
        }
    }

    pub fn drop_newest() -> Self {
        Self::SingleSlot {
            overflow: Overflow::Drop,
        }
    }

    /// Queue size convention of the device agent: 0 means unbounded.
    pub fn from_size(size: usize) -> Self {
        match NonZeroUsize::new(size) {
            Some(capacity) => Self::bounded(capacity),
            None => Self::unbounded(),
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Accepted, and an unconsumed pending item was discarded.
    Replaced,
    Full,
    Occupied,
    Closed,
}

impl Enqueued {
    pub fn is_accepted(self) -> bool {
        matches!(self, Enqueued::Accepted | Enqueued::Replaced)
    }
}

/// Result of a non-blocking pop.
#[derive(Debug)]
pub enum Popped<T> {
    Item(T),
    Empty,
    /// Closed and fully drained.
    Closed,
}

struct Slots<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe container between any number of producers and one worker.
///
/// Producers never block: [`WorkQueue::push`] reports rejection instead.
/// The worker waits for items with [`WorkQueue::notified`].
pub struct WorkQueue<T> {
    policy: QueuePolicy,
    slots: Mutex<Slots<T>>,
    notify: Notify,
}

impl<T> WorkQueue<T> {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(Slots {
                items: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    // A panicking producer must not wedge the queue for everyone else.
    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an item according to the queue policy.
    pub fn push(&self, item: T) -> Enqueued {
        let result = {
            let mut slots = self.lock();
            if slots.closed {
                return Enqueued::Closed;
            }
            match self.policy {
                QueuePolicy::Fifo { capacity } => {
                    if capacity.is_some_and(|cap| slots.items.len() >= cap.get()) {
                        return Enqueued::Full;
                    }
                    slots.items.push_back(item);
                    Enqueued::Accepted
                }
                QueuePolicy::SingleSlot { overflow } => {
                    // The worker takes the item out of the slot before processing it,
                    // so the slot is occupied only while an item is genuinely waiting.
                    if slots.items.is_empty() {
                        slots.items.push_back(item);
                        Enqueued::Accepted
                    } else if overflow == Overflow::Overwrite {
                        slots.items.clear();
                        slots.items.push_back(item);
                        Enqueued::Replaced
                    } else {
                        return Enqueued::Occupied;
                    }
                }
            }
        };
        self.notify.notify_one();
        result
    }

    /// Take the next item without waiting.
    pub fn pop(&self) -> Popped<T> {
        let mut slots = self.lock();
        match slots.items.pop_front() {
            Some(item) => Popped::Item(item),
            None if slots.closed => Popped::Closed,
            None => Popped::Empty,
        }
    }

    /// Completes after the next push or close. A push that happened since the
    /// last wait is remembered, so checking [`WorkQueue::pop`] first and then
    /// awaiting this never misses a wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Stop accepting items. Items already queued can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
