//! The bounded work queue shared by the item producer and worker pumps.
//!
//! Capacity is the only backpressure against the item source: `push` blocks
//! while the queue is full. Dropping the producer closes the queue, which is
//! the sole termination signal for the workers.

use crate::interrupt::Interrupt;
use crate::step::Item;
use crossbeam::channel::{self, Receiver, RecvError, SendTimeoutError, Sender};
use std::time::Duration;

/// How often a blocked `push` re-checks for an interrupt.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

/// Create a queue holding at most `capacity` items (at least one).
pub fn work_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    (QueueProducer { tx }, QueueConsumer { rx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// An interrupt was raised while waiting for room; the item was dropped.
    Interrupted,
    /// Every consumer is gone; the item was dropped.
    Disconnected,
}

/// The producing side. Closing it (`close` or drop) ends the stream.
#[derive(Debug)]
pub struct QueueProducer {
    tx: Sender<Item>,
}

impl QueueProducer {
    /// Enqueue one item, blocking while the queue is full.
    pub fn push(&self, item: Item, interrupt: &Interrupt) -> PushOutcome {
        let mut item = item;
        loop {
            if interrupt.is_raised() {
                return PushOutcome::Interrupted;
            }
            match self.tx.send_timeout(item, INTERRUPT_POLL) {
                Ok(()) => return PushOutcome::Queued,
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(_)) => return PushOutcome::Disconnected,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }

    pub fn close(self) {
        drop(self);
    }
}

/// The consuming side, cloned once per worker.
#[derive(Debug, Clone)]
pub struct QueueConsumer {
    rx: Receiver<Item>,
}

impl QueueConsumer {
    /// Dequeue the next item, blocking while the queue is empty. Returns
    /// `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<Item> {
        match self.rx.recv() {
            Ok(item) => Some(item),
            Err(RecvError) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
