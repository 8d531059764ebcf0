use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::Envelope;
use crate::EnqueueError;

/// Outcome of [`DeliveryQueue::pop_until`].
#[derive(Debug)]
pub(crate) enum Popped {
    Item(Envelope),
    /// Nothing arrived before the deadline.
    TimedOut,
    /// The queue is closed and fully drained.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Envelope>,
    /// Envelopes accepted but not yet acknowledged with [`DeliveryQueue::task_done`].
    unfinished: usize,
    closed: bool,
}

/// Bounded FIFO of envelopes between producers (caller threads) and delivery workers.
///
/// Pushing never blocks: a full or closed queue rejects the envelope.
#[derive(Debug)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    /// Signalled when an item is pushed or the queue is closed.
    available: Condvar,
    /// Signalled when `unfinished` drops to zero.
    drained: Condvar,
    capacity: usize,
}

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` envelopes.
    pub fn new(capacity: usize) -> DeliveryQueue {
        DeliveryQueue {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            drained: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept `envelope` for delivery.
    ///
    /// # Errors
    ///
    /// - [`EnqueueError::QueueFull`] if `capacity` envelopes are waiting.
    /// - [`EnqueueError::ShutDown`] if the queue has been closed.
    pub fn try_push(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EnqueueError::ShutDown);
        }
        if state.items.len() >= self.capacity {
            return Err(EnqueueError::QueueFull);
        }
        state.items.push_back(envelope);
        state.unfinished += 1;
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest envelope, waiting for one until `deadline`.
    ///
    /// A closed queue keeps handing out what it holds before reporting [`Popped::Closed`].
    pub(crate) fn pop_until(&self, deadline: Instant) -> Popped {
        let mut state = self.lock();
        loop {
            if let Some(envelope) = state.items.pop_front() {
                return Popped::Item(envelope);
            }
            if state.closed {
                return Popped::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Popped::TimedOut;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Acknowledge `count` popped envelopes as delivered or dropped.
    pub(crate) fn task_done(&self, count: usize) {
        let mut state = self.lock();
        state.unfinished = state.unfinished.saturating_sub(count);
        if state.unfinished == 0 {
            self.drained.notify_all();
        }
    }

    /// Block until every accepted envelope has been acknowledged, or `timeout` elapses.
    ///
    /// Returns `true` if the queue drained.
    pub fn wait_all_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.unfinished > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .drained
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Stop accepting envelopes and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Return `true` once [`DeliveryQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of envelopes waiting to be picked up by a worker.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
