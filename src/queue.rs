//! RequestQueue - thread-safe FIFO feeding the worker pool
//!
//! One producer (the receive loop) and N consumers (workers) share the
//! queue. Insertion order is service order; there is no priority. Each
//! request is delivered to exactly one worker.
//!
//! The queue is unbounded by default, matching the historical
//! behavior; `bounded()` opts into backpressure where `push` reports
//! `Full` and the caller answers with a busy rejection.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A decoded request waiting for a worker.
///
/// Created when an inbound payload decodes; consumed exactly once;
/// never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub query_id: String,
    pub query_text: String,
    /// Opaque routing token for the reply.
    pub reply_identity: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Queue closed for shutdown; the request is rejected.
    Closed,
    /// Bounded queue at capacity.
    Full,
}

struct QueueState {
    items: VecDeque<PendingRequest>,
    closed: bool,
}

pub struct RequestQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: Option<usize>,
}

impl RequestQueue {
    /// The historical unbounded queue: a push never fails while the
    /// queue is open.
    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    /// Bounded variant; `push` returns `Full` at capacity.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Append to the tail and wake one blocked worker.
    pub fn push(&self, request: PendingRequest) -> Result<(), PushError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(PushError::Closed);
        }
        if let Some(cap) = self.capacity {
            if state.items.len() >= cap {
                return Err(PushError::Full);
            }
        }
        state.items.push_back(request);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Block until an item is available, then remove and return the
    /// head. Returns `None` once the queue is closed; items still
    /// queued at close time are abandoned, not drained.
    pub fn pop_blocking(&self) -> Option<PendingRequest> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return None;
            }
            if let Some(request) = state.items.pop_front() {
                return Some(request);
            }
            state = self.ready.wait(state).unwrap();
        }
    }

    /// Close the queue: subsequent pushes fail and every blocked
    /// worker wakes up and observes `None`.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
