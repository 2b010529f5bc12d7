//! Thread-safe FIFO message queue with optional per-message completion.
//!
//! A message is delivered to exactly one [`Consumer`], in enqueue order. Messages sent
//! with [`EventQueue::enqueue_joinable()`] carry a completion signal, so the producer can
//! [`join`](JoinHandle::join) until the consumer has finished processing that specific
//! message, not merely received it.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

/// Producer handle. Cloning yields another handle to the same queue.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}

struct State<T> {
    messages: VecDeque<Delivery<T>>,
    closed: bool,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let state = State { messages: VecDeque::new(), closed: false };
        let shared = Arc::new(Shared { state: Mutex::new(state), available: Condvar::new() });

        Self { shared }
    }

    /// Append `message` and return immediately.
    ///
    /// Messages sent after [`close()`](Self::close) are dropped.
    pub fn enqueue(&self, message: T) {
        self.push(Delivery { message, ack: Ack(None) });
    }

    /// Append `message` with a completion signal, returning a handle to wait on it.
    ///
    /// If the queue is closed, the message is dropped and the handle is already complete.
    pub fn enqueue_joinable(&self, message: T) -> JoinHandle {
        let completion = Arc::new(Completion::default());
        let handle = JoinHandle { completion: completion.clone() };

        self.push(Delivery { message, ack: Ack(Some(completion)) });

        handle
    }

    fn push(&self, delivery: Delivery<T>) {
        let mut state = self.shared.lock();

        if state.closed {
            trace!("dropping message sent to closed queue");
            return;
        }

        state.messages.push_back(delivery);
        drop(state);

        self.shared.available.notify_one();
    }

    /// Register a new consumer.
    pub fn consumer(&self) -> Consumer<T> {
        Consumer { shared: self.shared.clone() }
    }

    /// Stop accepting messages. Consumers drain what is queued, then observe `None`.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving side of an [`EventQueue`]. Each message goes to exactly one consumer.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Consumer<T> {
    /// Block until a message is available and remove it from the head of the queue.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub fn consume(&self) -> Option<Delivery<T>> {
        let state = self.shared.lock();
        let mut state = self
            .shared
            .available
            .wait_while(state, |s| s.messages.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        state.messages.pop_front()
    }

    /// Remove the head message if one is queued, without blocking.
    pub fn try_consume(&self) -> Option<Delivery<T>> {
        self.shared.lock().messages.pop_front()
    }

    /// As [`consume()`](Self::consume), but give up after `timeout`.
    pub fn consume_timeout(&self, timeout: Duration) -> Option<Delivery<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        loop {
            if let Some(delivery) = state.messages.pop_front() {
                return Some(delivery);
            }

            let now = Instant::now();
            if state.closed || now >= deadline {
                return None;
            }

            state = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .map(|(state, _)| state)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Consume a message and immediately mark it complete.
    pub fn recv(&self) -> Option<T> {
        self.consume().map(Delivery::into_inner)
    }
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

/// A consumed message. Dropping it, or its [`Ack`], marks it complete.
pub struct Delivery<T> {
    message: T,
    ack: Ack,
}

impl<T> Delivery<T> {
    /// Split into the message and the acknowledgement to signal once processing is done.
    pub fn into_parts(self) -> (T, Ack) {
        let Delivery { message, ack } = self;
        (message, ack)
    }

    /// Take the message, marking it complete.
    pub fn into_inner(self) -> T {
        let (message, ack) = self.into_parts();
        ack.complete();
        message
    }

    /// Whether a producer may be blocked on this message.
    pub fn is_joinable(&self) -> bool {
        self.ack.0.is_some()
    }
}

impl<T> Deref for Delivery<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.message
    }
}

/// Completion signal of one delivered message. Signals exactly once, at the latest on drop.
#[must_use = "dropping an `Ack` completes the message immediately"]
pub struct Ack(Option<Arc<Completion>>);

impl Ack {
    pub fn complete(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(completion) = self.0.take() {
            completion.finish();
        }
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        self.signal();
    }
}

#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    finished: Condvar,
}

impl Completion {
    fn finish(&self) {
        *self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        self.finished.notify_all();
    }

    fn is_finished(&self) -> bool {
        *self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(&self) {
        let done = self.done.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _done = self
            .finished
            .wait_while(done, |done| !*done)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
    }
}

/// Producer-side handle on a joinable message.
#[must_use = "use `detach()` to explicitly ignore completion"]
pub struct JoinHandle {
    completion: Arc<Completion>,
}

impl JoinHandle {
    /// Block until the consumer has finished processing the message.
    pub fn join(self) {
        self.completion.wait();
    }

    /// Give up interest in completion without blocking.
    pub fn detach(self) {}

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }
}
