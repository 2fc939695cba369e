// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Asynchronous I/O requests and the global timer queue.
//!
//! An [`Async`] is created when an operation cannot complete immediately. It
//! lives in exactly one of its descriptor's pending queues until
//! [`Async::terminate`] runs — the single exit path shared by readiness
//! delivery, timer expiry, explicit cancel, and resource teardown. The
//! completion callback is consumed (`Option::take`) under the request's lock
//! before any other side effect, so delivery happens at most once no matter
//! which path fires first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::debug;

use crate::types::AsyncStatus;

/// Completion target: invoked exactly once with the final status.
pub type AsyncCompletion = Box<dyn FnOnce(AsyncStatus) + Send>;

/// Shared handle to a pending async request, returned to the consumer so it
/// can cancel.
pub type AsyncHandle = Arc<Async>;

/// One pending asynchronous operation.
pub struct Async {
    state: Mutex<AsyncState>,
}

struct AsyncState {
    completion: Option<AsyncCompletion>,
    timer: Option<TimerId>,
    queue: Option<Weak<QueueState>>,
}

impl Async {
    pub(crate) fn new(completion: AsyncCompletion) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AsyncState {
                completion: Some(completion),
                timer: None,
                queue: None,
            }),
        })
    }

    pub(crate) fn set_timer(&self, timer: TimerId) {
        self.state.lock().unwrap().timer = Some(timer);
    }

    /// Deliver the completion and dismantle the request.
    ///
    /// Safe to call from any of the four exit paths; every call after the
    /// first is a no-op. The request is unlinked from its queue and timer
    /// before the completion runs, so a completion that re-queues cannot
    /// observe the old registration.
    pub fn terminate(self: &Arc<Self>, timers: &TimerQueue, status: AsyncStatus) {
        let (completion, timer, queue) = {
            let mut state = self.state.lock().unwrap();
            match state.completion.take() {
                None => return,
                Some(completion) => (completion, state.timer.take(), state.queue.take()),
            }
        };
        if let Some(timer) = timer {
            timers.cancel(timer);
        }
        if let Some(queue) = queue.and_then(|weak| weak.upgrade()) {
            queue.entries.lock().unwrap().retain(|entry| !Arc::ptr_eq(entry, self));
        }
        debug!(?status, "async request terminated");
        completion(status);
    }

    /// Whether the request is still awaiting completion.
    pub fn is_pending(&self) -> bool {
        self.state.lock().unwrap().completion.is_some()
    }
}

/// Pending-operation queue of one descriptor direction (read or write).
#[derive(Clone, Default)]
pub(crate) struct AsyncQueue {
    state: Arc<QueueState>,
}

#[derive(Default)]
struct QueueState {
    entries: Mutex<VecDeque<Arc<Async>>>,
}

impl AsyncQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, request: &Arc<Async>) {
        request.state.lock().unwrap().queue = Some(Arc::downgrade(&self.state));
        self.state.entries.lock().unwrap().push_back(Arc::clone(request));
    }

    pub(crate) fn front(&self) -> Option<Arc<Async>> {
        self.state.entries.lock().unwrap().front().cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.entries.lock().unwrap().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, request: &Arc<Async>) -> bool {
        self.state.entries.lock().unwrap().iter().any(|entry| Arc::ptr_eq(entry, request))
    }

    /// Remove and return every queued request, for en-masse termination.
    pub(crate) fn drain(&self) -> Vec<Arc<Async>> {
        self.state.entries.lock().unwrap().drain(..).collect()
    }
}

/// Identifier of one queued timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(u64);

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    id: TimerId,
    when: Instant,
    callback: TimerCallback,
}

/// Global list of pending timers, kept in strict expiry order.
#[derive(Default)]
pub struct TimerQueue {
    state: Mutex<TimerState>,
}

#[derive(Default)]
struct TimerState {
    next_id: u64,
    /// Sorted by `when`, earliest first; equal deadlines keep insertion order.
    entries: Vec<TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, when: Instant, callback: TimerCallback) -> TimerId {
        let mut state = self.state.lock().unwrap();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        let pos = state.entries.partition_point(|entry| entry.when <= when);
        state.entries.insert(pos, TimerEntry { id, when, callback });
        id
    }

    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|entry| entry.id != id);
        state.entries.len() != before
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.state.lock().unwrap().entries.first().map(|entry| entry.when)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    /// Fire every timer whose deadline has passed. Expired entries are removed
    /// from the list before their callbacks run, so a callback that re-arms a
    /// timer cannot corrupt iteration.
    pub fn fire_expired(&self, now: Instant) -> usize {
        let expired: Vec<TimerEntry> = {
            let mut state = self.state.lock().unwrap();
            let split = state.entries.partition_point(|entry| entry.when <= now);
            state.entries.drain(..split).collect()
        };
        let count = expired.len();
        for entry in expired {
            (entry.callback)();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn terminate_delivers_exactly_once() {
        let timers = TimerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let request = Async::new(Box::new(move |status| {
            assert_eq!(status, AsyncStatus::TimedOut);
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        let queue = AsyncQueue::new();
        queue.push(&request);
        assert!(queue.contains(&request));

        request.terminate(&timers, AsyncStatus::TimedOut);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        assert!(!request.is_pending());

        // Cancelling an already-completed request is a no-op.
        request.terminate(&timers, AsyncStatus::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timers_fire_in_expiry_order() {
        let timers = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();

        for (label, offset_ms) in [("late", 20u64), ("early", 5), ("middle", 10)] {
            let order = Arc::clone(&order);
            timers.add(
                now + Duration::from_millis(offset_ms),
                Box::new(move || order.lock().unwrap().push(label)),
            );
        }

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(5)));
        let fired = timers.fire_expired(now + Duration::from_millis(30));
        assert_eq!(fired, 3);
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let timers = TimerQueue::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let now = Instant::now();
        let id = timers.add(
            now,
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        timers.fire_expired(now + Duration::from_millis(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_rearm_without_corrupting_the_list() {
        let timers = Arc::new(TimerQueue::new());
        let timers2 = Arc::clone(&timers);
        let now = Instant::now();
        timers.add(
            now,
            Box::new(move || {
                timers2.add(now + Duration::from_secs(3600), Box::new(|| {}));
            }),
        );
        assert_eq!(timers.fire_expired(now + Duration::from_millis(1)), 1);
        // The re-armed timer is pending, not fired.
        assert!(!timers.is_empty());
    }
}
