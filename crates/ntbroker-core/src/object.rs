// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Generic kernel-object model.
//!
//! Every brokered resource (file, lock-conflict waitable, and the object types
//! higher layers add) implements [`Object`]. The trait is the capability table:
//! members with no meaning for a given object kind keep the default
//! implementation, which uniformly fails with [`BrokerError::WrongObjectKind`]
//! so every object responds predictably to every capability query.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::aio::{AsyncCompletion, AsyncHandle};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{AccessMode, PollEvents, QueueKind};

/// A thread (or any consumer) blocked on an object.
pub trait Waiter: Send + Sync {
    /// Deliver the wakeup. `abandoned` reports whether the object's owner died
    /// without releasing it.
    fn wake(&self, abandoned: bool);
}

/// Identifier returned by [`WaitQueue::add`], used to unregister.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaiterId(u64);

/// Registration list for threads waiting on one object, in arrival order.
#[derive(Default)]
pub struct WaitQueue {
    inner: Mutex<WaitQueueState>,
}

#[derive(Default)]
struct WaitQueueState {
    next_id: u64,
    waiters: Vec<(WaiterId, Arc<dyn Waiter>)>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, waiter: Arc<dyn Waiter>) -> WaiterId {
        let mut state = self.inner.lock().unwrap();
        let id = WaiterId(state.next_id);
        state.next_id += 1;
        state.waiters.push((id, waiter));
        id
    }

    pub fn remove(&self, id: WaiterId) -> bool {
        let mut state = self.inner.lock().unwrap();
        let before = state.waiters.len();
        state.waiters.retain(|(wid, _)| *wid != id);
        state.waiters.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop_front(&self) -> Option<Arc<dyn Waiter>> {
        let mut state = self.inner.lock().unwrap();
        if state.waiters.is_empty() {
            None
        } else {
            Some(state.waiters.remove(0).1)
        }
    }
}

/// File info exposed through the descriptor capability group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub len: u64,
}

/// Capability table of a brokered kernel object.
///
/// The table is fixed at creation: implementations never swap methods at
/// runtime. Concrete kinds in this crate are [`crate::fd::FileObject`] and
/// [`crate::lock::LockWait`]; higher layers add their own.
pub trait Object: Send + Sync {
    /// One-line description for debug logging ("dump" capability).
    fn describe(&self) -> String;

    /// Optional object name.
    fn name(&self) -> Option<String> {
        None
    }

    /// Registration list for waiting threads.
    fn wait_queue(&self) -> &WaitQueue;

    /// Register a waiting thread.
    fn add_waiter(&self, waiter: Arc<dyn Waiter>) -> WaiterId {
        self.wait_queue().add(waiter)
    }

    /// Unregister a waiting thread.
    fn remove_waiter(&self, id: WaiterId) -> bool {
        self.wait_queue().remove(id)
    }

    /// Pure predicate: is the object currently signaled?
    fn signaled(&self) -> bool {
        false
    }

    /// Invoked once when a wait on this object is granted. Returns whether the
    /// wait was abandoned (owner died without releasing).
    fn satisfied(&self) -> bool {
        false
    }

    /// Explicit signal-this-object request. Must check access rights before
    /// mutating state.
    fn signal(&self, _access: AccessMode) -> BrokerResult<()> {
        Err(BrokerError::WrongObjectKind)
    }

    /// The real POSIX descriptor backing this object, if any.
    fn unix_fd(&self) -> BrokerResult<RawFd> {
        Err(BrokerError::WrongObjectKind)
    }

    /// Last-handle-closed notification. The default does nothing.
    fn close(&self) {}

    // Descriptor capability group (consumers implement a subset)

    /// Readiness events the object currently wants from the multiplexer.
    fn poll_interest(&self) -> BrokerResult<PollEvents> {
        Err(BrokerError::WrongObjectKind)
    }

    /// Flush buffered state to the underlying resource.
    fn flush(&self) -> BrokerResult<()> {
        Err(BrokerError::WrongObjectKind)
    }

    /// Basic file information flags.
    fn file_info(&self) -> BrokerResult<FileInfo> {
        Err(BrokerError::WrongObjectKind)
    }

    /// Queue an asynchronous operation against this object.
    fn queue_async(
        &self,
        _kind: QueueKind,
        _completion: AsyncCompletion,
        _timeout: Option<Duration>,
    ) -> BrokerResult<AsyncHandle> {
        Err(BrokerError::WrongObjectKind)
    }

    /// Cancel every pending asynchronous operation on this object.
    fn cancel_async(&self) -> BrokerResult<()> {
        Err(BrokerError::WrongObjectKind)
    }
}

/// Grant waits on `object` while it stays signaled.
///
/// Each granted wait consumes one queued waiter (front first) and invokes
/// `satisfied` exactly once for it.
pub fn wake_waiters(object: &dyn Object) {
    while object.signaled() {
        let Some(waiter) = object.wait_queue().pop_front() else {
            break;
        };
        let abandoned = object.satisfied();
        waiter.wake(abandoned);
    }
}
