// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! NT Broker Core — Windows file-object semantics over POSIX descriptors
//!
//! This crate implements the object, descriptor, lock and async-I/O layers
//! of a user-space broker: per-handle byte-range locks reconciled against
//! per-process POSIX advisory locks, sharing-mode enforcement, deferred
//! closes, delete-on-close, pending asynchronous operations with timeouts,
//! and the readiness multiplexer driving it all.

pub mod aio;
pub mod broker;
pub mod error;
pub mod fd;
pub mod lock;
pub mod object;
pub mod reactor;
pub mod registry;
pub mod types;

// Re-export key types
pub use aio::{Async, AsyncCompletion, AsyncHandle, TimerId, TimerQueue};
pub use broker::Broker;
pub use error::{BrokerError, BrokerResult};
pub use fd::{Fd, FileObject};
pub use lock::LockWait;
pub use object::{wake_waiters, FileInfo, Object, WaitQueue, Waiter, WaiterId};
pub use reactor::Reactor;
pub use registry::{Device, DeviceRegistry, FileId, Inode};
pub use types::{
    AccessMode,
    AsyncStatus,
    CoreConfig,
    LockKind,
    OpenOptions,
    PollEvents,
    ProcessId,
    QueueKind,
    ShareMode,
};

/// Pipe pair for readiness tests: (read end, write end).
#[cfg(test)]
pub(crate) fn test_pipe() -> (std::os::unix::io::OwnedFd, std::os::unix::io::OwnedFd) {
    use std::os::unix::io::{FromRawFd, OwnedFd};
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe creation failed");
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}
