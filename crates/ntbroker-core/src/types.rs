// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for the ntbroker object/descriptor layer

use serde::{Deserialize, Serialize};

/// Identifier of the client process an operation is performed on behalf of.
///
/// Byte-range locks are owned by a process; all locks owned by a process are
/// released en masse when that process dies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub fn new(pid: u32) -> Self {
        Self(pid)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Access granted to a descriptor at open time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccessMode {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl AccessMode {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            delete: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            delete: false,
        }
    }
}

/// Share mode granted to other opens of the same file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareMode {
    Read,
    Write,
    Delete,
}

/// Options for opening a named descriptor
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub access: AccessMode,
    pub share: Vec<ShareMode>,
    pub create: bool,
    pub truncate: bool,
    /// The target must be a directory
    pub directory: bool,
    /// The target must not be a directory
    pub non_directory: bool,
    /// Unlink the file once the last descriptor referencing it is released
    pub delete_on_close: bool,
}

impl OpenOptions {
    /// Read-only open sharing everything, the least demanding combination.
    pub fn read_shared() -> Self {
        Self {
            access: AccessMode::read_only(),
            share: vec![ShareMode::Read, ShareMode::Write, ShareMode::Delete],
            create: false,
            truncate: false,
            directory: false,
            non_directory: false,
            delete_on_close: false,
        }
    }
}

/// Lock kind for byte-range locking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Which pending-operation queue of a descriptor an async request joins
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Read,
    Write,
}

/// Completion status delivered to an async request, exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncStatus {
    /// The descriptor became ready for the requested direction
    Ready,
    /// The request's timeout expired before readiness
    TimedOut,
    /// The request was explicitly cancelled or its resources torn down
    Cancelled,
    /// The owning device was unmounted
    Dismounted,
}

/// Poll event mask for readiness interest and delivery.
///
/// A thin wrapper over the platform `poll` bits so descriptor capability
/// implementations and the multiplexer share one vocabulary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollEvents(pub i16);

impl PollEvents {
    pub const NONE: PollEvents = PollEvents(0);
    pub const READ: PollEvents = PollEvents(libc::POLLIN);
    pub const WRITE: PollEvents = PollEvents(libc::POLLOUT);
    pub const ERROR: PollEvents = PollEvents(libc::POLLERR);
    pub const HANGUP: PollEvents = PollEvents(libc::POLLHUP);

    pub fn union(self, other: PollEvents) -> PollEvents {
        PollEvents(self.0 | other.0)
    }

    pub fn intersects(self, other: PollEvents) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Tunables for the broker core
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Initial size of the multiplexer's slot table
    #[serde(rename = "initial-poll-slots")]
    pub initial_poll_slots: usize,
    /// Hard cap on multiplexer slots; allocation past this fails
    #[serde(rename = "max-poll-slots")]
    pub max_poll_slots: Option<usize>,
    /// Timeout applied by `queue_default`, in milliseconds
    #[serde(rename = "default-async-timeout-ms")]
    pub default_async_timeout_ms: u64,
    /// Whether to attempt the scalable readiness backend where available
    #[serde(rename = "fast-poll-backend")]
    pub fast_poll_backend: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            initial_poll_slots: 64,
            max_poll_slots: None,
            default_async_timeout_ms: 30_000,
            fast_poll_backend: true,
        }
    }
}
