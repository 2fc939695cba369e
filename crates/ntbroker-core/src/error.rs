// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the ntbroker core

use std::io;

/// Core broker error type
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("sharing violation")]
    SharingViolation,
    #[error("lock conflict")]
    LockConflict,
    #[error("wrong object kind")]
    WrongObjectKind,
    #[error("device dismounted")]
    Dismounted,
    #[error("timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
    #[error("out of resources")]
    OutOfResources,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Map an errno from a failed syscall into a broker error.
    pub(crate) fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => BrokerError::NotFound,
            libc::EACCES | libc::EPERM => BrokerError::AccessDenied,
            libc::ENOTDIR => BrokerError::NotADirectory,
            libc::EISDIR => BrokerError::IsADirectory,
            libc::EINVAL => BrokerError::InvalidArgument,
            libc::EMFILE | libc::ENFILE | libc::ENOMEM => BrokerError::OutOfResources,
            _ => BrokerError::Io(io::Error::from_raw_os_error(errno)),
        }
    }

    pub(crate) fn last_os_error() -> Self {
        Self::from_errno(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}
