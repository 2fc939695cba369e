// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Byte-range lock manager.
//!
//! Logical locks are per-descriptor entries on the shared [`Inode`] lock list;
//! real POSIX advisory locks are kept consistent with the union of logical
//! locks. POSIX locks are per-process and not reference-counted, so removing a
//! logical lock must only clear the sub-ranges not still covered by another
//! logical lock on the same inode (see [`compute_holes`]).

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::fd::Fd;
use crate::object::{wake_waiters, Object, WaitQueue};
use crate::registry::Inode;
use crate::types::{LockKind, ProcessId};

/// One active logical lock on an inode.
#[derive(Clone, Debug)]
pub(crate) struct FileLock {
    /// Client process the lock belongs to; its death releases the lock.
    pub owner: ProcessId,
    /// Descriptor the lock was taken through.
    pub fd_id: u64,
    pub kind: LockKind,
    /// Half-open byte range `[start, end)`.
    pub start: u64,
    pub end: u64,
}

fn ranges_overlap(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start < b_end && b_start < a_end
}

fn conflicts(existing: &FileLock, kind: LockKind, start: u64, end: u64) -> bool {
    ranges_overlap(existing.start, existing.end, start, end)
        && (existing.kind == LockKind::Exclusive || kind == LockKind::Exclusive)
}

/// Waitable returned when a lock request conflicts and the caller asked to
/// block. Signaled once the conflicting range frees up; the caller then
/// retries the lock.
pub struct LockWait {
    inode: Arc<Inode>,
    kind: LockKind,
    start: u64,
    end: u64,
    granted: Mutex<bool>,
    queue: WaitQueue,
}

impl LockWait {
    fn new(inode: &Arc<Inode>, kind: LockKind, start: u64, end: u64) -> Arc<Self> {
        let wait = Arc::new(Self {
            inode: Arc::clone(inode),
            kind,
            start,
            end,
            granted: Mutex::new(false),
            queue: WaitQueue::new(),
        });
        inode.lock_waiters.lock().unwrap().push(Arc::downgrade(&wait));
        wait
    }

    pub fn is_granted(&self) -> bool {
        *self.granted.lock().unwrap()
    }

    fn grant(self: &Arc<Self>) {
        *self.granted.lock().unwrap() = true;
        wake_waiters(self.as_ref());
    }
}

impl std::fmt::Debug for LockWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl Object for LockWait {
    fn describe(&self) -> String {
        format!(
            "lock wait [{}, {}) {:?} on inode {}",
            self.start,
            self.end,
            self.kind,
            self.inode.ino()
        )
    }

    fn wait_queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn signaled(&self) -> bool {
        self.is_granted()
    }
}

impl Fd {
    /// Acquire a byte-range lock `[start, start+count)` on the file.
    ///
    /// Returns `Ok(None)` when granted. On conflict, returns
    /// `Err(LockConflict)` when `wait` is false, or `Ok(Some(waitable))` when
    /// `wait` is true — the caller blocks on the waitable and retries.
    pub fn lock(
        self: &Arc<Self>,
        owner: ProcessId,
        start: u64,
        count: u64,
        kind: LockKind,
        wait: bool,
    ) -> BrokerResult<Option<Arc<LockWait>>> {
        let end = start.checked_add(count).ok_or(BrokerError::InvalidArgument)?;
        if count == 0 {
            return Err(BrokerError::InvalidArgument);
        }
        let inode = self.inode().ok_or(BrokerError::InvalidArgument)?;

        {
            let mut locks = inode.locks.lock().unwrap();
            if locks.iter().any(|existing| conflicts(existing, kind, start, end)) {
                if wait {
                    drop(locks);
                    debug!(start, end, ?kind, "lock conflict, queuing waiter");
                    return Ok(Some(LockWait::new(&inode, kind, start, end)));
                }
                return Err(BrokerError::LockConflict);
            }
            locks.push(FileLock {
                owner,
                fd_id: self.id(),
                kind,
                start,
                end,
            });
        }

        if self.fs_locks_enabled() {
            let raw = match self.unix_fd() {
                Ok(raw) => raw,
                Err(err) => {
                    let mut locks = inode.locks.lock().unwrap();
                    remove_exact(&mut locks, self.id(), start, end);
                    return Err(err);
                }
            };
            match set_unix_lock(raw, start, end, Some(kind)) {
                Ok(()) => {}
                Err(LockFailure::Conflict) => {
                    // Held by an uncooperative process outside the broker.
                    let mut locks = inode.locks.lock().unwrap();
                    remove_exact(&mut locks, self.id(), start, end);
                    return Err(BrokerError::LockConflict);
                }
                Err(LockFailure::Unsupported) => {
                    // Filesystem cannot honor advisory locks at all: degrade
                    // this descriptor to always-granted from here on.
                    warn!(fd = self.id(), "advisory locks unsupported, disabling for descriptor");
                    self.disable_fs_locks();
                }
                Err(LockFailure::Other(err)) => {
                    let mut locks = inode.locks.lock().unwrap();
                    remove_exact(&mut locks, self.id(), start, end);
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    /// Release the lock previously taken on exactly `[start, start+count)`.
    /// A range that does not exactly match an entry held through this
    /// descriptor fails with a lock-conflict error.
    pub fn unlock(self: &Arc<Self>, start: u64, count: u64) -> BrokerResult<()> {
        let end = start.checked_add(count).ok_or(BrokerError::InvalidArgument)?;
        let inode = self.inode().ok_or(BrokerError::InvalidArgument)?;

        let holes = {
            let mut locks = inode.locks.lock().unwrap();
            if !remove_exact(&mut locks, self.id(), start, end) {
                return Err(BrokerError::LockConflict);
            }
            compute_holes(&locks, start, end)
        };

        if self.fs_locks_enabled() {
            if let Ok(raw) = self.unix_fd() {
                clear_unix_ranges(raw, &holes);
            }
        }

        retest_lock_waiters(&inode);
        inode.check_pending_closes();
        Ok(())
    }
}

fn remove_exact(locks: &mut Vec<FileLock>, fd_id: u64, start: u64, end: u64) -> bool {
    match locks.iter().position(|l| l.fd_id == fd_id && l.start == start && l.end == end) {
        Some(pos) => {
            locks.remove(pos);
            true
        }
        None => false,
    }
}

/// Release every lock matching `pred` on `inode`, reconciling real lock
/// coverage through `unlock_fd` when one is available.
///
/// Used for descriptor teardown (all locks of one fd) and process death
/// (all locks of one owner).
pub(crate) fn remove_locks_where(
    inode: &Arc<Inode>,
    unlock_fd: Option<RawFd>,
    pred: impl Fn(&FileLock) -> bool,
) {
    let removed: Vec<(Vec<(u64, u64)>, FileLock)> = {
        let mut locks = inode.locks.lock().unwrap();
        let mut removed_locks = Vec::new();
        let mut kept = Vec::new();
        for lock in locks.drain(..) {
            if pred(&lock) {
                removed_locks.push(lock);
            } else {
                kept.push(lock);
            }
        }
        let result = removed_locks
            .into_iter()
            .map(|lock| (compute_holes(&kept, lock.start, lock.end), lock))
            .collect();
        *locks = kept;
        result
    };
    if removed.is_empty() {
        return;
    }
    if let Some(raw) = unlock_fd {
        for (holes, _) in &removed {
            clear_unix_ranges(raw, holes);
        }
    }
    retest_lock_waiters(inode);
    inode.check_pending_closes();
}

/// Sub-ranges of `[start, end)` not covered by any remaining lock.
///
/// Starts with the freed range as one hole, then iterates every overlapping
/// lock, shrinking a hole from either end or splitting it in two when the
/// lock sits in its middle. The surviving holes are exactly the ranges whose
/// real locks must be cleared.
pub(crate) fn compute_holes(locks: &[FileLock], start: u64, end: u64) -> Vec<(u64, u64)> {
    let mut holes = vec![(start, end)];
    for lock in locks {
        if !ranges_overlap(lock.start, lock.end, start, end) {
            continue;
        }
        let mut next = Vec::with_capacity(holes.len() + 1);
        for (hole_start, hole_end) in holes {
            if lock.end <= hole_start || lock.start >= hole_end {
                next.push((hole_start, hole_end));
                continue;
            }
            if lock.start > hole_start {
                next.push((hole_start, lock.start));
            }
            if lock.end < hole_end {
                next.push((lock.end, hole_end));
            }
        }
        holes = next;
        if holes.is_empty() {
            break;
        }
    }
    holes
}

/// Re-examine queued lock waiters after a lock removal.
///
/// Policy: FIFO per range. Waiters are kept in arrival order; every removal
/// scans from the front and grants each waiter whose range no longer
/// conflicts. Earlier waiters do not reserve their range against later ones.
pub(crate) fn retest_lock_waiters(inode: &Arc<Inode>) {
    let pending: Vec<Arc<LockWait>> = {
        let mut waiters = inode.lock_waiters.lock().unwrap();
        waiters.retain(|w| w.strong_count() > 0);
        waiters.iter().filter_map(Weak::upgrade).collect()
    };
    if pending.is_empty() {
        return;
    }
    let mut granted = Vec::new();
    {
        let locks = inode.locks.lock().unwrap();
        for wait in pending {
            if wait.is_granted() {
                continue;
            }
            let blocked =
                locks.iter().any(|existing| conflicts(existing, wait.kind, wait.start, wait.end));
            if !blocked {
                granted.push(wait);
            }
        }
    }
    for wait in granted {
        debug!(start = wait.start, end = wait.end, "lock waiter granted");
        wait.grant();
        let this = Arc::downgrade(&wait);
        inode.lock_waiters.lock().unwrap().retain(|w| !w.ptr_eq(&this));
    }
}

enum LockFailure {
    /// Genuinely held by another process.
    Conflict,
    /// The filesystem cannot honor advisory locks at all.
    Unsupported,
    Other(BrokerError),
}

fn classify_lock_errno(errno: i32) -> LockFailure {
    match errno {
        libc::EACCES | libc::EAGAIN => LockFailure::Conflict,
        libc::ENOLCK | libc::ENOTSUP | libc::EINVAL | libc::EIO => LockFailure::Unsupported,
        other => LockFailure::Other(BrokerError::from_errno(other)),
    }
}

/// Apply (or with `kind == None`, clear) one real POSIX lock over
/// `[start, end)`. Ranges beyond the representable `off_t` span are clamped;
/// a range entirely beyond it succeeds trivially.
fn set_unix_lock(fd: RawFd, start: u64, end: u64, kind: Option<LockKind>) -> Result<(), LockFailure> {
    let l_start = start.min(i64::MAX as u64) as i64;
    let l_end = end.min(i64::MAX as u64) as i64;
    if l_start >= l_end {
        return Ok(());
    }
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = match kind {
        Some(LockKind::Shared) => libc::F_RDLCK as libc::c_short,
        Some(LockKind::Exclusive) => libc::F_WRLCK as libc::c_short,
        None => libc::F_UNLCK as libc::c_short,
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = l_start as libc::off_t;
    fl.l_len = (l_end - l_start) as libc::off_t;
    loop {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
        if rc == 0 {
            return Ok(());
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        if errno == libc::EINTR {
            continue;
        }
        return Err(classify_lock_errno(errno));
    }
}

fn clear_unix_ranges(fd: RawFd, holes: &[(u64, u64)]) {
    for &(start, end) in holes {
        if set_unix_lock(fd, start, end, None).is_err() {
            warn!(fd, start, end, "failed to clear real lock range");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::fd::FileObject;
    use crate::types::{OpenOptions, ShareMode};
    use std::path::Path;

    fn lock_entry(start: u64, end: u64) -> FileLock {
        FileLock {
            owner: ProcessId::new(1),
            fd_id: 1,
            kind: LockKind::Exclusive,
            start,
            end,
        }
    }

    fn open_rw(broker: &Arc<Broker>, path: &Path) -> Arc<FileObject> {
        let opts = OpenOptions {
            access: crate::types::AccessMode::read_write(),
            share: vec![ShareMode::Read, ShareMode::Write, ShareMode::Delete],
            create: true,
            truncate: false,
            directory: false,
            non_directory: true,
            delete_on_close: false,
        };
        FileObject::open(broker, path, &opts).expect("open failed")
    }

    #[test]
    fn holes_untouched_range_survives_whole() {
        // Remaining lock [30, 40) does not intersect the freed [0, 20).
        let holes = compute_holes(&[lock_entry(30, 40)], 0, 20);
        assert_eq!(holes, vec![(0, 20)]);
    }

    #[test]
    fn holes_shrink_from_either_end() {
        let holes = compute_holes(&[lock_entry(0, 5)], 0, 20);
        assert_eq!(holes, vec![(5, 20)]);
        let holes = compute_holes(&[lock_entry(15, 25)], 0, 20);
        assert_eq!(holes, vec![(0, 15)]);
    }

    #[test]
    fn holes_split_by_lock_in_the_middle() {
        let holes = compute_holes(&[lock_entry(5, 10)], 0, 20);
        assert_eq!(holes, vec![(0, 5), (10, 20)]);
    }

    #[test]
    fn holes_fully_covered_range_yields_none() {
        let holes = compute_holes(&[lock_entry(0, 20)], 0, 20);
        assert!(holes.is_empty());
        let holes = compute_holes(&[lock_entry(0, 10), lock_entry(8, 20)], 0, 20);
        assert!(holes.is_empty());
    }

    #[test]
    fn conflicting_request_without_wait_fails_and_leaves_list_unchanged() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let a = open_rw(&broker, &path);
        let b = open_rw(&broker, &path);

        let fd_a = a.fd().unwrap();
        let fd_b = b.fd().unwrap();
        assert!(fd_a
            .lock(ProcessId::new(1), 0, 100, LockKind::Exclusive, false)
            .unwrap()
            .is_none());

        let err = fd_b
            .lock(ProcessId::new(2), 50, 100, LockKind::Exclusive, false)
            .unwrap_err();
        assert!(matches!(err, BrokerError::LockConflict));

        let inode = fd_a.inode().unwrap();
        assert_eq!(inode.lock_count(), 1);
    }

    #[test]
    fn shared_locks_coexist_and_exclusive_conflicts() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let a = open_rw(&broker, &path);
        let b = open_rw(&broker, &path);

        let fd_a = a.fd().unwrap();
        let fd_b = b.fd().unwrap();
        assert!(fd_a.lock(ProcessId::new(1), 0, 10, LockKind::Shared, false).unwrap().is_none());
        assert!(fd_b.lock(ProcessId::new(2), 0, 10, LockKind::Shared, false).unwrap().is_none());
        assert!(matches!(
            fd_b.lock(ProcessId::new(2), 5, 10, LockKind::Exclusive, false),
            Err(BrokerError::LockConflict)
        ));
    }

    #[test]
    fn unlock_requires_exact_range() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let a = open_rw(&broker, &path);
        let fd_a = a.fd().unwrap();

        assert!(fd_a
            .lock(ProcessId::new(1), 0, 10, LockKind::Exclusive, false)
            .unwrap()
            .is_none());
        assert!(matches!(fd_a.unlock(0, 5), Err(BrokerError::LockConflict)));
        assert!(matches!(fd_a.unlock(2, 8), Err(BrokerError::LockConflict)));
        fd_a.unlock(0, 10).unwrap();
        assert_eq!(fd_a.inode().unwrap().lock_count(), 0);
    }

    #[test]
    fn lock_round_trip_leaves_no_residual_coverage() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let a = open_rw(&broker, &path);
        let b = open_rw(&broker, &path);
        let fd_a = a.fd().unwrap();
        let fd_b = b.fd().unwrap();

        assert!(fd_a
            .lock(ProcessId::new(1), 0, 10, LockKind::Exclusive, false)
            .unwrap()
            .is_none());
        fd_a.unlock(0, 10).unwrap();

        // A conflicting exclusive lock from a different owner now succeeds.
        assert!(fd_b
            .lock(ProcessId::new(2), 0, 10, LockKind::Exclusive, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn wrapping_range_is_rejected() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let a = open_rw(&broker, &path);
        let fd_a = a.fd().unwrap();
        assert!(matches!(
            fd_a.lock(ProcessId::new(1), u64::MAX - 5, 100, LockKind::Exclusive, false),
            Err(BrokerError::InvalidArgument)
        ));
    }

    #[test]
    fn waiting_request_returns_waitable_granted_on_release() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let a = open_rw(&broker, &path);
        let b = open_rw(&broker, &path);
        let fd_a = a.fd().unwrap();
        let fd_b = b.fd().unwrap();

        assert!(fd_a
            .lock(ProcessId::new(1), 0, 100, LockKind::Exclusive, false)
            .unwrap()
            .is_none());
        let wait = fd_b
            .lock(ProcessId::new(2), 0, 100, LockKind::Exclusive, true)
            .unwrap()
            .expect("expected a waitable");
        assert!(!wait.signaled());

        fd_a.unlock(0, 100).unwrap();
        assert!(wait.signaled());

        // The retried lock now succeeds.
        assert!(fd_b
            .lock(ProcessId::new(2), 0, 100, LockKind::Exclusive, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn lock_errno_classification() {
        assert!(matches!(classify_lock_errno(libc::EACCES), LockFailure::Conflict));
        assert!(matches!(classify_lock_errno(libc::EAGAIN), LockFailure::Conflict));
        assert!(matches!(classify_lock_errno(libc::ENOLCK), LockFailure::Unsupported));
        assert!(matches!(classify_lock_errno(libc::ENOTSUP), LockFailure::Unsupported));
        assert!(matches!(classify_lock_errno(libc::EBADF), LockFailure::Other(_)));
    }
}
