// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Descriptor manager.
//!
//! A [`Fd`] wraps one real POSIX descriptor per logical open and attaches it
//! to the shared [`Inode`] record (or to none, for anonymous pipe ends). The
//! subtle part lives in the close path: POSIX drops *all* advisory locks a
//! process holds on an inode as soon as *any* descriptor for that inode is
//! closed, so a descriptor whose handle is logically closed while other locks
//! on the inode remain outstanding must keep its real descriptor open. Such
//! descriptors are handed to the inode as [`ClosedFd`] records and only
//! actually closed once the inode's lock list allows it.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::aio::{Async, AsyncCompletion, AsyncHandle, AsyncQueue};
use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::lock::remove_locks_where;
use crate::object::{wake_waiters, FileInfo, Object, WaitQueue};
use crate::registry::{FileId, Inode};
use crate::types::{AccessMode, AsyncStatus, OpenOptions, PollEvents, QueueKind, ShareMode};

/// A retained-but-released descriptor.
///
/// Created when a descriptor logically closes while the inode's lock list (or
/// a pending delete-on-close) still requires the real descriptor or its
/// pathname to survive.
pub(crate) struct ClosedFd {
    unix_fd: Option<OwnedFd>,
    /// Pathname to unlink on the inode's last close, if delete-on-close.
    pub(crate) unlink: Option<PathBuf>,
    /// Identity at open time; re-verified before unlinking.
    pub(crate) file_id: FileId,
}

impl ClosedFd {
    /// Record carrying only delete-on-close intent; the real descriptor is
    /// filled in when the owning [`Fd`] drops.
    pub(crate) fn unlink_intent(path: PathBuf, file_id: FileId) -> Self {
        Self {
            unix_fd: None,
            unlink: Some(path),
            file_id,
        }
    }

    pub(crate) fn close_unix_fd(&mut self) {
        self.unix_fd = None;
    }
}

/// One logical open of a resource.
pub struct Fd {
    id: u64,
    broker: Weak<Broker>,
    unix_fd: Mutex<Option<OwnedFd>>,
    pub(crate) access: AccessMode,
    pub(crate) share: Vec<ShareMode>,
    inode: Mutex<Option<Arc<Inode>>>,
    poll_slot: Mutex<Option<usize>>,
    pub(crate) read_queue: AsyncQueue,
    pub(crate) write_queue: AsyncQueue,
    /// Cleared once the filesystem proves unable to honor advisory locks;
    /// all later lock requests on this descriptor succeed trivially.
    fs_locks: Mutex<bool>,
    /// Delete-on-close record prepared at open time.
    pending_close: Mutex<Option<ClosedFd>>,
    /// Owning capability object, for generic wakeups.
    user: Mutex<Weak<dyn Object>>,
}

impl Fd {
    pub(crate) fn new_unbound(id: u64, broker: &Arc<Broker>, access: AccessMode, share: Vec<ShareMode>) -> Arc<Self> {
        Arc::new(Self {
            id,
            broker: Arc::downgrade(broker),
            unix_fd: Mutex::new(None),
            access,
            share,
            inode: Mutex::new(None),
            poll_slot: Mutex::new(None),
            read_queue: AsyncQueue::new(),
            write_queue: AsyncQueue::new(),
            fs_locks: Mutex::new(true),
            pending_close: Mutex::new(None),
            user: Mutex::new(Weak::<FileObject>::new() as Weak<dyn Object>),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn inode(&self) -> Option<Arc<Inode>> {
        self.inode.lock().unwrap().clone()
    }

    /// The real POSIX descriptor, or `Dismounted` if it was torn down.
    pub fn unix_fd(&self) -> BrokerResult<RawFd> {
        self.unix_fd
            .lock()
            .unwrap()
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(BrokerError::Dismounted)
    }

    pub(crate) fn fs_locks_enabled(&self) -> bool {
        *self.fs_locks.lock().unwrap()
    }

    pub(crate) fn disable_fs_locks(&self) {
        *self.fs_locks.lock().unwrap() = false;
    }

    pub(crate) fn set_user(&self, user: Weak<dyn Object>) {
        *self.user.lock().unwrap() = user;
    }

    pub(crate) fn set_poll_slot(&self, slot: usize) {
        *self.poll_slot.lock().unwrap() = Some(slot);
    }

    /// Multiplexer slot assigned to this descriptor, for interest changes.
    pub fn poll_slot(&self) -> Option<usize> {
        *self.poll_slot.lock().unwrap()
    }

    pub(crate) fn bind_unix_fd(&self, fd: OwnedFd) {
        let raw = fd.as_raw_fd();
        *self.unix_fd.lock().unwrap() = Some(fd);
        if let (Some(broker), Some(slot)) = (self.broker.upgrade(), self.poll_slot()) {
            broker.reactor.set_slot_fd(slot, raw);
        }
    }

    pub(crate) fn attach_inode(&self, inode: Arc<Inode>, pending: Option<ClosedFd>) {
        *self.pending_close.lock().unwrap() = pending;
        *self.inode.lock().unwrap() = Some(inode);
    }

    /// Whether this descriptor's open carries delete (unlink) intent.
    pub(crate) fn delete_pending(&self) -> bool {
        self.pending_close.lock().unwrap().as_ref().map(|rec| rec.unlink.is_some()).unwrap_or(false)
    }

    /// Readiness events this descriptor currently needs from the multiplexer.
    pub fn interest(&self) -> PollEvents {
        let mut events = PollEvents::NONE;
        if !self.read_queue.is_empty() {
            events = events.union(PollEvents::READ);
        }
        if !self.write_queue.is_empty() {
            events = events.union(PollEvents::WRITE);
        }
        events
    }

    pub(crate) fn update_poll_interest(&self, broker: &Broker) {
        if let Some(slot) = self.poll_slot() {
            let events = self.interest();
            let interest = if events.is_empty() { None } else { Some(events) };
            broker.reactor.set_interest(slot, interest);
        }
    }

    /// Queue an async operation; it completes on readiness, timeout expiry,
    /// cancellation, or teardown — whichever happens first.
    pub fn queue_async(
        self: &Arc<Self>,
        kind: QueueKind,
        completion: AsyncCompletion,
        timeout: Option<Duration>,
    ) -> BrokerResult<AsyncHandle> {
        let broker = self.broker.upgrade().ok_or(BrokerError::Cancelled)?;
        self.unix_fd()?;

        let request = Async::new(completion);
        match kind {
            QueueKind::Read => self.read_queue.push(&request),
            QueueKind::Write => self.write_queue.push(&request),
        }
        if let Some(timeout) = timeout {
            let when = Instant::now() + timeout;
            let weak_request = Arc::downgrade(&request);
            let weak_broker = Arc::downgrade(&broker);
            let weak_fd = Arc::downgrade(self);
            let timer = broker.reactor.timers.add(
                when,
                Box::new(move || {
                    let (Some(broker), Some(request)) = (weak_broker.upgrade(), weak_request.upgrade())
                    else {
                        return;
                    };
                    request.terminate(&broker.reactor.timers, AsyncStatus::TimedOut);
                    if let Some(fd) = weak_fd.upgrade() {
                        fd.update_poll_interest(&broker);
                    }
                }),
            );
            request.set_timer(timer);
        }
        self.update_poll_interest(&broker);
        Ok(request)
    }

    /// Queue with the configured default timeout.
    pub fn queue_async_default(
        self: &Arc<Self>,
        kind: QueueKind,
        completion: AsyncCompletion,
    ) -> BrokerResult<AsyncHandle> {
        let broker = self.broker.upgrade().ok_or(BrokerError::Cancelled)?;
        let timeout = Duration::from_millis(broker.config().default_async_timeout_ms);
        self.queue_async(kind, completion, Some(timeout))
    }

    /// Force-complete every pending async request with `Cancelled`.
    pub fn cancel_asyncs(&self) {
        self.terminate_asyncs(AsyncStatus::Cancelled);
    }

    fn terminate_asyncs(&self, status: AsyncStatus) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        for request in self.read_queue.drain().into_iter().chain(self.write_queue.drain()) {
            request.terminate(&broker.reactor.timers, status);
        }
        self.update_poll_interest(&broker);
    }

    /// Readiness delivery from the multiplexer. Default behavior: complete the
    /// head of whichever pending queue matches the event; with nothing queued,
    /// wake generic waiters on the owning object.
    pub(crate) fn poll_event(self: &Arc<Self>, broker: &Broker, events: PollEvents) {
        let error = events.intersects(PollEvents::ERROR.union(PollEvents::HANGUP));
        let mut delivered = false;

        if events.intersects(PollEvents::READ) || error {
            if let Some(request) = self.read_queue.front() {
                request.terminate(&broker.reactor.timers, AsyncStatus::Ready);
                delivered = true;
            }
        }
        if events.intersects(PollEvents::WRITE) || error {
            if let Some(request) = self.write_queue.front() {
                request.terminate(&broker.reactor.timers, AsyncStatus::Ready);
                delivered = true;
            }
        }
        if !delivered {
            if let Some(user) = self.user.lock().unwrap().upgrade() {
                wake_waiters(user.as_ref());
            }
        }
        self.update_poll_interest(broker);
    }

    /// Device-unmount teardown: the real descriptor goes away and every
    /// pending request completes with a dismount status.
    pub(crate) fn detach_for_unmount(&self) {
        self.terminate_asyncs(AsyncStatus::Dismounted);
        if let Some(broker) = self.broker.upgrade() {
            if let Some(slot) = self.poll_slot.lock().unwrap().take() {
                broker.reactor.release_slot(slot);
            }
        }
        // Unlinking on an unmounted device is impossible; drop the intent.
        *self.pending_close.lock().unwrap() = None;
        *self.unix_fd.lock().unwrap() = None;
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        self.terminate_asyncs(AsyncStatus::Cancelled);
        if let Some(broker) = self.broker.upgrade() {
            if let Some(slot) = self.poll_slot.get_mut().unwrap().take() {
                broker.reactor.release_slot(slot);
            }
        }

        let Some(inode) = self.inode.get_mut().unwrap().take() else {
            return;
        };
        // Release this descriptor's locks while its real fd is still usable
        // for the reconciliation unlocks.
        let raw = self.unix_fd.get_mut().unwrap().as_ref().map(AsRawFd::as_raw_fd);
        let fd_id = self.id;
        remove_locks_where(&inode, raw, |lock| lock.fd_id == fd_id);
        inode.detach_fd(fd_id);

        // Hand the real descriptor (and any pending unlink) to the inode if
        // something still needs it to survive.
        if let Some(unix_fd) = self.unix_fd.get_mut().unwrap().take() {
            let mut rec = self.pending_close.get_mut().unwrap().take().unwrap_or(ClosedFd {
                unix_fd: None,
                unlink: None,
                file_id: inode.file_id(),
            });
            rec.unix_fd = Some(unix_fd);
            inode.add_closed(rec);
            inode.check_pending_closes();
        }
        debug!(fd = fd_id, "descriptor destroyed");
    }
}

/// Reject an open whose access/sharing flags are incompatible with any
/// existing open on the same inode. Runs before any descriptor state changes.
pub(crate) fn check_sharing(inode: &Inode, opts: &OpenOptions) -> BrokerResult<()> {
    let req_access = effective_access(&opts.access, opts.delete_on_close);
    for existing in inode.open_fds() {
        let their_access = effective_access(&existing.access, existing.delete_pending());
        if denies(&req_access, &existing.share) || denies(&their_access, &opts.share) {
            debug!(ino = inode.ino(), "sharing violation");
            return Err(BrokerError::SharingViolation);
        }
    }
    Ok(())
}

fn effective_access(access: &AccessMode, delete_pending: bool) -> AccessMode {
    AccessMode {
        read: access.read,
        write: access.write,
        delete: access.delete || delete_pending,
    }
}

/// Does `access` request something the other side's `share` does not grant?
fn denies(access: &AccessMode, share: &[ShareMode]) -> bool {
    (access.read && !share.contains(&ShareMode::Read))
        || (access.write && !share.contains(&ShareMode::Write))
        || (access.delete && !share.contains(&ShareMode::Delete))
}

pub(crate) fn open_flags(opts: &OpenOptions) -> i32 {
    let mut flags = match (opts.access.read, opts.access.write) {
        (_, false) => libc::O_RDONLY,
        (false, true) => libc::O_WRONLY,
        (true, true) => libc::O_RDWR,
    };
    if opts.create {
        flags |= libc::O_CREAT;
    }
    // Truncation is applied by the caller only after the sharing check
    // admits the open; a rejected open must leave the file intact.
    if opts.directory {
        flags |= libc::O_DIRECTORY;
        // A directory descriptor is only ever opened for reading.
        flags = (flags & !libc::O_ACCMODE) | libc::O_RDONLY;
    }
    flags | libc::O_CLOEXEC
}

pub(crate) fn truncate_fd(fd: RawFd) -> BrokerResult<()> {
    if unsafe { libc::ftruncate(fd, 0) } != 0 {
        return Err(BrokerError::last_os_error());
    }
    Ok(())
}

pub(crate) fn stat_fd(fd: RawFd) -> BrokerResult<libc::stat> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(BrokerError::last_os_error());
    }
    Ok(st)
}

pub(crate) fn path_to_cstring(path: &Path) -> BrokerResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| BrokerError::InvalidArgument)
}

pub(crate) fn open_path(path: &Path, opts: &OpenOptions) -> BrokerResult<OwnedFd> {
    let cpath = path_to_cstring(path)?;
    if opts.directory && opts.create {
        let rc = unsafe { libc::mkdir(cpath.as_ptr(), 0o777) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            if errno != libc::EEXIST {
                return Err(BrokerError::from_errno(errno));
            }
        }
    }
    let raw = loop {
        let rc = unsafe { libc::open(cpath.as_ptr(), open_flags(opts), 0o666) };
        if rc >= 0 {
            break rc;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        if errno != libc::EINTR {
            return Err(BrokerError::from_errno(errno));
        }
    };
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// File capability object: the concrete [`Object`] kind owning a descriptor.
pub struct FileObject {
    fd: Mutex<Option<Arc<Fd>>>,
    queue: WaitQueue,
    name: Option<String>,
}

impl FileObject {
    /// Open a named file (or directory) through the broker, running the
    /// sharing-mode check against every other open on the same inode.
    pub fn open(broker: &Arc<Broker>, path: &Path, opts: &OpenOptions) -> BrokerResult<Arc<Self>> {
        let object = Arc::new(Self {
            fd: Mutex::new(None),
            queue: WaitQueue::new(),
            name: Some(path.display().to_string()),
        });
        let user = Arc::downgrade(&(Arc::clone(&object) as Arc<dyn Object>));
        let fd = broker.open_fd(user, path, opts)?;
        *object.fd.lock().unwrap() = Some(fd);
        Ok(object)
    }

    /// Attach a pre-existing descriptor (a pipe end, a socket) with no inode
    /// tracking and no sharing checks.
    pub fn anonymous(broker: &Arc<Broker>, unix_fd: OwnedFd) -> BrokerResult<Arc<Self>> {
        let object = Arc::new(Self {
            fd: Mutex::new(None),
            queue: WaitQueue::new(),
            name: None,
        });
        let user = Arc::downgrade(&(Arc::clone(&object) as Arc<dyn Object>));
        let fd = broker.create_anonymous(user, unix_fd)?;
        *object.fd.lock().unwrap() = Some(fd);
        Ok(object)
    }

    /// The underlying descriptor; fails once the object was closed.
    pub fn fd(&self) -> BrokerResult<Arc<Fd>> {
        self.fd.lock().unwrap().clone().ok_or(BrokerError::InvalidArgument)
    }
}

impl std::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl Object for FileObject {
    fn describe(&self) -> String {
        match &self.name {
            Some(name) => format!("file {:?}", name),
            None => "anonymous file".into(),
        }
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn wait_queue(&self) -> &WaitQueue {
        &self.queue
    }

    // File objects are always signaled; waits on them never block.
    fn signaled(&self) -> bool {
        true
    }

    fn unix_fd(&self) -> BrokerResult<RawFd> {
        self.fd()?.unix_fd()
    }

    fn close(&self) {
        // Dropping the descriptor runs the deferred-close machinery.
        self.fd.lock().unwrap().take();
    }

    fn poll_interest(&self) -> BrokerResult<PollEvents> {
        Ok(self.fd()?.interest())
    }

    fn flush(&self) -> BrokerResult<()> {
        let raw = self.unix_fd()?;
        if unsafe { libc::fsync(raw) } != 0 {
            return Err(BrokerError::last_os_error());
        }
        Ok(())
    }

    fn file_info(&self) -> BrokerResult<FileInfo> {
        let st = stat_fd(self.unix_fd()?)?;
        Ok(FileInfo {
            is_dir: st.st_mode & libc::S_IFMT == libc::S_IFDIR,
            len: st.st_size as u64,
        })
    }

    fn queue_async(
        &self,
        kind: QueueKind,
        completion: AsyncCompletion,
        timeout: Option<Duration>,
    ) -> BrokerResult<AsyncHandle> {
        self.fd()?.queue_async(kind, completion, timeout)
    }

    fn cancel_async(&self) -> BrokerResult<()> {
        self.fd()?.cancel_asyncs();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::types::{LockKind, ProcessId};

    fn opts(access: AccessMode, share: Vec<ShareMode>) -> OpenOptions {
        OpenOptions {
            access,
            share,
            create: true,
            truncate: false,
            directory: false,
            non_directory: true,
            delete_on_close: false,
        }
    }

    fn all_shares() -> Vec<ShareMode> {
        vec![ShareMode::Read, ShareMode::Write, ShareMode::Delete]
    }

    #[test]
    fn incompatible_sharing_rejected_without_mutating_fd_list() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        // First opener shares nothing.
        let first =
            FileObject::open(&broker, &path, &opts(AccessMode::read_write(), vec![])).unwrap();
        let inode = first.fd().unwrap().inode().unwrap();
        assert_eq!(inode.open_fds().len(), 1);

        // Second opener requests read access: sharing violation.
        let err = FileObject::open(&broker, &path, &opts(AccessMode::read_only(), all_shares()))
            .unwrap_err();
        assert!(matches!(err, BrokerError::SharingViolation));
        assert_eq!(inode.open_fds().len(), 1);
    }

    #[test]
    fn rejected_truncating_open_preserves_contents() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"precious contents").unwrap();

        let _holder =
            FileObject::open(&broker, &path, &opts(AccessMode::read_write(), vec![])).unwrap();

        let mut o = opts(AccessMode::read_write(), all_shares());
        o.truncate = true;
        let err = FileObject::open(&broker, &path, &o).unwrap_err();
        assert!(matches!(err, BrokerError::SharingViolation));
        assert_eq!(std::fs::read(&path).unwrap(), b"precious contents");
    }

    #[test]
    fn truncating_open_clears_contents_once_admitted() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"old data").unwrap();

        let mut o = opts(AccessMode::read_write(), all_shares());
        o.truncate = true;
        let obj = FileObject::open(&broker, &path, &o).unwrap();
        assert_eq!(obj.file_info().unwrap().len, 0);
    }

    #[test]
    fn compatible_sharing_coexists() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let a = FileObject::open(&broker, &path, &opts(AccessMode::read_only(), all_shares()))
            .unwrap();
        let b = FileObject::open(&broker, &path, &opts(AccessMode::read_only(), all_shares()))
            .unwrap();
        let inode = a.fd().unwrap().inode().unwrap();
        assert_eq!(inode.open_fds().len(), 2);
        assert!(Broker::are_same_file(&a.fd().unwrap(), &b.fd().unwrap()));
    }

    #[test]
    fn closing_one_handle_keeps_other_descriptors_locks() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let a = FileObject::open(&broker, &path, &opts(AccessMode::read_write(), all_shares()))
            .unwrap();
        let b = FileObject::open(&broker, &path, &opts(AccessMode::read_write(), all_shares()))
            .unwrap();
        let fd_a = a.fd().unwrap();
        let inode = fd_a.inode().unwrap();

        assert!(fd_a
            .lock(ProcessId::new(1), 0, 10, LockKind::Exclusive, false)
            .unwrap()
            .is_none());

        // Closing B must not release A's lock, and must not actually close
        // B's real descriptor while A's lock is outstanding.
        drop(b);
        assert_eq!(inode.lock_count(), 1);
        assert_eq!(inode.closed_count(), 1);

        fd_a.unlock(0, 10).unwrap();
        assert_eq!(inode.closed_count(), 0);
    }

    #[test]
    fn delete_on_close_unlinks_after_last_release() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim");

        let mut o = opts(AccessMode::read_write(), all_shares());
        o.delete_on_close = true;
        let obj = FileObject::open(&broker, &path, &o).unwrap();
        assert!(path.exists());

        // A second open keeps the file alive past the first close.
        let other =
            FileObject::open(&broker, &path, &opts(AccessMode::read_only(), all_shares()))
                .unwrap();
        drop(obj);
        assert!(path.exists());

        drop(other);
        assert!(!path.exists());
    }

    #[test]
    fn delete_on_close_skipped_when_file_replaced() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim");

        let mut o = opts(AccessMode::read_write(), all_shares());
        o.delete_on_close = true;
        let obj = FileObject::open(&broker, &path, &o).unwrap();

        // Replace the directory entry with a different file.
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"other").unwrap();

        drop(obj);
        assert!(path.exists(), "replacement file must survive");
    }

    #[test]
    fn directory_mismatch_is_rejected() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"data").unwrap();

        let mut o = opts(AccessMode::read_only(), all_shares());
        o.create = false;
        o.directory = true;
        o.non_directory = false;
        let err = FileObject::open(&broker, &path, &o).unwrap_err();
        assert!(matches!(err, BrokerError::NotADirectory));

        let mut o = opts(AccessMode::read_only(), all_shares());
        o.create = false;
        o.non_directory = true;
        let err = FileObject::open(&broker, dir.path(), &o).unwrap_err();
        assert!(matches!(err, BrokerError::IsADirectory));
    }

    #[test]
    fn anonymous_descriptors_have_no_inode() {
        let broker = Broker::new(Default::default()).unwrap();
        let (read_end, _write_end) = crate::test_pipe();
        let obj = FileObject::anonymous(&broker, read_end).unwrap();
        let fd = obj.fd().unwrap();
        assert!(fd.inode().is_none());
        assert!(matches!(
            fd.lock(ProcessId::new(1), 0, 1, LockKind::Exclusive, false),
            Err(BrokerError::InvalidArgument)
        ));
    }

    #[test]
    fn file_object_capabilities() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"hello").unwrap();

        let mut o = opts(AccessMode::read_only(), all_shares());
        o.create = false;
        let obj = FileObject::open(&broker, &path, &o).unwrap();
        assert!(obj.signaled());
        obj.flush().unwrap();
        let info = obj.file_info().unwrap();
        assert!(!info.is_dir);
        assert_eq!(info.len, 5);
        assert_eq!(obj.name().unwrap(), path.display().to_string());

        obj.close();
        assert!(matches!(obj.fd(), Err(BrokerError::InvalidArgument)));
    }
}
