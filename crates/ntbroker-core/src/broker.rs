// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Broker context: the one struct tying the registry, the multiplexer and
//! descriptor allocation together. All opens, anonymous attachments and
//! process-wide sweeps go through here.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};
use crate::fd::{check_sharing, open_path, stat_fd, truncate_fd, ClosedFd, Fd};
use crate::lock::remove_locks_where;
use crate::object::Object;
use crate::reactor::Reactor;
use crate::types::{AccessMode, CoreConfig, OpenOptions, ProcessId, ShareMode};
use crate::registry::DeviceRegistry;

pub struct Broker {
    config: CoreConfig,
    pub registry: DeviceRegistry,
    pub reactor: Reactor,
    next_fd_id: Mutex<u64>,
}

impl Broker {
    pub fn new(config: CoreConfig) -> BrokerResult<Arc<Self>> {
        let reactor = Reactor::new(&config);
        info!(
            initial_poll_slots = config.initial_poll_slots,
            fast_poll_backend = config.fast_poll_backend,
            "broker context created"
        );
        Ok(Arc::new(Self {
            config,
            registry: DeviceRegistry::new(),
            reactor,
            next_fd_id: Mutex::new(1),
        }))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn next_fd_id(&self) -> u64 {
        let mut next = self.next_fd_id.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    /// Allocate a descriptor with its multiplexer slot but no real fd yet.
    /// Fails the whole allocation when no slot can be obtained.
    pub fn alloc_fd(
        self: &Arc<Self>,
        user: Weak<dyn Object>,
        access: AccessMode,
        share: Vec<ShareMode>,
    ) -> BrokerResult<Arc<Fd>> {
        let fd = Fd::new_unbound(self.next_fd_id(), self, access, share);
        fd.set_user(user);
        let slot = self.reactor.alloc_slot(Arc::downgrade(&fd), -1)?;
        fd.set_poll_slot(slot);
        Ok(fd)
    }

    /// Open a named file or directory.
    ///
    /// The sharing-mode check runs against every other open on the same inode
    /// before any shared state changes, so a rejected open leaves no trace.
    pub fn open_fd(
        self: &Arc<Self>,
        user: Weak<dyn Object>,
        path: &Path,
        opts: &OpenOptions,
    ) -> BrokerResult<Arc<Fd>> {
        let unix_fd = open_path(path, opts)?;
        let st = stat_fd(unix_fd.as_raw_fd())?;
        let is_dir = st.st_mode & libc::S_IFMT == libc::S_IFDIR;
        if opts.directory && !is_dir {
            return Err(BrokerError::NotADirectory);
        }
        if opts.non_directory && is_dir {
            return Err(BrokerError::IsADirectory);
        }

        let device = self
            .registry
            .get_device(st.st_dev as u64, true)
            .ok_or(BrokerError::OutOfResources)?;
        let inode = device
            .get_inode(st.st_ino as u64, true)
            .ok_or(BrokerError::OutOfResources)?;
        check_sharing(&inode, opts)?;
        // Only now that the open is admitted may it touch file contents.
        if opts.truncate && opts.access.write {
            truncate_fd(unix_fd.as_raw_fd())?;
        }

        let fd = self.alloc_fd(user, opts.access.clone(), opts.share.clone())?;
        fd.bind_unix_fd(unix_fd);
        let pending = if opts.delete_on_close {
            Some(ClosedFd::unlink_intent(path.to_path_buf(), inode.file_id()))
        } else {
            None
        };
        fd.attach_inode(Arc::clone(&inode), pending);
        inode.attach_fd(&fd);
        debug!(fd = fd.id(), path = %path.display(), "descriptor opened");
        Ok(fd)
    }

    /// Adopt a pre-existing descriptor (pipe end, socket) with no inode
    /// tracking; sharing and byte-range locking do not apply to it.
    pub fn create_anonymous(
        self: &Arc<Self>,
        user: Weak<dyn Object>,
        unix_fd: OwnedFd,
    ) -> BrokerResult<Arc<Fd>> {
        let fd = self.alloc_fd(
            user,
            AccessMode::read_write(),
            vec![ShareMode::Read, ShareMode::Write, ShareMode::Delete],
        )?;
        fd.bind_unix_fd(unix_fd);
        Ok(fd)
    }

    /// Whether two descriptors name the same file on disk. Anonymous
    /// descriptors never compare equal, not even to themselves.
    pub fn are_same_file(a: &Fd, b: &Fd) -> bool {
        match (a.inode(), b.inode()) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    /// Forced device removal: every descriptor on the device loses its real
    /// fd, pending requests complete with a dismount status, and retained
    /// close records (including delete-on-close intents) are discarded.
    pub fn unmount_device(&self, dev: u64) {
        let Some(device) = self.registry.get_device(dev, false) else {
            return;
        };
        info!(dev, "unmounting device");
        for inode in device.live_inodes() {
            for fd in inode.open_fds() {
                fd.detach_for_unmount();
            }
            remove_locks_where(&inode, None, |_| true);
            let mut closed = inode.closed.lock().unwrap();
            for rec in closed.iter_mut() {
                rec.close_unix_fd();
            }
            closed.clear();
        }
    }

    /// Release every byte-range lock a dead process left behind.
    pub fn release_process_locks(&self, owner: ProcessId) {
        for device in self.registry.live_devices() {
            for inode in device.live_inodes() {
                let raw = inode
                    .open_fds()
                    .iter()
                    .find_map(|fd| fd.unix_fd().ok());
                remove_locks_where(&inode, raw, |lock| lock.owner == owner);
            }
        }
    }

    /// One multiplexer iteration; see [`Reactor`].
    pub fn run_once(self: &Arc<Self>, max_wait: Option<Duration>) -> BrokerResult<usize> {
        self.reactor.run_once(self, max_wait)
    }

    /// Drive the multiplexer until no timer or descriptor interest remains.
    pub fn main_loop(self: &Arc<Self>) -> BrokerResult<()> {
        while self.reactor.has_work() {
            self.run_once(None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::FileObject;
    use crate::types::{AsyncStatus, LockKind, QueueKind};
    use std::sync::Mutex;

    fn rw_opts() -> OpenOptions {
        OpenOptions {
            access: AccessMode::read_write(),
            share: vec![ShareMode::Read, ShareMode::Write, ShareMode::Delete],
            create: true,
            truncate: false,
            directory: false,
            non_directory: true,
            delete_on_close: false,
        }
    }

    #[test]
    fn same_path_resolves_to_one_inode() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let a = FileObject::open(&broker, &path, &rw_opts()).unwrap();
        let b = FileObject::open(&broker, &path, &rw_opts()).unwrap();
        let other = FileObject::open(&broker, &dir.path().join("other"), &rw_opts()).unwrap();

        assert!(Broker::are_same_file(&a.fd().unwrap(), &b.fd().unwrap()));
        assert!(!Broker::are_same_file(&a.fd().unwrap(), &other.fd().unwrap()));
    }

    #[test]
    fn anonymous_descriptors_never_compare_equal() {
        let broker = Broker::new(Default::default()).unwrap();
        let (read_end, _write_end) = crate::test_pipe();
        let obj = FileObject::anonymous(&broker, read_end).unwrap();
        let fd = obj.fd().unwrap();
        assert!(!Broker::are_same_file(&fd, &fd));
    }

    #[test]
    fn unmount_dismounts_descriptors_and_pending_requests() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let obj = FileObject::open(&broker, &path, &rw_opts()).unwrap();
        let fd = obj.fd().unwrap();
        let dev = fd.inode().unwrap().device().dev();

        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        fd.queue_async(
            QueueKind::Read,
            Box::new(move |status| sink.lock().unwrap().push(status)),
            None,
        )
        .unwrap();

        broker.unmount_device(dev);
        assert_eq!(*statuses.lock().unwrap(), vec![AsyncStatus::Dismounted]);
        assert!(matches!(fd.unix_fd(), Err(BrokerError::Dismounted)));
    }

    #[test]
    fn unmount_discards_delete_on_close_intent() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("victim");

        let mut o = rw_opts();
        o.delete_on_close = true;
        let obj = FileObject::open(&broker, &path, &o).unwrap();
        let dev = obj.fd().unwrap().inode().unwrap().device().dev();

        broker.unmount_device(dev);
        drop(obj);
        // The intent died with the unmount; the file survives.
        assert!(path.exists());
    }

    #[test]
    fn process_death_releases_only_that_owners_locks() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        let obj = FileObject::open(&broker, &path, &rw_opts()).unwrap();
        let fd = obj.fd().unwrap();
        let inode = fd.inode().unwrap();

        assert!(fd
            .lock(ProcessId::new(1), 0, 10, LockKind::Exclusive, false)
            .unwrap()
            .is_none());
        assert!(fd
            .lock(ProcessId::new(2), 100, 10, LockKind::Exclusive, false)
            .unwrap()
            .is_none());
        assert_eq!(inode.lock_count(), 2);

        broker.release_process_locks(ProcessId::new(1));
        assert_eq!(inode.lock_count(), 1);
        broker.release_process_locks(ProcessId::new(2));
        assert_eq!(inode.lock_count(), 0);
    }

    #[test]
    fn descriptor_ids_are_unique() {
        let broker = Broker::new(Default::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let a = FileObject::open(&broker, &dir.path().join("a"), &rw_opts()).unwrap();
        let b = FileObject::open(&broker, &dir.path().join("b"), &rw_opts()).unwrap();
        assert_ne!(a.fd().unwrap().id(), b.fd().unwrap().id());
    }
}
