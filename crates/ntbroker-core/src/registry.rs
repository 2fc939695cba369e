// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Device/inode registry.
//!
//! Maps a `(device-id, inode-number)` pair to one shared [`Inode`] record so
//! that unrelated descriptors naming the same file on disk discover each other
//! for locking and sharing-mode checks. Records are shared-ownership
//! (`Arc`/`Weak`): a Device exists while some Inode references it, an Inode
//! exists while some descriptor or lock-conflict waitable references it.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::fd::{ClosedFd, Fd};
use crate::lock::{FileLock, LockWait};

/// On-disk identity of a file: (device-id, inode-number).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

/// Lazily resolved removable-media state of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removable {
    Unknown,
    Yes,
    No,
}

/// Process-wide table of devices, owned by the broker context.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u64, Weak<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing Device for `dev`, or create one if `create`.
    pub fn get_device(&self, dev: u64, create: bool) -> Option<Arc<Device>> {
        let mut devices = self.devices.lock().unwrap();
        if let Some(existing) = devices.get(&dev).and_then(Weak::upgrade) {
            return Some(existing);
        }
        if !create {
            return None;
        }
        let device = Arc::new(Device {
            dev,
            removable: Mutex::new(Removable::Unknown),
            inodes: Mutex::new(HashMap::new()),
        });
        devices.retain(|_, weak| weak.strong_count() > 0);
        devices.insert(dev, Arc::downgrade(&device));
        Some(device)
    }

    /// Live devices, for en-masse sweeps (process death, shutdown).
    pub(crate) fn live_devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().filter_map(Weak::upgrade).collect()
    }
}

/// One mounted device, holding the table of its referenced inodes.
pub struct Device {
    dev: u64,
    removable: Mutex<Removable>,
    inodes: Mutex<HashMap<u64, Weak<Inode>>>,
}

impl Device {
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Return the existing Inode for `ino` on this device, or create one.
    pub fn get_inode(self: &Arc<Self>, ino: u64, create: bool) -> Option<Arc<Inode>> {
        let mut inodes = self.inodes.lock().unwrap();
        if let Some(existing) = inodes.get(&ino).and_then(Weak::upgrade) {
            return Some(existing);
        }
        if !create {
            return None;
        }
        let inode = Arc::new(Inode {
            device: Arc::clone(self),
            ino,
            fds: Mutex::new(Vec::new()),
            locks: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            lock_waiters: Mutex::new(Vec::new()),
        });
        inodes.retain(|_, weak| weak.strong_count() > 0);
        inodes.insert(ino, Arc::downgrade(&inode));
        Some(inode)
    }

    /// Whether the device holds removable media, resolved lazily from an open
    /// descriptor on it and cached.
    pub fn is_removable(&self, fd: RawFd) -> bool {
        let mut removable = self.removable.lock().unwrap();
        if *removable == Removable::Unknown {
            *removable = if probe_removable(fd) {
                Removable::Yes
            } else {
                Removable::No
            };
        }
        *removable == Removable::Yes
    }

    pub(crate) fn live_inodes(&self) -> Vec<Arc<Inode>> {
        self.inodes.lock().unwrap().values().filter_map(Weak::upgrade).collect()
    }

    fn forget_inode(&self, ino: u64) {
        self.inodes.lock().unwrap().remove(&ino);
    }

    #[cfg(test)]
    pub(crate) fn inode_count(&self) -> usize {
        self.inodes.lock().unwrap().values().filter(|w| w.strong_count() > 0).count()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // A populated inode table here means a leaked inode reference.
        let leaked =
            self.inodes.lock().unwrap().values().filter(|w| w.strong_count() > 0).count();
        debug_assert_eq!(leaked, 0, "device {} destroyed with {} live inodes", self.dev, leaked);
        if leaked != 0 {
            warn!(dev = self.dev, leaked, "device destroyed with live inodes");
        }
    }
}

/// Shared identity of one file, discovered through the registry.
///
/// Holds the per-file state every descriptor on the file shares: the open
/// descriptor list, the byte-range lock list, retained-close records, and the
/// FIFO of lock-conflict waiters.
pub struct Inode {
    device: Arc<Device>,
    ino: u64,
    pub(crate) fds: Mutex<Vec<Weak<Fd>>>,
    pub(crate) locks: Mutex<Vec<FileLock>>,
    pub(crate) closed: Mutex<Vec<ClosedFd>>,
    pub(crate) lock_waiters: Mutex<Vec<Weak<LockWait>>>,
}

impl Inode {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn file_id(&self) -> FileId {
        FileId {
            dev: self.device.dev,
            ino: self.ino,
        }
    }

    /// Descriptors currently open on this inode.
    pub(crate) fn open_fds(&self) -> Vec<Arc<Fd>> {
        self.fds.lock().unwrap().iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn attach_fd(&self, fd: &Arc<Fd>) {
        let mut fds = self.fds.lock().unwrap();
        fds.retain(|w| w.strong_count() > 0);
        fds.push(Arc::downgrade(fd));
    }

    pub(crate) fn detach_fd(&self, fd_id: u64) {
        self.fds
            .lock()
            .unwrap()
            .retain(|w| w.upgrade().map(|fd| fd.id() != fd_id).unwrap_or(false));
    }

    /// Take ownership of a logically-closed descriptor whose real fd (or
    /// pending unlink) must outlive the handle. Closes it on the spot when
    /// nothing requires it to survive.
    pub(crate) fn add_closed(&self, rec: ClosedFd) {
        let locks_outstanding = !self.locks.lock().unwrap().is_empty();
        if !locks_outstanding && rec.unlink.is_none() {
            // Nothing keeps the fd alive; dropping the record closes it.
            return;
        }
        self.closed.lock().unwrap().push(rec);
    }

    /// Close retained descriptors once the lock list no longer needs them.
    /// Records carrying a pending unlink keep their pathname until the inode
    /// itself is destroyed.
    pub(crate) fn check_pending_closes(&self) {
        if !self.locks.lock().unwrap().is_empty() {
            return;
        }
        let mut closed = self.closed.lock().unwrap();
        for rec in closed.iter_mut() {
            rec.close_unix_fd();
        }
        closed.retain(|rec| rec.unlink.is_some());
    }

    #[cfg(test)]
    pub(crate) fn closed_count(&self) -> usize {
        self.closed.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let live_fds = self.fds.get_mut().unwrap().iter().filter(|w| w.strong_count() > 0).count();
        let live_locks = self.locks.get_mut().unwrap().len();
        debug_assert_eq!(live_fds, 0, "inode destroyed with open descriptors");
        debug_assert_eq!(live_locks, 0, "inode destroyed with active locks");
        if live_fds != 0 || live_locks != 0 {
            warn!(
                dev = self.device.dev,
                ino = self.ino,
                live_fds,
                live_locks,
                "inode destroyed with live references"
            );
        }

        // Apply pending unlinks, then close the retained descriptors.
        for rec in self.closed.get_mut().unwrap().drain(..) {
            if let Some(path) = &rec.unlink {
                unlink_if_same_file(path, rec.file_id);
            }
        }
        self.device.forget_inode(self.ino);
        debug!(dev = self.device.dev, ino = self.ino, "inode destroyed");
    }
}

/// Unlink `path` only if it still names the file identified by `id`.
fn unlink_if_same_file(path: &PathBuf, id: FileId) {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::stat(cpath.as_ptr(), &mut st) };
    if rc != 0 {
        return;
    }
    if st.st_dev as u64 != id.dev || st.st_ino as u64 != id.ino {
        warn!(path = %path.display(), "delete-on-close target replaced, not unlinking");
        return;
    }
    let rc = if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        unsafe { libc::rmdir(cpath.as_ptr()) }
    } else {
        unsafe { libc::unlink(cpath.as_ptr()) }
    };
    if rc != 0 {
        warn!(path = %path.display(), "delete-on-close unlink failed");
    }
}

#[cfg(target_os = "linux")]
fn probe_removable(fd: RawFd) -> bool {
    // CD/DVD and flash-style filesystems are treated as removable media.
    const ISOFS_SUPER_MAGIC: i64 = 0x9660;
    const UDF_SUPER_MAGIC: i64 = 0x1501_3346;
    const MSDOS_SUPER_MAGIC: i64 = 0x4d44;
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstatfs(fd, &mut st) } != 0 {
        return false;
    }
    matches!(st.f_type as i64, ISOFS_SUPER_MAGIC | UDF_SUPER_MAGIC | MSDOS_SUPER_MAGIC)
}

#[cfg(not(target_os = "linux"))]
fn probe_removable(_fd: RawFd) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_device_grab_or_create() {
        let registry = DeviceRegistry::new();
        assert!(registry.get_device(7, false).is_none());

        let dev = registry.get_device(7, true).unwrap();
        let again = registry.get_device(7, false).unwrap();
        assert!(Arc::ptr_eq(&dev, &again));

        drop(again);
        drop(dev);
        // Last reference gone: the entry no longer resolves.
        assert!(registry.get_device(7, false).is_none());
    }

    #[test]
    fn get_inode_unique_per_device_and_number() {
        let registry = DeviceRegistry::new();
        let dev = registry.get_device(1, true).unwrap();

        let a = dev.get_inode(42, true).unwrap();
        let b = dev.get_inode(42, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.file_id(), FileId { dev: 1, ino: 42 });

        let other = dev.get_inode(43, true).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(dev.inode_count(), 2);

        drop(b);
        drop(a);
        drop(other);
        assert_eq!(dev.inode_count(), 0);
    }

    #[test]
    fn removable_state_is_cached() {
        let registry = DeviceRegistry::new();
        let dev = registry.get_device(1, true).unwrap();
        let file = tempfile::tempfile().unwrap();
        use std::os::unix::io::AsRawFd;
        let first = dev.is_removable(file.as_raw_fd());
        // tmp filesystems are not removable media
        assert!(!first);
        assert_eq!(*dev.removable.lock().unwrap(), Removable::No);
    }
}
