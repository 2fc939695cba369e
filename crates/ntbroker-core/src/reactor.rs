// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Readiness multiplexer.
//!
//! Parallel arrays of poll descriptors and their owning [`Fd`]s, with a
//! free-list so slot indices stay dense without compaction. On Linux an epoll
//! backend mirrors the same slot index as per-event data, so both backends
//! share one accounting scheme; any epoll failure disables it for the
//! remainder of the run and execution falls back to portable `poll`
//! transparently. The loop delivers expired timers before readiness
//! callbacks, and readiness callbacks in slot order.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::aio::TimerQueue;
use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::fd::Fd;
use crate::types::{CoreConfig, PollEvents};

pub struct Reactor {
    pub timers: TimerQueue,
    poller: Mutex<Poller>,
}

struct Poller {
    /// Parallel arrays indexed by slot. A slot with no active interest keeps
    /// `pollfds[i].fd == -1` so `poll` skips it entirely.
    pollfds: Vec<libc::pollfd>,
    raws: Vec<libc::c_int>,
    owners: Vec<Option<Weak<Fd>>>,
    free: Vec<usize>,
    max_slots: Option<usize>,
    fast: FastBackend,
}

const IDLE_POLLFD: libc::pollfd = libc::pollfd {
    fd: -1,
    events: 0,
    revents: 0,
};

impl Reactor {
    pub(crate) fn new(config: &CoreConfig) -> Self {
        let fast = if config.fast_poll_backend {
            FastBackend::create()
        } else {
            FastBackend::disabled()
        };
        Self {
            timers: TimerQueue::new(),
            poller: Mutex::new(Poller {
                pollfds: Vec::with_capacity(config.initial_poll_slots),
                raws: Vec::with_capacity(config.initial_poll_slots),
                owners: Vec::with_capacity(config.initial_poll_slots),
                free: Vec::new(),
                max_slots: config.max_poll_slots,
                fast,
            }),
        }
    }

    /// Assign a slot to a descriptor. Fails when the slot table is exhausted.
    pub(crate) fn alloc_slot(&self, owner: Weak<Fd>, raw: libc::c_int) -> BrokerResult<usize> {
        let mut poller = self.poller.lock().unwrap();
        let slot = match poller.free.pop() {
            Some(slot) => slot,
            None => {
                if let Some(max) = poller.max_slots {
                    if poller.pollfds.len() >= max {
                        return Err(BrokerError::OutOfResources);
                    }
                }
                poller.pollfds.push(IDLE_POLLFD);
                poller.raws.push(-1);
                poller.owners.push(None);
                poller.pollfds.len() - 1
            }
        };
        poller.pollfds[slot] = IDLE_POLLFD;
        poller.raws[slot] = raw;
        poller.owners[slot] = Some(owner);
        Ok(slot)
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        let mut poller = self.poller.lock().unwrap();
        let raw = poller.raws[slot];
        if raw >= 0 {
            poller.fast.remove(raw);
        }
        poller.pollfds[slot] = IDLE_POLLFD;
        poller.raws[slot] = -1;
        poller.owners[slot] = None;
        poller.free.push(slot);
    }

    /// Bind (or rebind) the real descriptor watched by a slot.
    pub(crate) fn set_slot_fd(&self, slot: usize, raw: libc::c_int) {
        let mut poller = self.poller.lock().unwrap();
        let old = poller.raws[slot];
        if old >= 0 {
            poller.fast.remove(old);
        }
        poller.raws[slot] = raw;
        if poller.pollfds[slot].fd >= 0 {
            poller.pollfds[slot].fd = raw;
            let events = poller.pollfds[slot].events;
            poller.fast.add(slot, raw, events);
        }
    }

    /// Change a slot's readiness interest; `None` stops watching completely.
    pub fn set_interest(&self, slot: usize, interest: Option<PollEvents>) {
        let mut poller = self.poller.lock().unwrap();
        let raw = poller.raws[slot];
        match interest {
            Some(events) if raw >= 0 => {
                let watched_before = poller.pollfds[slot].fd >= 0;
                poller.pollfds[slot].fd = raw;
                poller.pollfds[slot].events = events.0;
                if watched_before {
                    poller.fast.modify(slot, raw, events.0);
                } else {
                    poller.fast.add(slot, raw, events.0);
                }
            }
            _ => {
                if poller.pollfds[slot].fd >= 0 && raw >= 0 {
                    poller.fast.remove(raw);
                }
                poller.pollfds[slot].fd = -1;
                poller.pollfds[slot].events = 0;
            }
        }
    }

    /// Whether anything can still make progress: a pending timer or a slot
    /// with active interest.
    pub fn has_work(&self) -> bool {
        if !self.timers.is_empty() {
            return true;
        }
        self.poller.lock().unwrap().pollfds.iter().any(|pfd| pfd.fd >= 0)
    }

    /// One iteration of the loop: block until readiness or the next timer
    /// deadline, fire expired timers, then deliver one readiness callback per
    /// ready slot. Returns the number of callbacks dispatched.
    pub(crate) fn run_once(
        &self,
        broker: &Arc<Broker>,
        max_wait: Option<Duration>,
    ) -> BrokerResult<usize> {
        let now = Instant::now();
        let deadline = self.timers.next_deadline();
        let mut timeout_ms: i32 = match deadline {
            Some(deadline) => {
                duration_to_ms(deadline.saturating_duration_since(now))
            }
            None => -1,
        };
        if let Some(max_wait) = max_wait {
            let cap = duration_to_ms(max_wait);
            timeout_ms = if timeout_ms < 0 { cap } else { timeout_ms.min(cap) };
        }

        let ready = self.wait(timeout_ms)?;

        // Timers first; entries are removed from the list before invocation.
        let mut dispatched = self.timers.fire_expired(Instant::now());

        for (slot, revents) in ready {
            let owner = {
                let poller = self.poller.lock().unwrap();
                poller.owners.get(slot).and_then(|o| o.as_ref()).and_then(Weak::upgrade)
            };
            if let Some(fd) = owner {
                fd.poll_event(broker, PollEvents(revents));
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Block until readiness or timeout; returns ready `(slot, revents)`
    /// pairs in slot order.
    fn wait(&self, timeout_ms: i32) -> BrokerResult<Vec<(usize, i16)>> {
        if self.fast_backend_active() {
            match self.wait_fast(timeout_ms) {
                Ok(ready) => return Ok(ready),
                Err(err) => {
                    warn!(%err, "fast poll backend failed, falling back to poll");
                    self.poller.lock().unwrap().fast.disable();
                }
            }
        }
        self.wait_portable(timeout_ms)
    }

    fn fast_backend_active(&self) -> bool {
        self.poller.lock().unwrap().fast.is_active()
    }

    fn wait_portable(&self, timeout_ms: i32) -> BrokerResult<Vec<(usize, i16)>> {
        let mut pollfds = self.poller.lock().unwrap().pollfds.clone();
        let rc = loop {
            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms)
            };
            if rc >= 0 {
                break rc;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            if errno != libc::EINTR {
                return Err(BrokerError::from_errno(errno));
            }
        };
        if rc == 0 {
            return Ok(Vec::new());
        }
        Ok(pollfds
            .iter()
            .enumerate()
            .filter(|(_, pfd)| pfd.revents != 0)
            .map(|(slot, pfd)| (slot, pfd.revents))
            .collect())
    }

    #[cfg(target_os = "linux")]
    fn wait_fast(&self, timeout_ms: i32) -> BrokerResult<Vec<(usize, i16)>> {
        let epfd = {
            let poller = self.poller.lock().unwrap();
            match poller.fast.raw() {
                Some(fd) => fd,
                None => return Err(BrokerError::InvalidArgument),
            }
        };
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 128];
        let rc = loop {
            let rc = unsafe {
                libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
            };
            if rc >= 0 {
                break rc;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            if errno != libc::EINTR {
                return Err(BrokerError::from_errno(errno));
            }
        };
        let mut ready: Vec<(usize, i16)> = events[..rc as usize]
            .iter()
            .map(|ev| (ev.u64 as usize, epoll_to_poll(ev.events)))
            .collect();
        // Keep the portable backend's slot-order delivery guarantee.
        ready.sort_unstable_by_key(|(slot, _)| *slot);
        Ok(ready)
    }

    #[cfg(not(target_os = "linux"))]
    fn wait_fast(&self, _timeout_ms: i32) -> BrokerResult<Vec<(usize, i16)>> {
        Err(BrokerError::InvalidArgument)
    }
}

/// Rounds up: a deadline with a sub-millisecond residue must still block
/// rather than degrade into zero-timeout polling until it expires.
fn duration_to_ms(duration: Duration) -> i32 {
    duration.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32
}

#[cfg(target_os = "linux")]
fn epoll_to_poll(events: u32) -> i16 {
    let mut revents = 0i16;
    if events & libc::EPOLLIN as u32 != 0 {
        revents |= libc::POLLIN;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        revents |= libc::POLLOUT;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        revents |= libc::POLLERR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        revents |= libc::POLLHUP;
    }
    revents
}

/// Scalable readiness backend. Mirrors each slot index as the per-event user
/// data. Any registration failure disables it for the remainder of the run;
/// the portable arrays are maintained in parallel regardless, so the
/// fallback is transparent.
#[cfg(target_os = "linux")]
struct FastBackend {
    epoll: Option<std::os::unix::io::OwnedFd>,
}

#[cfg(target_os = "linux")]
impl FastBackend {
    fn create() -> Self {
        use std::os::unix::io::FromRawFd;
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            warn!("epoll unavailable, using portable poll backend");
            return Self { epoll: None };
        }
        debug!("epoll fast backend enabled");
        Self {
            epoll: Some(unsafe { std::os::unix::io::OwnedFd::from_raw_fd(raw) }),
        }
    }

    fn disabled() -> Self {
        Self { epoll: None }
    }

    fn is_active(&self) -> bool {
        self.epoll.is_some()
    }

    fn raw(&self) -> Option<libc::c_int> {
        use std::os::unix::io::AsRawFd;
        self.epoll.as_ref().map(|fd| fd.as_raw_fd())
    }

    fn disable(&mut self) {
        self.epoll = None;
    }

    fn ctl(&mut self, op: libc::c_int, slot: usize, raw: libc::c_int, events: i16) {
        let Some(epfd) = self.raw() else {
            return;
        };
        let mut ev = libc::epoll_event {
            events: poll_to_epoll(events),
            u64: slot as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, op, raw, &mut ev) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            // EBADF/ENOENT on remove are expected when the fd is already gone.
            if op == libc::EPOLL_CTL_DEL && (errno == libc::EBADF || errno == libc::ENOENT) {
                return;
            }
            warn!(errno, "epoll_ctl failed, disabling fast backend");
            self.disable();
        }
    }

    fn add(&mut self, slot: usize, raw: libc::c_int, events: i16) {
        self.ctl(libc::EPOLL_CTL_ADD, slot, raw, events);
    }

    fn modify(&mut self, slot: usize, raw: libc::c_int, events: i16) {
        self.ctl(libc::EPOLL_CTL_MOD, slot, raw, events);
    }

    fn remove(&mut self, raw: libc::c_int) {
        self.ctl(libc::EPOLL_CTL_DEL, 0, raw, 0);
    }
}

#[cfg(target_os = "linux")]
fn poll_to_epoll(events: i16) -> u32 {
    let mut out = 0u32;
    if events & libc::POLLIN != 0 {
        out |= libc::EPOLLIN as u32;
    }
    if events & libc::POLLOUT != 0 {
        out |= libc::EPOLLOUT as u32;
    }
    out
}

#[cfg(not(target_os = "linux"))]
struct FastBackend;

#[cfg(not(target_os = "linux"))]
impl FastBackend {
    fn create() -> Self {
        Self
    }

    fn disabled() -> Self {
        Self
    }

    fn is_active(&self) -> bool {
        false
    }

    fn disable(&mut self) {}

    fn add(&mut self, _slot: usize, _raw: libc::c_int, _events: i16) {}

    fn modify(&mut self, _slot: usize, _raw: libc::c_int, _events: i16) {}

    fn remove(&mut self, _raw: libc::c_int) {}
}
