//! Linux `epoll` reactor.
//!
//! One epoll instance multiplexes the value descriptors of every line in the
//! process. An `eventfd` waker interrupts `epoll_wait` when timers are
//! scheduled from other threads, and the wait timeout is bounded by the
//! nearest timer deadline so timers run on the dispatch thread.

use log::{debug, warn};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use super::{Interest, Poller, ReadyHandler, TimerTask, Timers};
use crate::error::GpioError;

/// Token of the waker registration. Descriptors are never negative, so it
/// cannot collide with a descriptor token.
const WAKE_TOKEN: u64 = u64::MAX;
const EPOLL_EVENT_CAPACITY: usize = 32;
/// Pause after a failed wait so a persistent failure does not spin.
const DISPATCH_ERROR_BACKOFF: Duration = Duration::from_millis(50);

static GLOBAL: Mutex<Option<(Arc<Epoll>, Dispatcher)>> = parking_lot::const_mutex(None);

pub struct Epoll {
    epoll: OwnedFd,
    waker: OwnedFd,
    handlers: RwLock<FxHashMap<RawFd, Arc<dyn ReadyHandler>>>,
    timers: Mutex<TimerQueue>,
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

struct TimerEntry {
    deadline: Instant,
    // ties on deadline run in scheduling order
    seq: u64,
    task: TimerTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl Epoll {
    pub fn new() -> Result<Self, GpioError> {
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(GpioError::Poller(format!(
                "epoll_create1: {}",
                io::Error::last_os_error()
            )));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let waker = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if waker < 0 {
            return Err(GpioError::Poller(format!(
                "eventfd: {}",
                io::Error::last_os_error()
            )));
        }
        let waker = unsafe { OwnedFd::from_raw_fd(waker) };

        let poller = Self {
            epoll,
            waker,
            handlers: RwLock::new(FxHashMap::default()),
            timers: Mutex::new(TimerQueue::default()),
        };
        poller
            .ctl(
                libc::EPOLL_CTL_ADD,
                poller.waker.as_raw_fd(),
                libc::EPOLLIN as u32,
                WAKE_TOKEN,
            )
            .map_err(|e| GpioError::Poller(format!("register waker: {e}")))?;

        Ok(poller)
    }

    /// The process-wide reactor, created together with its dispatch thread on
    /// first use.
    pub fn global() -> Result<Arc<Epoll>, GpioError> {
        let mut global = GLOBAL.lock();
        if let Some((epoll, _)) = global.as_ref() {
            return Ok(epoll.clone());
        }

        let epoll = Arc::new(Epoll::new()?);
        let dispatcher = epoll.spawn();
        *global = Some((epoll.clone(), dispatcher));
        Ok(epoll)
    }

    /// Runs [`Epoll::poll_once`] on a dedicated thread until the returned
    /// guard is dropped.
    pub fn spawn(self: &Arc<Self>) -> Dispatcher {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let epoll = self.clone();

        let handle = thread::spawn(move || {
            dispatch_until(&cancel_flag, || epoll.poll_once(None));
        });

        Dispatcher {
            cancel,
            epoll: self.clone(),
            handle: Some(handle),
        }
    }

    /// Waits for readiness or the next timer deadline, whichever comes first,
    /// then dispatches ready handlers followed by expired timers.
    ///
    /// `max_wait` caps the wait; `None` waits indefinitely when no timer is
    /// pending. Returns the number of handlers and timers run. A failing
    /// `epoll_wait` is reported to every registered handler.
    pub fn poll_once(&self, max_wait: Option<Duration>) -> Result<usize, GpioError> {
        let timeout_ms = self.wait_timeout(max_wait);
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(EPOLL_EVENT_CAPACITY);

        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                EPOLL_EVENT_CAPACITY as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                let err = GpioError::Poller(format!("epoll_wait: {err}"));
                let handlers: Vec<Arc<dyn ReadyHandler>> =
                    self.handlers.read().values().cloned().collect();
                for handler in handlers {
                    handler.on_ready(Err(err.clone()));
                }
                return Err(err);
            }
        } else {
            unsafe { events.set_len(n as usize) };
        }

        let ready: Vec<Arc<dyn ReadyHandler>> = {
            let handlers = self.handlers.read();
            events
                .iter()
                .filter_map(|ev| {
                    let token = ev.u64;
                    if token == WAKE_TOKEN {
                        self.drain_waker();
                        None
                    } else {
                        handlers.get(&(token as RawFd)).cloned()
                    }
                })
                .collect()
        };

        let mut dispatched = ready.len();
        for handler in ready {
            handler.on_ready(Ok(()));
        }
        dispatched += self.run_expired_timers();

        Ok(dispatched)
    }

    pub fn registered(&self) -> usize {
        self.handlers.read().len()
    }

    fn wake(&self) {
        let buf: u64 = 1;
        unsafe {
            libc::write(
                self.waker.as_raw_fd(),
                &buf as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    fn drain_waker(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(
                self.waker.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }

    fn wait_timeout(&self, max_wait: Option<Duration>) -> i32 {
        let next = self
            .timers
            .lock()
            .heap
            .peek()
            .map(|Reverse(entry)| entry.deadline.saturating_duration_since(Instant::now()));
        let wait = match (next, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match wait {
            // round up so a timer is never woken for before its deadline
            Some(d) => d.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32,
            None => -1,
        }
    }

    fn run_expired_timers(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<TimerEntry> = {
            let mut timers = self.timers.lock();
            let mut expired = Vec::new();
            while timers
                .heap
                .peek()
                .is_some_and(|Reverse(entry)| entry.deadline <= now)
            {
                if let Some(Reverse(entry)) = timers.heap.pop() {
                    expired.push(entry);
                }
            }
            expired
        };

        let count = expired.len();
        for entry in expired {
            (entry.task)();
        }
        count
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Poller for Epoll {
    fn add(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn ReadyHandler>,
    ) -> Result<(), GpioError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&fd) {
            return Err(GpioError::Poller(format!("fd {fd} already registered")));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.to_epoll(), fd as u64)
            .map_err(|e| GpioError::Poller(format!("epoll add fd {fd}: {e}")))?;
        handlers.insert(fd, handler);
        debug!("epoll add fd {fd} {interest:?}");
        Ok(())
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), GpioError> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest.to_epoll(), fd as u64)
            .map_err(|e| GpioError::Poller(format!("epoll modify fd {fd}: {e}")))
    }

    fn remove(&self, fd: RawFd) -> Result<(), GpioError> {
        let mut handlers = self.handlers.write();
        handlers.remove(&fd);
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
            .map_err(|e| GpioError::Poller(format!("epoll remove fd {fd}: {e}")))?;
        debug!("epoll remove fd {fd}");
        Ok(())
    }
}

impl Timers for Epoll {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        {
            let mut timers = self.timers.lock();
            let seq = timers.seq;
            timers.seq += 1;
            timers.heap.push(Reverse(TimerEntry {
                deadline: Instant::now() + delay,
                seq,
                task,
            }));
        }
        self.wake();
    }
}

/// Owns the dispatch thread of an [`Epoll`]; dropping it stops and joins the
/// thread.
pub struct Dispatcher {
    cancel: Arc<AtomicBool>,
    epoll: Arc<Epoll>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.epoll.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn dispatch_until<F>(cancel: &AtomicBool, mut poll: F)
where
    F: FnMut() -> Result<usize, GpioError>,
{
    while !cancel.load(Ordering::Relaxed) {
        if let Err(e) = poll() {
            warn!("gpio dispatcher: {e}");
            thread::sleep(DISPATCH_ERROR_BACKOFF);
        }
    }
}
