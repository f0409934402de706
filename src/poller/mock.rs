use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{Interest, Poller, ReadyHandler, TimerTask, Timers};
use crate::error::GpioError;

/// In-memory poller and timer service. Nothing happens on its own: tests
/// simulate kernel deliveries with [`MockReactor::deliver`] and expire timers
/// with [`MockReactor::fire_timers`].
#[derive(Default)]
pub struct MockReactor {
    inner: Mutex<MockState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerOp {
    Add(RawFd, Interest),
    Modify(RawFd, Interest),
    Remove(RawFd),
}

#[derive(Default)]
struct MockState {
    registrations: FxHashMap<RawFd, MockRegistration>,
    ops: Vec<PollerOp>,
    timers: Vec<(Duration, TimerTask)>,
    timers_scheduled: Vec<Duration>,
}

struct MockRegistration {
    interest: Interest,
    armed: bool,
    handler: Arc<dyn ReadyHandler>,
}

impl MockReactor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulates the kernel reporting an edge on `fd`, armed or not.
    /// Returns whether a handler was registered for it.
    pub fn deliver(&self, fd: RawFd) -> bool {
        self.dispatch(fd, Ok(()))
    }

    pub fn deliver_error(&self, fd: RawFd, message: &str) -> bool {
        self.dispatch(fd, Err(GpioError::Poller(message.to_string())))
    }

    /// Runs every pending timer regardless of its delay. Returns how many ran.
    pub fn fire_timers(&self) -> usize {
        let timers: Vec<_> = std::mem::take(&mut self.inner.lock().timers);
        let count = timers.len();
        for (_, task) in timers {
            task();
        }
        count
    }

    pub fn ops(&self) -> Vec<PollerOp> {
        self.inner.lock().ops.clone()
    }

    pub fn registration(&self, fd: RawFd) -> Option<Interest> {
        self.inner.lock().registrations.get(&fd).map(|r| r.interest)
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.inner.lock().registrations.contains_key(&fd)
    }

    /// Whether a delivery on `fd` would be reported by a real kernel.
    pub fn is_armed(&self, fd: RawFd) -> bool {
        self.inner
            .lock()
            .registrations
            .get(&fd)
            .is_some_and(|r| r.armed)
    }

    pub fn registered(&self) -> usize {
        self.inner.lock().registrations.len()
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Delays of every timer scheduled so far, fired or not.
    pub fn timers_scheduled(&self) -> Vec<Duration> {
        self.inner.lock().timers_scheduled.clone()
    }

    fn dispatch(&self, fd: RawFd, readiness: Result<(), GpioError>) -> bool {
        let handler = {
            let mut state = self.inner.lock();
            match state.registrations.get_mut(&fd) {
                Some(reg) => {
                    if reg.interest.oneshot && readiness.is_ok() {
                        reg.armed = false;
                    }
                    reg.handler.clone()
                }
                None => return false,
            }
        };
        handler.on_ready(readiness);
        true
    }
}

impl Poller for MockReactor {
    fn add(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn ReadyHandler>,
    ) -> Result<(), GpioError> {
        let mut state = self.inner.lock();
        if state.registrations.contains_key(&fd) {
            return Err(GpioError::Poller(format!("fd {fd} already registered")));
        }
        state.registrations.insert(
            fd,
            MockRegistration {
                interest,
                armed: true,
                handler,
            },
        );
        state.ops.push(PollerOp::Add(fd, interest));
        Ok(())
    }

    fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), GpioError> {
        let mut state = self.inner.lock();
        let reg = state
            .registrations
            .get_mut(&fd)
            .ok_or_else(|| GpioError::Poller(format!("fd {fd} not registered")))?;
        reg.interest = interest;
        reg.armed = true;
        state.ops.push(PollerOp::Modify(fd, interest));
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> Result<(), GpioError> {
        let mut state = self.inner.lock();
        state
            .registrations
            .remove(&fd)
            .ok_or_else(|| GpioError::Poller(format!("fd {fd} not registered")))?;
        state.ops.push(PollerOp::Remove(fd));
        Ok(())
    }
}

impl Timers for MockReactor {
    fn schedule(&self, delay: Duration, task: TimerTask) {
        let mut state = self.inner.lock();
        state.timers_scheduled.push(delay);
        state.timers.push((delay, task));
    }
}
