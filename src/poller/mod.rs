//! Readiness notification for GPIO value descriptors.
//!
//! sysfs value files signal an edge as an exceptional (`POLLPRI`) condition.
//! A [`Poller`] keeps one registration per descriptor together with the
//! handler to call when it fires; [`Timers`] runs deferred work on the same
//! dispatch thread.

pub mod epoll;
pub mod mock;

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::error::GpioError;

pub use epoll::{Dispatcher, Epoll};
pub use mock::{MockReactor, PollerOp};

/// Event mask of a registration. The priority event is always requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest {
    /// Disarm the registration after its first delivery.
    pub oneshot: bool,
}

impl Interest {
    pub const PRIORITY: Interest = Interest { oneshot: false };
    pub const PRIORITY_ONESHOT: Interest = Interest { oneshot: true };

    pub fn to_epoll(self) -> u32 {
        let mut flags = libc::EPOLLPRI;
        if self.oneshot {
            flags |= libc::EPOLLONESHOT;
        }
        flags as u32
    }
}

/// Receives deliveries for one registered descriptor. Must not block.
pub trait ReadyHandler: Send + Sync {
    fn on_ready(&self, readiness: Result<(), GpioError>);
}

pub trait Poller: Send + Sync {
    fn add(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Arc<dyn ReadyHandler>,
    ) -> Result<(), GpioError>;
    fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), GpioError>;
    fn remove(&self, fd: RawFd) -> Result<(), GpioError>;
}

pub type TimerTask = Box<dyn FnOnce() + Send>;

pub trait Timers: Send + Sync {
    /// Runs `task` once, no earlier than `delay` from now.
    fn schedule(&self, delay: Duration, task: TimerTask);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_always_requests_priority() {
        let pri = libc::EPOLLPRI as u32;
        let oneshot = libc::EPOLLONESHOT as u32;

        assert_eq!(Interest::PRIORITY.to_epoll(), pri);
        assert_eq!(Interest::PRIORITY_ONESHOT.to_epoll(), pri | oneshot);
    }
}
