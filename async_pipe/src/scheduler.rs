//! The slice of the cooperative scheduler that readiness monitoring depends on.
//!
//! [`ReadinessMonitor`](crate::monitor::ReadinessMonitor) only talks to the scheduler through
//! [`Scheduler`], so it can be driven by the bundled [`Runtime`](crate::runtime::Runtime) or by
//! any other single-threaded loop that can watch descriptors and sleep.

use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;

use crate::error::Result;

/// Readiness direction of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(crate) const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Invoked by the scheduler every time it observes the watched direction as ready.
pub type ReadyCallback = Rc<dyn Fn()>;

/// Readiness and timer services of a cooperative scheduler.
pub trait Scheduler {
    /// Starts watching `fd` for `direction`. Watching the same direction twice is an error.
    fn watch(&self, fd: RawFd, direction: Direction, on_ready: ReadyCallback) -> Result<()>;

    /// Stops watching `fd` for `direction`. Unknown watches are ignored.
    fn unwatch(&self, fd: RawFd, direction: Direction) -> Result<()>;

    /// A future that completes once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()>;
}

impl<S: Scheduler + ?Sized> Scheduler for Rc<S> {
    fn watch(&self, fd: RawFd, direction: Direction, on_ready: ReadyCallback) -> Result<()> {
        (**self).watch(fd, direction, on_ready)
    }

    fn unwatch(&self, fd: RawFd, direction: Direction) -> Result<()> {
        (**self).unwatch(fd, direction)
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        (**self).sleep(duration)
    }
}
