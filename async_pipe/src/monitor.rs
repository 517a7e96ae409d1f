//! Readiness monitoring for one endpoint descriptor.
//!
//! [`ReadinessMonitor`] keeps one registration per direction with the [`Scheduler`] and turns
//! the scheduler's readiness callbacks into a level-triggered hint plus a set of suspended
//! waiters. The hint says "this direction was reported ready and no operation has proven
//! otherwise since". It is a hint only: when several tasks wait on the same direction, every
//! one of them is woken by an assertion, but only the first to act may find the data or the
//! buffer space. Callers must therefore probe the endpoint again after
//! [`await_ready`](ReadinessMonitor::await_ready) returns, and wait again if the probe would
//! block:
//!
//! ```ignore
//! loop {
//!     let seen = monitor.readiness(Direction::Read);
//!     if let Some(frame) = conn.try_recv_frame()? {
//!         return Ok(frame);
//!     }
//!     monitor.clear_readiness(Direction::Read, seen.tick);
//!     monitor.await_ready(Direction::Read, None).await?;
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use log::{debug, trace, warn};
use slab::Slab;

use crate::error::{Error, Result};
use crate::scheduler::{Direction, Scheduler};
use crate::time;

/// Snapshot of one direction's hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    /// Number of assertions seen so far. Used to lower the hint only if no assertion
    /// arrived after the snapshot.
    pub tick: u64,
}

#[derive(Default)]
struct Slot {
    ready: bool,
    tick: u64,
    waiters: Slab<Waker>,
}

#[derive(Default)]
struct Shared {
    slots: [RefCell<Slot>; 2],
    closed: Cell<bool>,
}

impl Shared {
    fn slot(&self, direction: Direction) -> &RefCell<Slot> {
        &self.slots[direction.index()]
    }

    /// Called from the scheduler each time it reports `direction` as ready.
    fn assert_ready(&self, direction: Direction) {
        let wakers: Vec<Waker> = {
            let mut slot = self.slot(direction).borrow_mut();
            slot.ready = true;
            slot.tick += 1;
            slot.waiters.iter().map(|(_, waker)| waker.clone()).collect()
        };
        if !wakers.is_empty() {
            trace!("{direction} readiness wakes {} waiter(s)", wakers.len());
        }
        for waker in wakers {
            waker.wake();
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for direction in Direction::ALL {
            let wakers: Vec<Waker> = {
                let mut slot = self.slot(direction).borrow_mut();
                slot.ready = false;
                slot.waiters.drain().collect()
            };
            for waker in wakers {
                waker.wake();
            }
        }
    }
}

/// Watches both readiness directions of one descriptor.
pub struct ReadinessMonitor {
    fd: RawFd,
    scheduler: Rc<dyn Scheduler>,
    shared: Rc<Shared>,
    registered: [Cell<bool>; 2],
}

impl ReadinessMonitor {
    /// Creates a monitor for `fd` and registers both directions.
    pub fn new(fd: RawFd, scheduler: Rc<dyn Scheduler>) -> Result<Self> {
        let monitor = Self::unregistered(fd, scheduler);
        for direction in Direction::ALL {
            monitor.register(direction)?;
        }
        Ok(monitor)
    }

    /// Creates a monitor for `fd` without registering either direction.
    pub fn unregistered(fd: RawFd, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            fd,
            scheduler,
            shared: Rc::new(Shared::default()),
            registered: [Cell::new(false), Cell::new(false)],
        }
    }

    /// Asks the scheduler to report `direction` readiness of the descriptor to this monitor.
    ///
    /// A direction may be registered once per monitor lifetime.
    pub fn register(&self, direction: Direction) -> Result<()> {
        if self.shared.closed.get() {
            return Err(Error::ClosedConnection);
        }
        if self.registered[direction.index()].get() {
            return Err(Error::AlreadyRegistered(direction));
        }
        let shared = Rc::downgrade(&self.shared);
        self.scheduler.watch(
            self.fd,
            direction,
            Rc::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.assert_ready(direction);
                }
            }),
        )?;
        self.registered[direction.index()].set(true);
        debug!("fd={} registered for {direction} readiness", self.fd);
        Ok(())
    }

    pub fn readiness(&self, direction: Direction) -> Readiness {
        let slot = self.shared.slot(direction).borrow();
        Readiness {
            ready: slot.ready,
            tick: slot.tick,
        }
    }

    /// Lowers the hint after a probe proved `direction` would block, unless the scheduler
    /// asserted it again after the `tick` snapshot was taken.
    pub fn clear_readiness(&self, direction: Direction, tick: u64) {
        let mut slot = self.shared.slot(direction).borrow_mut();
        if slot.tick == tick {
            slot.ready = false;
        }
    }

    /// Suspends until `direction` is hinted ready (`Ok(true)`) or `timeout` elapses
    /// (`Ok(false)`). `None` or a zero timeout waits indefinitely.
    ///
    /// Fails with [`Error::ClosedConnection`] if the monitor is deregistered meanwhile.
    /// Dropping the returned future only withdraws this waiter.
    pub async fn await_ready(&self, direction: Direction, timeout: Option<Duration>) -> Result<bool> {
        let wait = WaitReady {
            shared: &self.shared,
            direction,
            key: None,
        };
        match timeout {
            Some(limit) if !limit.is_zero() => {
                match time::timeout(&*self.scheduler, limit, wait).await {
                    Some(result) => result.map(|()| true),
                    None => Ok(false),
                }
            }
            _ => wait.await.map(|()| true),
        }
    }

    /// Raises the hint and wakes every waiter on `direction`, as a scheduler report would.
    ///
    /// Used when readiness moved off the descriptor into a user-space buffer, where the
    /// scheduler can no longer observe it.
    pub fn notify(&self, direction: Direction) {
        if self.shared.closed.get() {
            return;
        }
        self.shared.assert_ready(direction);
    }

    /// Number of tasks currently suspended on `direction`.
    pub fn waiters(&self, direction: Direction) -> usize {
        self.shared.slot(direction).borrow().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// Removes both registrations and wakes every waiter, which then observes the closure.
    /// Calling it again is a no-op.
    pub fn deregister(&self) -> Result<()> {
        let mut first_error = None;
        for direction in Direction::ALL {
            if !self.registered[direction.index()].replace(false) {
                continue;
            }
            match self.scheduler.unwatch(self.fd, direction) {
                Ok(()) => debug!("fd={} deregistered {direction} readiness", self.fd),
                Err(e) => {
                    warn!("fd={} failed to deregister {direction} readiness: {e}", self.fd);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.shared.close();
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ReadinessMonitor {
    fn drop(&mut self) {
        let _ = self.deregister();
    }
}

/// A single waiter on one direction.
struct WaitReady<'a> {
    shared: &'a Shared,
    direction: Direction,
    key: Option<usize>,
}

impl Future for WaitReady<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let shared = self.shared;
        if shared.closed.get() {
            // Closing drained the waiter slab already.
            self.key = None;
            return Poll::Ready(Err(Error::ClosedConnection));
        }
        let mut slot = shared.slot(self.direction).borrow_mut();
        if slot.ready {
            if let Some(key) = self.key.take() {
                slot.waiters.try_remove(key);
            }
            return Poll::Ready(Ok(()));
        }
        match self.key.and_then(|key| slot.waiters.get_mut(key)) {
            Some(waker) => {
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => {
                let key = slot.waiters.insert(cx.waker().clone());
                drop(slot);
                self.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitReady<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.shared
                .slot(self.direction)
                .borrow_mut()
                .waiters
                .try_remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::LocalBoxFuture;
    use futures::task::noop_waker;
    use std::collections::HashMap;
    use std::future::pending;

    use crate::scheduler::ReadyCallback;

    /// Records watches so tests can fire readiness by hand.
    #[derive(Default)]
    struct FakeScheduler {
        watches: RefCell<HashMap<Direction, ReadyCallback>>,
        unwatched: Cell<usize>,
    }

    impl FakeScheduler {
        fn fire(&self, direction: Direction) {
            let callback = self.watches.borrow().get(&direction).cloned();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    impl Scheduler for FakeScheduler {
        fn watch(&self, _fd: RawFd, direction: Direction, on_ready: ReadyCallback) -> Result<()> {
            self.watches.borrow_mut().insert(direction, on_ready);
            Ok(())
        }

        fn unwatch(&self, _fd: RawFd, direction: Direction) -> Result<()> {
            if self.watches.borrow_mut().remove(&direction).is_some() {
                self.unwatched.set(self.unwatched.get() + 1);
            }
            Ok(())
        }

        fn sleep(&self, _duration: Duration) -> LocalBoxFuture<'static, ()> {
            Box::pin(pending())
        }
    }

    fn setup() -> (Rc<FakeScheduler>, ReadinessMonitor) {
        let scheduler = Rc::new(FakeScheduler::default());
        let monitor = ReadinessMonitor::new(3, scheduler.clone()).unwrap();
        (scheduler, monitor)
    }

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(future).poll(&mut cx)
    }

    #[test]
    fn registering_twice_fails_fast() {
        let (scheduler, monitor) = setup();
        assert_eq!(scheduler.watches.borrow().len(), 2);
        assert!(matches!(
            monitor.register(Direction::Read),
            Err(Error::AlreadyRegistered(Direction::Read))
        ));
    }

    #[test]
    fn every_waiter_sees_one_assertion() {
        let (scheduler, monitor) = setup();
        let mut first = Box::pin(monitor.await_ready(Direction::Read, None));
        let mut second = Box::pin(monitor.await_ready(Direction::Read, None));
        assert!(poll_once(&mut first).is_pending());
        assert!(poll_once(&mut second).is_pending());
        assert_eq!(monitor.waiters(Direction::Read), 2);

        scheduler.fire(Direction::Read);
        assert!(matches!(poll_once(&mut first), Poll::Ready(Ok(true))));
        assert!(matches!(poll_once(&mut second), Poll::Ready(Ok(true))));
        assert_eq!(monitor.waiters(Direction::Read), 0);
    }

    #[test]
    fn hint_is_lowered_only_by_a_matching_probe() {
        let (scheduler, monitor) = setup();
        scheduler.fire(Direction::Write);
        let seen = monitor.readiness(Direction::Write);
        assert!(seen.ready);

        // Asserted again after the snapshot: the stale probe must not lower the hint.
        scheduler.fire(Direction::Write);
        monitor.clear_readiness(Direction::Write, seen.tick);
        assert!(monitor.readiness(Direction::Write).ready);

        let seen = monitor.readiness(Direction::Write);
        monitor.clear_readiness(Direction::Write, seen.tick);
        assert!(!monitor.readiness(Direction::Write).ready);
    }

    #[test]
    fn notify_wakes_waiters_without_the_scheduler() {
        let (_scheduler, monitor) = setup();
        let before = monitor.readiness(Direction::Read);
        let mut waiter = Box::pin(monitor.await_ready(Direction::Read, None));
        assert!(poll_once(&mut waiter).is_pending());

        monitor.notify(Direction::Read);
        let after = monitor.readiness(Direction::Read);
        assert!(after.ready);
        assert_eq!(after.tick, before.tick + 1);
        assert!(matches!(poll_once(&mut waiter), Poll::Ready(Ok(true))));

        monitor.deregister().unwrap();
        monitor.notify(Direction::Read);
        assert!(!monitor.readiness(Direction::Read).ready);
    }

    #[test]
    fn directions_are_independent() {
        let (scheduler, monitor) = setup();
        let mut reader = Box::pin(monitor.await_ready(Direction::Read, None));
        assert!(poll_once(&mut reader).is_pending());
        scheduler.fire(Direction::Write);
        assert!(poll_once(&mut reader).is_pending());
    }

    #[test]
    fn dropping_a_waiter_keeps_registrations() {
        let (scheduler, monitor) = setup();
        let mut cancelled = Box::pin(monitor.await_ready(Direction::Read, None));
        let mut survivor = Box::pin(monitor.await_ready(Direction::Read, None));
        assert!(poll_once(&mut cancelled).is_pending());
        assert!(poll_once(&mut survivor).is_pending());

        drop(cancelled);
        assert_eq!(monitor.waiters(Direction::Read), 1);
        assert_eq!(scheduler.watches.borrow().len(), 2);

        scheduler.fire(Direction::Read);
        assert!(matches!(poll_once(&mut survivor), Poll::Ready(Ok(true))));
    }

    #[test]
    fn deregister_wakes_waiters_with_closed_error() {
        let (scheduler, monitor) = setup();
        let mut waiter = Box::pin(monitor.await_ready(Direction::Read, None));
        assert!(poll_once(&mut waiter).is_pending());

        monitor.deregister().unwrap();
        monitor.deregister().unwrap();
        assert_eq!(scheduler.unwatched.get(), 2);
        assert!(matches!(
            poll_once(&mut waiter),
            Poll::Ready(Err(Error::ClosedConnection))
        ));
        assert!(matches!(
            monitor.register(Direction::Read),
            Err(Error::ClosedConnection)
        ));
    }

    #[test]
    fn drop_deregisters() {
        let (scheduler, monitor) = setup();
        drop(monitor);
        assert!(scheduler.watches.borrow().is_empty());
    }
}
