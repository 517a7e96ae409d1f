//! Timers for bounded waits.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::{Pin, pin};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::future::{Either, select};
use slab::Slab;

use crate::runtime::Handle;
use crate::scheduler::Scheduler;

struct TimerEntry {
    deadline: Instant,
    fired: bool,
    waker: Option<Waker>,
}

/// Pending deadlines, ordered by a min-heap. Heap entries whose slab slot was removed are
/// skipped lazily.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
    entries: Slab<TimerEntry>,
}

impl TimerQueue {
    pub(crate) fn insert(&mut self, deadline: Instant) -> usize {
        let key = self.entries.insert(TimerEntry {
            deadline,
            fired: false,
            waker: None,
        });
        self.heap.push(Reverse((deadline, key)));
        key
    }

    /// Stores `waker` for the timer and reports whether it already fired.
    pub(crate) fn poll_entry(&mut self, key: usize, waker: &Waker) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return true;
        };
        if entry.fired {
            return true;
        }
        match &mut entry.waker {
            Some(existing) if existing.will_wake(waker) => {}
            slot => *slot = Some(waker.clone()),
        }
        false
    }

    pub(crate) fn remove(&mut self, key: usize) {
        self.entries.try_remove(key);
    }

    /// Marks every timer due at `now` as fired and returns their wakers.
    pub(crate) fn fire_due(&mut self, now: Instant) -> Vec<Waker> {
        let mut wakers = Vec::new();
        while let Some(Reverse((deadline, key))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.get_mut(key) {
                if entry.deadline <= now && !entry.fired {
                    entry.fired = true;
                    wakers.extend(entry.waker.take());
                }
            }
        }
        wakers
    }

    /// The earliest deadline still pending.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, key))) = self.heap.peek().copied() {
            match self.entries.get(key) {
                Some(entry) if !entry.fired && entry.deadline == deadline => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }
}

/// Future returned by [`Handle::sleep`].
pub struct Sleep {
    handle: Handle,
    deadline: Instant,
    key: Option<usize>,
}

impl Sleep {
    pub(crate) fn new(handle: Handle, duration: Duration) -> Self {
        Self {
            handle,
            deadline: Instant::now() + duration,
            key: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let key = match self.key {
            Some(key) => key,
            None => {
                if self.deadline <= Instant::now() {
                    return Poll::Ready(());
                }
                let key = self.handle.timers().borrow_mut().insert(self.deadline);
                self.key = Some(key);
                key
            }
        };
        if self.handle.timers().borrow_mut().poll_entry(key, cx.waker()) {
            self.handle.timers().borrow_mut().remove(key);
            self.key = None;
            // A fired entry never re-arms: the deadline has passed.
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.handle.timers().borrow_mut().remove(key);
        }
    }
}

/// Runs `future` for at most `duration`. `None` if the time ran out first.
pub async fn timeout<S, F>(scheduler: &S, duration: Duration, future: F) -> Option<F::Output>
where
    S: Scheduler + ?Sized,
    F: Future,
{
    let sleep = scheduler.sleep(duration);
    let future = pin!(future);
    match select(future, sleep).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(((), _)) => None,
    }
}
