//! The task executor for driving async tasks to completion.
//!
//! Tasks live in a slab owned by the runtime thread and are polled one at a time, in the
//! order their wakers fired. Wakers may fire from any thread: they only push a task id on
//! the [`Injector`].

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::task::{Context, Poll};

use crossbeam_queue::SegQueue;
use log::{trace, warn};
use metrics::{counter, gauge};
use slab::Slab;

use crate::task::{JoinHandle, Task, joinable};

/// Id reserved for the future driven by `block_on`.
pub(crate) const MAIN_TASK: usize = usize::MAX;

/// Queue of task ids that are ready to be polled.
#[derive(Debug)]
pub(crate) struct Injector {
    queue: SegQueue<usize>,
    /// Set while the runtime thread is blocked in the reactor.
    parked: AtomicBool,
    unpark: mio::Waker,
}

impl Injector {
    pub(crate) fn new(unpark: mio::Waker) -> Self {
        Self {
            queue: SegQueue::new(),
            parked: AtomicBool::new(false),
            unpark,
        }
    }

    pub(crate) fn push(&self, id: usize) {
        self.queue.push(id);
        self.try_unpark();
    }

    pub(crate) fn pop(&self) -> Option<usize> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Marks the runtime as about to block. Returns false if work arrived in the meantime.
    pub(crate) fn park(&self) -> bool {
        self.parked.store(true, Ordering::SeqCst);
        // Pairs with the fence in `try_unpark`: either this check sees the pushed id or the
        // pusher sees `parked` and interrupts the poll.
        fence(Ordering::SeqCst);
        if !self.queue.is_empty() {
            self.parked.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn unparked(&self) {
        self.parked.store(false, Ordering::Release);
    }

    fn try_unpark(&self) {
        fence(Ordering::SeqCst);
        if self.parked.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.unpark.wake() {
                warn!("failed to interrupt reactor poll: {e}");
            }
        }
    }
}

/// What one batch of polling observed.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Batch {
    pub polled: usize,
    pub main_woken: bool,
}

/// A single-threaded executor for running async tasks.
pub(crate) struct Executor {
    tasks: RefCell<Slab<Rc<Task>>>,
    injector: Arc<Injector>,
}

impl Executor {
    pub(crate) fn new(injector: Arc<Injector>) -> Self {
        Self {
            tasks: RefCell::new(Slab::new()),
            injector,
        }
    }

    pub(crate) fn injector(&self) -> &Arc<Injector> {
        &self.injector
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let (future, state) = joinable(future);
        let task = {
            let mut tasks = self.tasks.borrow_mut();
            let entry = tasks.vacant_entry();
            let task = Rc::new(Task::new(entry.key(), future, self.injector.clone()));
            entry.insert(task.clone());
            task
        };
        counter!("async_pipe_tasks_spawned_total").increment(1);
        gauge!("async_pipe_tasks_pending_current").increment(1.0);
        trace!("spawned task {}", task.id);

        self.injector.push(task.id);
        JoinHandle::new(state, Rc::downgrade(&task), self.injector.clone())
    }

    /// Polls ready tasks until the injector is empty or `budget` tasks were polled.
    pub(crate) fn run_ready(&self, budget: usize) -> Batch {
        let mut batch = Batch::default();
        while batch.polled < budget {
            let Some(id) = self.injector.pop() else {
                break;
            };
            if id == MAIN_TASK {
                batch.main_woken = true;
                continue;
            }
            let Some(task) = self.tasks.borrow().get(id).cloned() else {
                // Stale wakeup for a task that already finished.
                continue;
            };
            batch.polled += 1;

            if task.is_cancelled() {
                trace!("dropping cancelled task {id}");
                drop(task.try_take());
                self.remove(id);
                continue;
            }
            let Some(mut future) = task.try_take() else {
                continue;
            };
            let mut cx = Context::from_waker(task.waker());
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    drop(future);
                    self.remove(id);
                }
                Poll::Pending if task.is_cancelled() => {
                    drop(future);
                    self.remove(id);
                }
                Poll::Pending => task.restore(future),
            }
        }
        batch
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.injector.is_empty()
    }

    /// Drops every remaining task. Futures are dropped outside the slab borrow so their
    /// destructors may touch the runtime.
    pub(crate) fn shutdown(&self) {
        let tasks: Vec<Rc<Task>> = self.tasks.borrow_mut().drain().collect();
        if !tasks.is_empty() {
            trace!("dropping {} unfinished tasks", tasks.len());
            gauge!("async_pipe_tasks_pending_current").decrement(tasks.len() as f64);
        }
        for task in tasks {
            drop(task.try_take());
        }
    }

    fn remove(&self, id: usize) {
        let removed = self.tasks.borrow_mut().try_remove(id);
        if removed.is_some() {
            gauge!("async_pipe_tasks_pending_current").decrement(1.0);
        }
        // The future, if still present, is dropped here with the slab released.
        drop(removed);
    }
}
