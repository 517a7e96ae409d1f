//! Spawned tasks and the handles used to await or abort them.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::executor::Injector;

/// A pinned, heap-allocated future driven by the executor.
///
/// Tasks never leave the runtime thread, so the future does not need to be `Send`.
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// A future owned by the executor, plus the waker that reschedules it.
pub(crate) struct Task {
    pub id: usize,
    future: RefCell<Option<TaskFuture>>,
    cancelled: Cell<bool>,
    waker: Waker,
}

impl Task {
    pub(crate) fn new(id: usize, future: TaskFuture, injector: Arc<Injector>) -> Self {
        Self {
            id,
            future: RefCell::new(Some(future)),
            cancelled: Cell::new(false),
            waker: crate::waker::task_waker(id, injector),
        }
    }

    /// Takes the future out for polling. `None` if it is already being polled or has finished.
    pub(crate) fn try_take(&self) -> Option<TaskFuture> {
        self.future.borrow_mut().take()
    }

    /// Puts a future that returned `Pending` back.
    pub(crate) fn restore(&self, future: TaskFuture) {
        *self.future.borrow_mut() = Some(future);
    }

    pub(crate) fn waker(&self) -> &Waker {
        &self.waker
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    fn cancel(&self) {
        self.cancelled.set(true);
    }
}

/// Completion slot shared between a task and its [`JoinHandle`].
pub(crate) struct JoinState<T> {
    result: RefCell<Option<Result<T>>>,
    finished: Cell<bool>,
    waiter: RefCell<Option<Waker>>,
}

impl<T> JoinState<T> {
    fn complete(&self, result: Result<T>) {
        if self.finished.replace(true) {
            return;
        }
        *self.result.borrow_mut() = Some(result);
        if let Some(waker) = self.waiter.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// Completes the join state with [`Error::Cancelled`] if the task future is dropped early.
struct CancelGuard<T> {
    state: Rc<JoinState<T>>,
}

impl<T> Drop for CancelGuard<T> {
    fn drop(&mut self) {
        self.state.complete(Err(Error::Cancelled));
    }
}

/// Wraps `future` so that its output lands in the returned state.
pub(crate) fn joinable<F>(future: F) -> (TaskFuture, Rc<JoinState<F::Output>>)
where
    F: Future + 'static,
    F::Output: 'static,
{
    let state = Rc::new(JoinState {
        result: RefCell::new(None),
        finished: Cell::new(false),
        waiter: RefCell::new(None),
    });
    let guard = CancelGuard {
        state: state.clone(),
    };
    let wrapped = async move {
        let output = future.await;
        guard.state.complete(Ok(output));
    };
    (Box::pin(wrapped), state)
}

/// An owned permission to await or abort a spawned task.
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    state: Rc<JoinState<T>>,
    task: Weak<Task>,
    injector: Arc<Injector>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(state: Rc<JoinState<T>>, task: Weak<Task>, injector: Arc<Injector>) -> Self {
        Self {
            state,
            task,
            injector,
        }
    }

    /// Cancels the task. Its future is dropped on the next scheduler cycle and awaiting the
    /// handle yields [`Error::Cancelled`]. No effect once the task has finished.
    pub fn abort(&self) {
        if let Some(task) = self.task.upgrade() {
            task.cancel();
            self.injector.push(task.id);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.get()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = &self.state;
        if let Some(result) = state.result.borrow_mut().take() {
            return Poll::Ready(result);
        }
        if state.finished.get() {
            // The result was already handed out by an earlier poll.
            return Poll::Ready(Err(Error::Cancelled));
        }
        *state.waiter.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}
