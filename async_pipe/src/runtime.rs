//! The single-threaded cooperative runtime.
//!
//! The runtime owns the executor, the reactor and the timer queue, and drives all three from
//! the thread that calls [`Runtime::block_on`]. A [`Handle`] to it is stored in thread-local
//! storage for the duration of `block_on`, so code running inside can reach it without
//! threading it through every call.

use std::cell::RefCell;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::LocalBoxFuture;
use log::{debug, info};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::executor::{Executor, Injector, MAIN_TASK};
use crate::reactor::Reactor;
use crate::scheduler::{Direction, ReadyCallback, Scheduler};
use crate::task::JoinHandle;
use crate::time::{Sleep, TimerQueue};

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

struct Core {
    executor: Executor,
    reactor: RefCell<Reactor>,
    timers: RefCell<TimerQueue>,
    tick_budget: usize,
}

impl Core {
    /// One scheduler cycle: run ready tasks, fire due timers, then turn the reactor.
    ///
    /// Returns true if the `block_on` future was woken.
    fn tick(&self) -> bool {
        let batch = self.executor.run_ready(self.tick_budget);

        let due = self.timers.borrow_mut().fire_due(Instant::now());
        for waker in due {
            waker.wake();
        }

        let injector = self.executor.injector();
        let mut timeout = if batch.main_woken || self.executor.has_ready() {
            Some(Duration::ZERO)
        } else {
            self.timers
                .borrow_mut()
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        };
        if timeout != Some(Duration::ZERO) && !injector.park() {
            timeout = Some(Duration::ZERO);
        }

        let turned = self.reactor.borrow_mut().turn(timeout);
        injector.unparked();
        let callbacks = match turned {
            Ok(callbacks) => callbacks,
            Err(e) => panic!("Reactor poll error: {e}"),
        };
        for callback in callbacks {
            callback();
        }

        batch.main_woken
    }
}

/// The async runtime combining executor, reactor and timers on one thread.
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a runtime.
    ///
    /// If `config.metrics_addr` is set, a Prometheus exporter is installed and serves
    /// `/metrics` on that address.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let runtime = Runtime::with_config(RuntimeConfig::from_env()?)?;
    /// runtime.block_on(async {
    ///     // Your async code here
    /// });
    /// ```
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        if let Some(addr) = config.metrics_addr {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| Error::Config(format!("metrics exporter: {e}")))?;
            info!("metrics enabled at http://{addr}/metrics");
        }

        let (reactor, unpark) = Reactor::new(config.event_capacity)?;
        let injector = Arc::new(Injector::new(unpark));
        let core = Core {
            executor: Executor::new(injector),
            reactor: RefCell::new(reactor),
            timers: RefCell::new(TimerQueue::default()),
            tick_budget: config.tick_budget.max(1),
        };
        debug!("runtime started with {config:?}");

        Ok(Self {
            handle: Handle {
                core: Rc::new(core),
            },
        })
    }

    /// A handle that can be passed to connections and used to spawn tasks.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Spawns a future to run concurrently with the `block_on` future.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` to completion on the current thread, driving spawned tasks, timers and
    /// I/O readiness while it is pending.
    ///
    /// # Panics
    ///
    /// Panics if the reactor fails to poll for events.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _enter = self.handle.enter();
        let core = &self.handle.core;
        let mut future = pin!(future);

        let waker = crate::waker::task_waker(MAIN_TASK, core.executor.injector().clone());
        let mut cx = Context::from_waker(&waker);

        let mut main_woken = true;
        loop {
            if main_woken {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
            }
            main_woken = core.tick();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Tasks hold handles to the core, so they are dropped explicitly to break the cycle.
        self.handle.core.executor.shutdown();
        debug!("runtime stopped");
    }
}

/// A cheap, clonable reference to a [`Runtime`].
///
/// `Handle` is the runtime's [`Scheduler`]: pass it to
/// [`AsyncConnection::new`](crate::async_connection::AsyncConnection::new).
#[derive(Clone)]
pub struct Handle {
    core: Rc<Core>,
}

impl Handle {
    /// The handle of the runtime currently inside `block_on` on this thread.
    pub fn current() -> Result<Handle> {
        CURRENT.with(|current| current.borrow().clone().ok_or(Error::NoRuntime))
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.core.executor.spawn(future)
    }

    /// A future that completes after `duration`.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(self.clone(), duration)
    }

    /// Number of descriptors the reactor currently watches.
    pub fn watched_descriptors(&self) -> usize {
        self.core.reactor.borrow().watched()
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerQueue> {
        &self.core.timers
    }

    fn enter(&self) -> EnterGuard {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        EnterGuard { previous }
    }
}

impl Scheduler for Handle {
    fn watch(&self, fd: RawFd, direction: Direction, on_ready: ReadyCallback) -> Result<()> {
        self.core.reactor.borrow_mut().watch(fd, direction, on_ready)
    }

    fn unwatch(&self, fd: RawFd, direction: Direction) -> Result<()> {
        self.core.reactor.borrow_mut().unwatch(fd, direction)
    }

    fn sleep(&self, duration: Duration) -> LocalBoxFuture<'static, ()> {
        Box::pin(Handle::sleep(self, duration))
    }
}

/// Restores the previously current runtime when `block_on` returns.
struct EnterGuard {
    previous: Option<Handle>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Spawns a future on the runtime running on this thread.
///
/// # Panics
///
/// Panics if called outside of `block_on`.
///
/// # Examples
///
/// ```ignore
/// #[async_pipe::main]
/// async fn main() {
///     let task = spawn(async { 40 + 2 });
///     assert_eq!(task.await.unwrap(), 42);
/// }
/// ```
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    Handle::current()
        .expect("async_pipe: spawn called outside of a runtime context")
        .spawn(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn block_on_returns_output() {
        let runtime = Runtime::new().unwrap();
        assert_eq!(runtime.block_on(async { 7 }), 7);
    }

    #[test]
    fn spawned_tasks_run_and_join() {
        let runtime = Runtime::new().unwrap();
        let out = runtime.block_on(async {
            let a = spawn(async { 1 });
            let b = spawn(async { 2 });
            a.await.unwrap() + b.await.unwrap()
        });
        assert_eq!(out, 3);
    }

    #[test]
    fn sleep_waits_for_deadline() {
        let runtime = Runtime::new().unwrap();
        let handle = runtime.handle();
        let started = Instant::now();
        runtime.block_on(async move { handle.sleep(Duration::from_millis(20)).await });
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn abort_cancels_pending_task() {
        let runtime = Runtime::new().unwrap();
        let handle = runtime.handle();
        let reached = Rc::new(Cell::new(false));
        let flag = reached.clone();
        let result = runtime.block_on(async move {
            let sleeper = handle.clone();
            let task = handle.spawn(async move {
                sleeper.sleep(Duration::from_secs(60)).await;
                flag.set(true);
            });
            handle.sleep(Duration::from_millis(5)).await;
            task.abort();
            task.await
        });
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!reached.get());
    }

    #[test]
    fn wakes_from_other_threads_interrupt_the_reactor() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let runtime = Runtime::new().unwrap();
        for _ in 0..200 {
            let done = Arc::new(AtomicBool::new(false));
            let mut started = false;
            runtime.block_on(std::future::poll_fn(|cx| {
                if done.load(Ordering::Acquire) {
                    return Poll::Ready(());
                }
                if !started {
                    started = true;
                    let waker = cx.waker().clone();
                    let done = done.clone();
                    std::thread::spawn(move || {
                        done.store(true, Ordering::Release);
                        waker.wake();
                    });
                }
                Poll::Pending
            }));
        }
    }

    #[test]
    fn current_handle_only_inside_block_on() {
        assert!(matches!(Handle::current(), Err(Error::NoRuntime)));
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async { assert!(Handle::current().is_ok()) });
        assert!(matches!(Handle::current(), Err(Error::NoRuntime)));
    }
}
