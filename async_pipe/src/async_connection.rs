//! Asynchronous wrapper over a pipe [`Connection`].

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace};
use metrics::{counter, gauge};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::{self, Connection};
use crate::error::{Error, Result};
use crate::frame;
use crate::monitor::ReadinessMonitor;
use crate::runtime::Handle;
use crate::scheduler::{Direction, Scheduler};

/// Suspend-capable send/receive over one end of a pipe.
///
/// The connection switches the endpoint to non-blocking mode and registers its descriptor
/// for read and write readiness with the scheduler. Every operation first tries the
/// endpoint directly; only if that would block does it suspend, and after each wakeup it
/// tries again rather than assuming the wakeup was meant for it. Several tasks may
/// therefore share one connection (through an `Rc`) and receive, poll or send concurrently.
///
/// Close the connection with [`close`](Self::close) when done. Dropping it closes it too.
pub struct AsyncConnection {
    conn: RefCell<Connection>,
    monitor: ReadinessMonitor,
}

impl AsyncConnection {
    /// Wraps `conn`, registering its descriptor with `scheduler`.
    pub fn new<S: Scheduler + 'static>(conn: Connection, scheduler: S) -> Result<Self> {
        conn.set_nonblocking(true)?;
        let fd = conn.fileno()?;
        let monitor = ReadinessMonitor::new(fd, Rc::new(scheduler))?;
        gauge!("async_pipe_connections_open").increment(1.0);
        debug!("opened async connection fd={fd}");
        Ok(Self {
            conn: RefCell::new(conn),
            monitor,
        })
    }

    /// Wraps `conn` using the runtime running on this thread.
    pub fn from_current(conn: Connection) -> Result<Self> {
        Self::new(conn, Handle::current()?)
    }

    pub fn fileno(&self) -> Result<RawFd> {
        self.conn.borrow().fileno()
    }

    /// True once the connection has been closed.
    pub fn closed(&self) -> bool {
        self.conn.borrow().closed()
    }

    /// True if this end can receive.
    pub fn readable(&self) -> bool {
        self.conn.borrow().readable()
    }

    /// True if this end can send.
    pub fn writable(&self) -> bool {
        self.conn.borrow().writable()
    }

    /// Sends a serializable value.
    ///
    /// See also [`Connection::send`].
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.conn.borrow().check_writable()?;
        let payload = bincode::serialize(value)?;
        self.send_frame(&payload).await
    }

    /// Sends `buf[offset..offset + size]`, or `buf[offset..]` without a size.
    ///
    /// See also [`Connection::send_bytes`].
    pub async fn send_bytes(&self, buf: &[u8], offset: usize, size: Option<usize>) -> Result<()> {
        self.conn.borrow().check_writable()?;
        let payload = frame::window(buf, offset, size)?;
        self.send_frame(payload).await
    }

    /// Receives a value sent with `send`.
    ///
    /// See also [`Connection::recv`].
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.recv_frame().await?;
        Ok(bincode::deserialize(&payload)?)
    }

    /// Receives a message as raw bytes.
    ///
    /// See also [`Connection::recv_bytes`].
    pub async fn recv_bytes(&self, max_length: Option<usize>) -> Result<Vec<u8>> {
        let payload = self.recv_frame().await?;
        connection::check_length(payload, max_length)
    }

    /// Receives a message into `buf[offset..]` and returns its length.
    ///
    /// A message that does not fit is discarded and reported as
    /// [`Error::BufferTooSmall`]; `buf` is left untouched.
    pub async fn recv_bytes_into(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        connection::check_offset(buf, offset)?;
        let payload = self.recv_frame().await?;
        connection::copy_into(&payload, buf, offset)
    }

    /// Whether a receive would complete without suspending.
    ///
    /// Waits up to `timeout` for that to become true; `None` waits indefinitely and a zero
    /// timeout checks once without suspending. Nothing is consumed, so polling never takes
    /// a message away from a concurrent receiver.
    pub async fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        self.conn.borrow().check_readable()?;
        let ready = self
            .drive(Direction::Read, timeout, |conn| Ok(conn.try_fill()?.then_some(())))
            .await?;
        Ok(ready.is_some())
    }

    /// Deregisters the descriptor, closes the endpoint and fails every suspended operation
    /// with [`Error::ClosedConnection`]. Calling it again is a no-op.
    ///
    /// Frames still queued by cancelled sends are flushed if the socket accepts them
    /// without blocking and dropped otherwise.
    pub fn close(&self) -> Result<()> {
        let deregistered = self.monitor.deregister();
        let mut conn = self.conn.borrow_mut();
        if !conn.closed() {
            let queued = conn.queued_position();
            if let Err(e) = conn.try_flush(queued) {
                debug!("flush on close failed: {e}");
            }
            conn.close();
            gauge!("async_pipe_connections_open").decrement(1.0);
            debug!("closed async connection");
        }
        deregistered
    }

    async fn send_frame(&self, payload: &[u8]) -> Result<()> {
        let until = self.conn.borrow_mut().queue_frame(payload);
        let sent = self
            .drive(Direction::Write, None, |conn| Ok(conn.try_flush(until)?.then_some(())))
            .await?;
        let Some(()) = sent else {
            unreachable!("untimed wait cannot time out");
        };
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Vec<u8>> {
        self.conn.borrow().check_readable()?;
        let payload = self
            .drive(Direction::Read, None, Connection::try_recv_frame)
            .await?;
        let Some(payload) = payload else {
            unreachable!("untimed wait cannot time out");
        };
        Ok(payload)
    }

    /// Runs `attempt` until it succeeds, suspending on `direction` readiness in between.
    ///
    /// `attempt` returns `Ok(None)` when the endpoint would block. The readiness hint is
    /// then lowered and the task waits for the next assertion before trying again. A failed
    /// attempt after a wakeup is expected when other tasks share the connection. `Ok(None)`
    /// is returned only if `timeout` runs out.
    async fn drive<R>(
        &self,
        direction: Direction,
        timeout: Option<Duration>,
        mut attempt: impl FnMut(&mut Connection) -> Result<Option<R>>,
    ) -> Result<Option<R>> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut woken = false;
        loop {
            let seen = self.monitor.readiness(direction);
            let (outcome, buffered) = {
                let mut conn = self.conn.borrow_mut();
                if conn.closed() {
                    return Err(Error::ClosedConnection);
                }
                let outcome = attempt(&mut *conn);
                (outcome, direction == Direction::Read && conn.has_buffered())
            };
            // Data left in the receive buffer is invisible to the edge-triggered
            // registration, so other receivers have to be told about it here.
            if buffered {
                self.monitor.notify(Direction::Read);
            }
            if let Some(value) = outcome? {
                return Ok(Some(value));
            }
            if woken {
                trace!("spurious {direction} wakeup");
                counter!("async_pipe_spurious_wakeups_total", "direction" => direction.label())
                    .increment(1);
            }
            self.monitor.clear_readiness(direction, seen.tick);

            let remaining = match deadline {
                None => None,
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Ok(None),
                },
            };
            if !self.monitor.await_ready(direction, remaining).await? {
                return Ok(None);
            }
            woken = true;
        }
    }
}

impl Drop for AsyncConnection {
    fn drop(&mut self) {
        if !self.closed() {
            debug!("async connection dropped without close");
        }
        let _ = self.close();
    }
}
