//! Synchronous pipe endpoint.
//!
//! [`Connection`] is one side of a `socketpair(2)`. It speaks the length-prefixed framing of
//! [`crate::frame`] and offers blocking send/receive calls. [`AsyncConnection`] wraps the same type
//! in non-blocking mode and drives it through the `try_*` helpers below.
//!
//! [`AsyncConnection`]: crate::async_connection::AsyncConnection

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use log::{trace, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::frame::{self, FrameDecoder};

const READ_CHUNK: usize = 64 * 1024;

/// Outcome of a single read from the socket.
enum Fill {
    Data,
    Eof,
    WouldBlock,
}

/// One end of a pipe with blocking message-oriented I/O.
#[derive(Debug)]
pub struct Connection {
    stream: Option<UnixStream>,
    readable: bool,
    writable: bool,
    rx: FrameDecoder,
    peer_closed: bool,
    /// Encoded frames not yet accepted by the socket.
    tx: Vec<u8>,
    tx_pos: usize,
    /// Byte positions in the outgoing stream, used to tell when a given frame has left.
    tx_queued: u64,
    tx_flushed: u64,
}

impl Connection {
    /// Wraps one end of a connected socket pair as a duplex connection.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self::new(stream, true, true)
    }

    pub(crate) fn new(stream: UnixStream, readable: bool, writable: bool) -> Self {
        Self {
            stream: Some(stream),
            readable,
            writable,
            rx: FrameDecoder::default(),
            peer_closed: false,
            tx: Vec::new(),
            tx_pos: 0,
            tx_queued: 0,
            tx_flushed: 0,
        }
    }

    /// The underlying descriptor.
    pub fn fileno(&self) -> Result<RawFd> {
        Ok(self.stream()?.as_raw_fd())
    }

    pub fn closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Serializes `value` and sends it as one message.
    pub fn send<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        self.check_writable()?;
        let payload = bincode::serialize(value)?;
        self.send_frame(&payload)
    }

    /// Sends `buf[offset..offset + size]` (or `buf[offset..]`) as one message.
    pub fn send_bytes(&mut self, buf: &[u8], offset: usize, size: Option<usize>) -> Result<()> {
        self.check_writable()?;
        let payload = frame::window(buf, offset, size)?;
        self.send_frame(payload)
    }

    /// Blocks until a message arrives and deserializes it.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.check_readable()?;
        let payload = self.recv_frame()?;
        Ok(bincode::deserialize(&payload)?)
    }

    /// Blocks until a message arrives and returns its raw bytes.
    ///
    /// A message longer than `max_length` is discarded and reported as
    /// [`Error::MessageTooLong`].
    pub fn recv_bytes(&mut self, max_length: Option<usize>) -> Result<Vec<u8>> {
        self.check_readable()?;
        let payload = self.recv_frame()?;
        check_length(payload, max_length)
    }

    /// Blocks until a message arrives and copies it into `buf[offset..]`.
    pub fn recv_bytes_into(&mut self, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.check_readable()?;
        check_offset(buf, offset)?;
        let payload = self.recv_frame()?;
        copy_into(&payload, buf, offset)
    }

    /// Whether data is available to read, waiting up to `timeout` (`None` waits forever).
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.check_readable()?;
        if !self.rx.is_empty() || self.peer_closed {
            return Ok(true);
        }
        wait_fd(self.fileno()?, libc::POLLIN, timeout)
    }

    /// Closes the descriptor. Calling it again is a no-op.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            trace!("closing pipe endpoint fd={}", stream.as_raw_fd());
            let unsent = self.tx.len() - self.tx_pos;
            if unsent > 0 {
                warn!("dropping {unsent} unsent bytes on close");
            }
            self.tx.clear();
            self.tx_pos = 0;
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.stream()?.set_nonblocking(nonblocking)?;
        Ok(())
    }

    pub(crate) fn check_readable(&self) -> Result<()> {
        self.stream()?;
        if !self.readable {
            return Err(Error::Unsupported("connection is write-only"));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.stream()?;
        if !self.writable {
            return Err(Error::Unsupported("connection is read-only"));
        }
        Ok(())
    }

    /// Pops a buffered frame or reads until one is complete. `Ok(None)` means the socket
    /// would block.
    pub(crate) fn try_recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(payload) = self.take_frame()? {
                return Ok(Some(payload));
            }
            match self.fill_once()? {
                Fill::Data | Fill::Eof => continue,
                Fill::WouldBlock => return Ok(None),
            }
        }
    }

    /// True if a receive would complete from the local buffer alone: a whole frame, a
    /// decode error or the peer's EOF is already buffered.
    pub(crate) fn has_buffered(&self) -> bool {
        self.peer_closed || !matches!(self.rx.has_frame(), Ok(false))
    }

    /// Reads whatever is available without consuming a frame. Returns true if a receive
    /// would complete without blocking.
    pub(crate) fn try_fill(&mut self) -> Result<bool> {
        loop {
            if self.has_buffered() {
                return Ok(true);
            }
            if let Fill::WouldBlock = self.fill_once()? {
                return Ok(false);
            }
        }
    }

    /// Appends a whole frame to the outgoing buffer and returns the stream position its last
    /// byte will occupy.
    pub(crate) fn queue_frame(&mut self, payload: &[u8]) -> u64 {
        let before = self.tx.len();
        frame::encode_into(payload, &mut self.tx);
        self.tx_queued += (self.tx.len() - before) as u64;
        self.tx_queued
    }

    /// Writes queued bytes until the stream position `until` has been reached. `Ok(false)`
    /// means the socket would block first.
    pub(crate) fn try_flush(&mut self, until: u64) -> Result<bool> {
        while self.tx_flushed < until {
            let stream = self.stream.as_ref().ok_or(Error::ClosedConnection)?;
            match (&*stream).write(&self.tx[self.tx_pos..]) {
                Ok(0) => return Err(Error::from_io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.tx_pos += n;
                    self.tx_flushed += n as u64;
                    if self.tx_pos == self.tx.len() {
                        self.tx.clear();
                        self.tx_pos = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e)),
            }
        }
        Ok(true)
    }

    pub(crate) fn queued_position(&self) -> u64 {
        self.tx_queued
    }

    fn stream(&self) -> Result<&UnixStream> {
        self.stream.as_ref().ok_or(Error::ClosedConnection)
    }

    fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let until = self.queue_frame(payload);
        while !self.try_flush(until)? {
            wait_fd(self.fileno()?, libc::POLLOUT, None)?;
        }
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.try_recv_frame()? {
                return Ok(payload);
            }
            wait_fd(self.fileno()?, libc::POLLIN, None)?;
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(payload) = self.rx.next_frame()? {
            return Ok(Some(payload));
        }
        if !self.peer_closed {
            return Ok(None);
        }
        if self.rx.is_empty() {
            Err(Error::EndOfChannel)
        } else {
            Err(Error::from_io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed in the middle of a message",
            )))
        }
    }

    fn fill_once(&mut self) -> Result<Fill> {
        if self.peer_closed {
            return Ok(Fill::Eof);
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let stream = self.stream()?;
            match (&*stream).read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(Fill::Eof);
                }
                Ok(n) => {
                    self.rx.extend(&chunk[..n]);
                    return Ok(Fill::Data);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn check_offset(buf: &[u8], offset: usize) -> Result<()> {
    if offset > buf.len() {
        return Err(Error::InvalidArgument("offset out of bounds"));
    }
    Ok(())
}

pub(crate) fn check_length(payload: Vec<u8>, max_length: Option<usize>) -> Result<Vec<u8>> {
    match max_length {
        Some(max) if payload.len() > max => Err(Error::MessageTooLong {
            length: payload.len(),
            max,
        }),
        _ => Ok(payload),
    }
}

pub(crate) fn copy_into(payload: &[u8], buf: &mut [u8], offset: usize) -> Result<usize> {
    let available = buf.len() - offset;
    if payload.len() > available {
        return Err(Error::BufferTooSmall {
            needed: payload.len(),
            available,
        });
    }
    buf[offset..offset + payload.len()].copy_from_slice(payload);
    Ok(payload.len())
}

/// Waits with `poll(2)` until `fd` reports one of `events`, a hangup, or an error.
fn wait_fd(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> Result<bool> {
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX),
    };
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret >= 0 {
            return Ok(ret > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(Error::Io(err));
        }
    }
}
