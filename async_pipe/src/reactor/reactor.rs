use log::{debug, trace};
use metrics::counter;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::{Direction, ReadyCallback};

/// Token of the waker that interrupts a blocked poll.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// One watched descriptor: a callback slot per direction.
struct Watch {
    fd: RawFd,
    callbacks: [Option<ReadyCallback>; 2],
}

impl Watch {
    fn interest(&self) -> Option<Interest> {
        match (&self.callbacks[0], &self.callbacks[1]) {
            (Some(_), Some(_)) => Some(Interest::READABLE | Interest::WRITABLE),
            (Some(_), None) => Some(Interest::READABLE),
            (None, Some(_)) => Some(Interest::WRITABLE),
            (None, None) => None,
        }
    }
}

/// Manages I/O readiness events for the runtime.
///
/// The reactor uses system-level event notification (epoll on Linux, kqueue on macOS)
/// through mio. Each watched descriptor gets one mio registration whose interest is the
/// union of the directions currently watched; watching or unwatching a direction
/// re-registers the descriptor with the updated interest.
///
/// mio registrations are edge-triggered: a direction is reported once per readiness
/// transition. Consumers keep the readiness as a hint until an operation proves otherwise.
pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    watches: Slab<Watch>,
    by_fd: HashMap<RawFd, usize>,
}

impl Reactor {
    /// Creates a new reactor and the waker that interrupts its poll from other threads.
    pub(crate) fn new(event_capacity: usize) -> io::Result<(Self, mio::Waker)> {
        let poll = Poll::new()?;
        let unpark = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        let reactor = Self {
            poll,
            events: Events::with_capacity(event_capacity.max(1)),
            watches: Slab::new(),
            by_fd: HashMap::new(),
        };
        Ok((reactor, unpark))
    }

    /// Starts delivering readiness of `direction` on `fd` to `on_ready`.
    pub(crate) fn watch(&mut self, fd: RawFd, direction: Direction, on_ready: ReadyCallback) -> Result<()> {
        let registry = self.poll.registry();
        match self.by_fd.get(&fd).copied() {
            Some(key) => {
                let watch = &mut self.watches[key];
                if watch.callbacks[direction.index()].is_some() {
                    return Err(Error::AlreadyRegistered(direction));
                }
                watch.callbacks[direction.index()] = Some(on_ready);
                if let Some(interest) = watch.interest() {
                    if let Err(e) = registry.reregister(&mut SourceFd(&fd), Token(key), interest) {
                        watch.callbacks[direction.index()] = None;
                        return Err(Error::Io(e));
                    }
                }
            }
            None => {
                let entry = self.watches.vacant_entry();
                let key = entry.key();
                let mut watch = Watch {
                    fd,
                    callbacks: [None, None],
                };
                watch.callbacks[direction.index()] = Some(on_ready);
                if let Some(interest) = watch.interest() {
                    registry.register(&mut SourceFd(&fd), Token(key), interest)?;
                }
                entry.insert(watch);
                self.by_fd.insert(fd, key);
            }
        }
        debug!("watching fd={fd} for {direction} readiness");
        Ok(())
    }

    /// Stops delivering readiness of `direction` on `fd`. Removes the mio registration once
    /// no direction is left.
    pub(crate) fn unwatch(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        let Some(&key) = self.by_fd.get(&fd) else {
            return Ok(());
        };
        let registry = self.poll.registry();
        let watch = &mut self.watches[key];
        if watch.callbacks[direction.index()].take().is_none() {
            return Ok(());
        }
        debug!("unwatching fd={fd} for {direction} readiness");
        match watch.interest() {
            Some(interest) => registry.reregister(&mut SourceFd(&fd), Token(key), interest)?,
            None => {
                let fd = watch.fd;
                self.watches.remove(key);
                self.by_fd.remove(&fd);
                if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                    // ENOENT / EBADF are expected if the descriptor was already closed.
                    if !matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                        return Err(Error::Io(e));
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of descriptors with at least one watched direction.
    pub(crate) fn watched(&self) -> usize {
        self.watches.len()
    }

    /// Blocks up to `timeout` waiting for events and returns the callbacks to run.
    ///
    /// Callbacks are returned instead of invoked so the caller can release its borrow of
    /// the reactor first; a callback is free to watch or unwatch descriptors.
    pub(crate) fn turn(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyCallback>> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e);
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let Some(watch) = self.watches.get(token.0) else {
                continue;
            };
            let failed = event.is_error();
            let readable = event.is_readable() || event.is_read_closed() || failed;
            let writable = event.is_writable() || event.is_write_closed() || failed;
            for (direction, fired) in [(Direction::Read, readable), (Direction::Write, writable)] {
                if !fired {
                    continue;
                }
                if let Some(callback) = &watch.callbacks[direction.index()] {
                    trace!("fd={} is {direction}-ready", watch.fd);
                    counter!("async_pipe_readiness_events_total", "direction" => direction.label())
                        .increment(1);
                    ready.push(callback.clone());
                }
            }
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn counter_callback() -> (Rc<Cell<usize>>, ReadyCallback) {
        let hits = Rc::new(Cell::new(0));
        let seen = hits.clone();
        (hits, Rc::new(move || seen.set(seen.get() + 1)))
    }

    #[test]
    fn reports_read_readiness() {
        let (mut reactor, _unpark) = Reactor::new(16).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let (hits, callback) = counter_callback();
        reactor.watch(a.as_raw_fd(), Direction::Read, callback).unwrap();

        b.write_all(b"x").unwrap();
        for cb in reactor.turn(Some(Duration::from_millis(200))).unwrap() {
            cb();
        }
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn second_watch_of_same_direction_fails() {
        let (mut reactor, _unpark) = Reactor::new(16).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let (_, read) = counter_callback();
        let (_, again) = counter_callback();
        let (_, write) = counter_callback();
        reactor.watch(fd, Direction::Read, read).unwrap();
        assert!(matches!(
            reactor.watch(fd, Direction::Read, again),
            Err(Error::AlreadyRegistered(Direction::Read))
        ));
        reactor.watch(fd, Direction::Write, write).unwrap();
        assert_eq!(reactor.watched(), 1);
    }

    #[test]
    fn unwatching_both_directions_drops_the_registration() {
        let (mut reactor, _unpark) = Reactor::new(16).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        let (_, read) = counter_callback();
        let (_, write) = counter_callback();
        reactor.watch(fd, Direction::Read, read).unwrap();
        reactor.watch(fd, Direction::Write, write).unwrap();

        reactor.unwatch(fd, Direction::Read).unwrap();
        assert_eq!(reactor.watched(), 1);
        reactor.unwatch(fd, Direction::Write).unwrap();
        assert_eq!(reactor.watched(), 0);
        // Idempotent.
        reactor.unwatch(fd, Direction::Write).unwrap();
    }

    #[test]
    fn times_out_without_events() {
        let (mut reactor, _unpark) = Reactor::new(16).unwrap();
        let ready = reactor.turn(Some(Duration::from_millis(1))).unwrap();
        assert!(ready.is_empty());
    }
}
