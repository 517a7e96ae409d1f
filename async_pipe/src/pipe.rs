//! Constructors for connected endpoint pairs.

use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use log::debug;

use crate::async_connection::AsyncConnection;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

/// Creates two connected endpoints.
///
/// With `duplex` both ends can send and receive. Otherwise the first end only receives and
/// the second only sends.
pub fn pipe(duplex: bool) -> Result<(Connection, Connection)> {
    let (a, b) = UnixStream::pair()?;
    if duplex {
        return Ok((Connection::from_stream(a), Connection::from_stream(b)));
    }
    a.shutdown(Shutdown::Write)?;
    b.shutdown(Shutdown::Read)?;
    Ok((Connection::new(a, true, false), Connection::new(b, false, true)))
}

/// Creates a duplex pair and wraps the first end for use with `scheduler`.
///
/// The second end stays a plain [`Connection`], typically handed to a blocking peer such as
/// a worker thread.
///
/// Fails with [`Error::Unsupported`] unless `duplex` is true.
pub fn async_pipe<S: Scheduler + 'static>(
    duplex: bool,
    scheduler: S,
) -> Result<(AsyncConnection, Connection)> {
    if !duplex {
        return Err(Error::Unsupported("simplex async pipes are not supported"));
    }
    let (a, b) = pipe(true)?;
    let a = AsyncConnection::new(a, scheduler)?;
    debug!("created async pipe");
    Ok((a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplex_ends_are_one_way() {
        let (mut reader, mut writer) = pipe(false).unwrap();
        assert!(reader.readable() && !reader.writable());
        assert!(!writer.readable() && writer.writable());

        writer.send(&"hello").unwrap();
        assert_eq!(reader.recv::<String>().unwrap(), "hello");
        assert!(matches!(reader.send(&1u8), Err(Error::Unsupported(_))));
        assert!(matches!(writer.recv::<u8>(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn duplex_ends_talk_both_ways() {
        let (mut a, mut b) = pipe(true).unwrap();
        a.send(&1u32).unwrap();
        b.send(&2u32).unwrap();
        assert_eq!(b.recv::<u32>().unwrap(), 1);
        assert_eq!(a.recv::<u32>().unwrap(), 2);
    }

    #[test]
    fn simplex_async_pipe_is_unsupported() {
        let runtime = crate::runtime::Runtime::new().unwrap();
        assert!(matches!(
            async_pipe(false, runtime.handle()),
            Err(Error::Unsupported(_))
        ));
    }
}
