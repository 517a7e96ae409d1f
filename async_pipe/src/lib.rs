//! Asynchronous duplex pipe connections on a single-threaded cooperative runtime.
//!
//! A pipe is a pair of connected `socketpair(2)` endpoints exchanging length-prefixed
//! messages. One end can be wrapped in an [`AsyncConnection`], whose operations suspend the
//! calling task instead of blocking the thread. The crate consists of:
//!
//! - [`connection`]: blocking endpoint with message framing
//! - [`async_connection`]: the suspend-capable wrapper
//! - [`monitor`]: per-descriptor readiness hints and waiter sets
//! - [`scheduler`]: the seam between connections and the event loop
//! - [`runtime`]: executor, reactor and timers driven from one thread
//! - [`task`]: join handles for spawned tasks
//! - [`time`]: sleeps and timeouts
//! - [`config`]: runtime tunables
//!
//! ```ignore
//! #[async_pipe::main]
//! async fn main() -> async_pipe::Result<()> {
//!     let handle = async_pipe::Handle::current()?;
//!     let (conn, mut peer) = async_pipe::async_pipe(true, handle)?;
//!     let worker = std::thread::spawn(move || {
//!         let value: Vec<u32> = peer.recv().unwrap();
//!         peer.send(&vec![4u32, 5, 6]).unwrap();
//!         value
//!     });
//!     conn.send(&vec![1u32, 2, 3]).await?;
//!     let reply: Vec<u32> = conn.recv().await?;
//!     assert_eq!(reply, [4, 5, 6]);
//!     assert_eq!(worker.join().unwrap(), [1, 2, 3]);
//!     conn.close()
//! }
//! ```

pub mod async_connection;
pub mod config;
pub mod connection;
pub mod error;
pub(crate) mod executor;
pub(crate) mod frame;
pub mod monitor;
pub mod pipe;
pub(crate) mod reactor;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod time;
pub(crate) mod waker;

pub use async_connection::AsyncConnection;
pub use config::RuntimeConfig;
pub use connection::Connection;
pub use error::{Error, Result};
pub use pipe::{async_pipe, pipe};
pub use runtime::{Handle, Runtime, spawn};
pub use scheduler::{Direction, Scheduler};

pub use async_pipe_macros::{main, test};
