//! Event-driven I/O reactor.
//!
//! The reactor watches descriptors through mio and reports, once per scheduler cycle, which
//! watched directions the operating system reported as ready.

#[allow(clippy::module_inception)]
pub(crate) mod reactor;
pub(crate) use reactor::Reactor;
