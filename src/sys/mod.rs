//! Platform-specific readiness plumbing.
//!
//! Each backend exports the same surface: a `Selector` wrapping the OS
//! polling primitive, a `Waker` able to break the selector out of a wait
//! from another thread, the raw `Event`/`Events` types, and an `event`
//! module of field accessors. A completion-port backend for Windows would
//! slot in here with the same shape.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{event, net, Event, Events, Selector, Waker, WAKER_IDENT};

#[cfg(not(unix))]
compile_error!("threadlet only supports Unix readiness platforms (epoll/kqueue)");
