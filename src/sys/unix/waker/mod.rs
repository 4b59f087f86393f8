//! The per-loop cross-thread wakeup source.
//!
//! `eventfd` where the OS has it, the kqueue user-event filter where that
//! exists, and a nonblocking self-pipe everywhere else (NetBSD and
//! OpenBSD poll with `kevent` but lack `EVFILT_USER`). All three register
//! under [`crate::sys::WAKER_IDENT`] and are drained (or self-clearing)
//! before readiness is reported to the loop.

#[cfg(any(target_os = "android", target_os = "linux"))]
mod eventfd;
#[cfg(any(target_os = "android", target_os = "linux"))]
pub(crate) use self::eventfd::Waker;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
))]
mod kqueue;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
))]
pub(crate) use self::kqueue::Waker;

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
mod pipe;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
pub(crate) use self::pipe::Waker;
