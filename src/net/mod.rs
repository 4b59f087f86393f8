//! Task-level blocking sockets over nonblocking descriptors.
//!
//! Every operation makes one nonblocking attempt and, if the OS reports it
//! would block, parks the calling task on the loop's poller until the
//! descriptor is ready, the deadline passes, or the socket is closed.
//! Addresses are IPv4 literals throughout.

mod ifaces;
mod tcp;
mod udp;

pub use self::ifaces::{interfaces, Interface};
pub use self::tcp::{TcpListener, TcpStream};
pub use self::udp::UdpSocket;

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::event_loop;
use crate::interest::Interest;
use crate::sys;
use crate::task::WakeReason;
use crate::time;

/// The descriptor slot shared by every socket type.
///
/// Sockets are pinned to the loop of the thread that created them. Closing
/// is explicit and idempotent: the first close aborts any task parked on
/// the descriptor, shuts the socket down both ways and releases the fd;
/// later closes (including the one in `Drop`) are no-ops. Share a socket
/// between tasks with `Rc` to use close-from-another-task as the
/// cancellation primitive.
pub(crate) struct SocketIo {
    fd: RefCell<Option<OwnedFd>>,
    _pinned: PhantomData<*const ()>,
}

impl SocketIo {
    pub(crate) fn new(fd: OwnedFd) -> SocketIo {
        SocketIo {
            fd: RefCell::new(Some(fd)),
            _pinned: PhantomData,
        }
    }

    /// The raw fd, or [`Error::Closed`] once the socket was closed under
    /// the caller's feet.
    pub(crate) fn raw(&self) -> Result<RawFd> {
        self.fd
            .borrow()
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or(Error::Closed)
    }

    /// Borrow of the fd slot, for `SockRef`-based option access.
    pub(crate) fn fd_guard(&self) -> std::cell::Ref<'_, Option<OwnedFd>> {
        self.fd.borrow()
    }

    pub(crate) fn close(&self) {
        let Some(fd) = self.fd.borrow_mut().take() else {
            return;
        };
        let raw = fd.as_raw_fd();
        debug!("closing socket fd {}", raw);
        // Abort whoever is parked on this descriptor and clear the poller,
        // registry and timeout entries before the fd goes away.
        event_loop::with_current(|event_loop| event_loop.cancel_fd(raw));
        let _ = sys::net::shutdown_both(raw);
        drop(fd);
    }
}

impl Drop for SocketIo {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SocketIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw() {
            Ok(fd) => f.debug_struct("SocketIo").field("fd", &fd).finish(),
            Err(_) => f.debug_struct("SocketIo").field("fd", &"closed").finish(),
        }
    }
}

/// Absolute deadline for a caller-supplied timeout.
pub(crate) fn deadline_of(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|t| time::now_ms() + time::timeout_ms(t))
}

/// Parks the calling task on `fd` until it reports `interest`.
///
/// Maps the wake verdict to the adapter's error space: a deadline becomes
/// [`Error::Timeout`], socket teardown becomes [`Error::Aborted`]. Fails
/// with [`Error::InvalidParam`] outside a task.
pub(crate) fn wait_ready(fd: RawFd, interest: Interest, deadline: Option<u64>) -> Result<()> {
    let remaining = match deadline {
        Some(deadline) => {
            let now = time::now_ms();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            Some(Duration::from_millis(deadline - now))
        }
        None => None,
    };
    let reason = event_loop::with_current(|event_loop| event_loop.wait_fd(fd, interest, remaining))
        .ok_or(Error::InvalidParam)??;
    match reason {
        WakeReason::Ready => Ok(()),
        WakeReason::Timeout => Err(Error::Timeout),
        WakeReason::Aborted => Err(Error::Aborted),
    }
}

pub(crate) fn is_would_block(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}

pub(crate) fn is_interrupted(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::Interrupted
}
