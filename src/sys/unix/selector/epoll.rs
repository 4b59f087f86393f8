use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::Interest;

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying a
                // zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int
            })
            .unwrap_or(-1);

        events.clear();
        syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `epoll_wait` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    /// Registers interest, replacing any existing registration for `fd`.
    pub(crate) fn register(&self, fd: RawFd, ident: usize, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: ident as u64,
        };

        let ep = self.ep.as_raw_fd();
        match syscall!(epoll_ctl(ep, libc::EPOLL_CTL_ADD, fd, &mut event)) {
            Err(ref err) if err.raw_os_error() == Some(libc::EEXIST) => {
                syscall!(epoll_ctl(ep, libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    /// Removes `fd` from the interest set. Idempotent.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let ep = self.ep.as_raw_fd();
        match syscall!(epoll_ctl(ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())) {
            Err(ref err)
                if err.raw_os_error() == Some(libc::ENOENT)
                    || err.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

// The poller hands readiness to parked tasks that retry a nonblocking
// syscall, so interest must be level-triggered: no EPOLLET here.
fn interests_to_epoll(interests: Interest) -> u32 {
    let mut kind = 0;

    if interests.is_readable() {
        kind = kind | EPOLLIN | EPOLLRDHUP;
    }

    if interests.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use std::os::fd::RawFd;

    use crate::interest::Readiness;
    use crate::sys::{Event, WAKER_IDENT};

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.u64 as RawFd
    }

    pub(crate) fn is_waker(event: &Event) -> bool {
        event.u64 == WAKER_IDENT as u64
    }

    pub(crate) fn readiness(event: &Event) -> Readiness {
        let bits = event.events as libc::c_int;
        let mut readiness = Readiness::EMPTY;
        if bits & libc::EPOLLIN != 0 {
            readiness |= Readiness::READABLE;
        }
        if bits & libc::EPOLLOUT != 0 {
            readiness |= Readiness::WRITABLE;
        }
        if bits & libc::EPOLLERR != 0 {
            readiness |= Readiness::ERROR;
        }
        if bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
            readiness |= Readiness::HUP;
        }
        readiness
    }
}
