use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, io, ptr, slice};

use crate::Interest;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr, $data: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: $data as UData,
        }
    };
}

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub(crate) fn try_clone(&self) -> io::Result<Selector> {
        self.kq.try_clone().map(|kq| Selector { kq })
    }

    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            // `Duration::subsec_nanos` is guaranteed to be less than one
            // billion, making the cast to i32 safe. The cast itself is
            // needed for platforms where C's long is only 32 bits.
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null_mut());

        events.clear();
        syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            events.as_mut_ptr(),
            events.capacity() as Count,
            timeout,
        ))
        .map(|n_events| {
            // This is safe because `kevent` ensures that `n_events` are
            // assigned.
            unsafe { events.set_len(n_events as usize) };
        })
    }

    /// Registers interest, replacing any existing registration for `fd`.
    ///
    /// `EV_ADD` is an upsert; the filter for the direction no longer wanted
    /// is deleted in the same change list (a missing filter is not an
    /// error). No `EV_CLEAR`: readiness reporting stays level-triggered so
    /// that a parked task which retries and hits `EAGAIN` again still sees
    /// the next report. `ident` rides in `udata` so the poller can tell
    /// its internal wakeup source from descriptor readiness.
    pub(crate) fn register(&self, fd: RawFd, ident: usize, interests: Interest) -> io::Result<()> {
        let write_flags = if interests.is_writable() {
            libc::EV_ADD | libc::EV_RECEIPT
        } else {
            libc::EV_DELETE | libc::EV_RECEIPT
        };
        let read_flags = if interests.is_readable() {
            libc::EV_ADD | libc::EV_RECEIPT
        } else {
            libc::EV_DELETE | libc::EV_RECEIPT
        };

        let changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_WRITE, write_flags, ident),
            kevent!(fd, libc::EVFILT_READ, read_flags, ident),
        ];
        self.apply(&changes, &[libc::ENOENT])
    }

    /// Removes `fd` from the interest set. Idempotent.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_DELETE | libc::EV_RECEIPT;
        let changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_WRITE, flags, 0),
            kevent!(fd, libc::EVFILT_READ, flags, 0),
        ];
        self.apply(&changes, &[libc::ENOENT, libc::EBADF])
    }

    /// Submits a change list and checks the per-change `EV_RECEIPT`
    /// results, ignoring the listed errno values.
    fn apply(&self, changes: &[libc::kevent], ignored: &[i32]) -> io::Result<()> {
        let mut results: [MaybeUninit<libc::kevent>; 2] =
            [MaybeUninit::uninit(), MaybeUninit::uninit()];
        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            results.as_mut_ptr().cast(),
            results.len() as Count,
            ptr::null(),
        ))?;

        // SAFETY: `kevent` initialised `n` receipt records.
        let results = unsafe { slice::from_raw_parts(results.as_ptr().cast::<libc::kevent>(), n as usize) };
        for result in results {
            let err = result.data as i32;
            if result.flags & libc::EV_ERROR != 0 && err != 0 && !ignored.contains(&err) {
                return Err(io::Error::from_raw_os_error(err));
            }
        }
        Ok(())
    }

    /// Adds the user-event the waker triggers through.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
    ))]
    pub(crate) fn register_waker(&self, ident: usize) -> io::Result<()> {
        // EV_CLEAR so a delivered wakeup resets itself.
        let mut change = kevent!(
            ident,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT,
            ident
        );
        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            &change,
            1,
            &mut change,
            1,
            ptr::null(),
        ))?;
        if n > 0 && change.flags & libc::EV_ERROR != 0 && change.data != 0 {
            return Err(io::Error::from_raw_os_error(change.data as i32));
        }
        Ok(())
    }

    /// Fires the user-event, breaking a concurrent `select`.
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
    ))]
    pub(crate) fn trigger_waker(&self, ident: usize) -> io::Result<()> {
        let mut change = kevent!(
            ident,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_RECEIPT,
            ident
        );
        change.fflags = libc::NOTE_TRIGGER;
        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            &change,
            1,
            &mut change,
            1,
            ptr::null(),
        ))?;
        if n > 0 && change.flags & libc::EV_ERROR != 0 && change.data != 0 {
            return Err(io::Error::from_raw_os_error(change.data as i32));
        }
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq.as_raw_fd()
    }
}

pub(crate) type Event = libc::kevent;
pub(crate) type Events = Vec<Event>;

pub(crate) mod event {
    use std::os::fd::RawFd;

    use super::Filter;
    use crate::interest::Readiness;
    use crate::sys::{Event, WAKER_IDENT};

    pub(crate) fn fd(event: &Event) -> RawFd {
        event.ident as RawFd
    }

    pub(crate) fn is_waker(event: &Event) -> bool {
        event.udata as usize == WAKER_IDENT
    }

    pub(crate) fn readiness(event: &Event) -> Readiness {
        let mut readiness = Readiness::EMPTY;
        if event.filter == libc::EVFILT_READ as Filter {
            readiness |= Readiness::READABLE;
        }
        if event.filter == libc::EVFILT_WRITE as Filter {
            readiness |= Readiness::WRITABLE;
        }
        if event.flags & libc::EV_ERROR != 0 {
            readiness |= Readiness::ERROR;
        }
        if event.flags & libc::EV_EOF != 0 {
            readiness |= Readiness::HUP;
        }
        readiness
    }
}
