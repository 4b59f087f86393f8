use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::interest::{Interest, Readiness};
use crate::sys;

/// One loop's view of the OS readiness mechanism.
///
/// Wraps the platform selector plus the internal wakeup source. Interest
/// is keyed by fd and level-triggered; `add` on an already registered fd
/// replaces the interest, `remove` is idempotent. The wakeup source is
/// registered at construction, drained inside `wait`, and never reported
/// to the caller.
pub(crate) struct Poller {
    selector: sys::Selector,
    waker: Arc<sys::Waker>,
    events: RefCell<sys::Events>,
}

impl Poller {
    pub(crate) fn new(capacity: usize) -> io::Result<Poller> {
        let selector = sys::Selector::new()?;
        let waker = Arc::new(sys::Waker::new(&selector)?);
        Ok(Poller {
            selector,
            waker,
            events: RefCell::new(sys::Events::with_capacity(capacity)),
        })
    }

    pub(crate) fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        trace!("poller add fd {} ({:?})", fd, interest);
        self.selector.register(fd, fd as usize, interest)
    }

    pub(crate) fn remove(&self, fd: RawFd) -> io::Result<()> {
        trace!("poller remove fd {}", fd);
        self.selector.deregister(fd)
    }

    /// Waits up to `timeout` (`None` = indefinitely, zero = nonblocking)
    /// and appends `(fd, readiness)` records to `out`. Restarts on
    /// `EINTR`; a fired wakeup source is acknowledged and filtered out.
    pub(crate) fn wait(
        &self,
        out: &mut Vec<(RawFd, Readiness)>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        out.clear();
        let mut events = self.events.borrow_mut();
        loop {
            match self.selector.select(&mut events, timeout) {
                Ok(()) => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        for event in events.iter() {
            if sys::event::is_waker(event) {
                self.waker.ack();
                continue;
            }
            out.push((sys::event::fd(event), sys::event::readiness(event)));
        }
        Ok(())
    }

    pub(crate) fn waker(&self) -> Arc<sys::Waker> {
        Arc::clone(&self.waker)
    }

    /// Breaks a concurrent or future `wait` within a bounded time.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("capacity", &self.events.borrow().capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Poller;
    use crate::{Interest, Readiness};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    #[test]
    fn readiness_for_registered_fd() {
        let poller = Poller::new(8).unwrap();
        let (mut left, right) = UnixStream::pair().unwrap();
        right.set_nonblocking(true).unwrap();

        poller
            .add(right.as_raw_fd(), Interest::READABLE)
            .unwrap();

        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(events.is_empty());

        left.write_all(b"x").unwrap();
        poller
            .wait(&mut events, Some(Duration::from_millis(500)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, right.as_raw_fd());
        assert!(events[0].1.is_readable());
    }

    #[test]
    fn add_is_an_upsert_and_remove_is_idempotent() {
        let poller = Poller::new(8).unwrap();
        let (_left, right) = UnixStream::pair().unwrap();
        let fd = right.as_raw_fd();

        poller.add(fd, Interest::READABLE).unwrap();
        poller
            .add(fd, Interest::READABLE | Interest::WRITABLE)
            .unwrap();

        let mut events = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_millis(500)))
            .unwrap();
        assert!(events.iter().any(|(got, ready)| *got == fd && ready.is_writable()));

        poller.remove(fd).unwrap();
        poller.remove(fd).unwrap();
    }

    #[test]
    fn waker_breaks_the_wait_and_is_not_reported() {
        let poller = Poller::new(8).unwrap();
        let waker = poller.waker();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake().unwrap();
        });

        let mut events = Vec::new();
        // Indefinite wait; only the waker can end it.
        poller.wait(&mut events, None).unwrap();
        assert!(events.is_empty());
        handle.join().unwrap();
    }

    #[test]
    fn zero_timeout_polls() {
        let poller = Poller::new(8).unwrap();
        let mut events: Vec<(i32, Readiness)> = Vec::new();
        poller.wait(&mut events, Some(Duration::ZERO)).unwrap();
        assert!(events.is_empty());
    }
}
