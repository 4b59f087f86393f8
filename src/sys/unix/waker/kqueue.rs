use std::io;

use crate::sys::{Selector, WAKER_IDENT};

/// Waker backed by kqueue user events (`EVFILT_USER`).
///
/// The selector fd is duplicated so the waker can outlive borrows of the
/// poller and be triggered from other threads. The user event registers
/// with `EV_CLEAR`, so a delivered wakeup resets itself and no drain is
/// needed.
#[derive(Debug)]
pub(crate) struct Waker {
    selector: Selector,
}

impl Waker {
    pub(crate) fn new(selector: &Selector) -> io::Result<Waker> {
        let selector = selector.try_clone()?;
        selector.register_waker(WAKER_IDENT)?;
        Ok(Waker { selector })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        self.selector.trigger_waker(WAKER_IDENT)
    }

    pub(crate) fn ack(&self) {}
}
