use std::collections::HashMap;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::task::Task;
use crate::Interest;

/// What the timeout heap and waiter registry are keyed by.
///
/// Socket waits use the (non-negative) raw fd. Timer-only waits — sleeps,
/// interval ticks — use unique negative keys handed out by the loop, so
/// concurrent sleepers never collide with each other or with any fd.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct WaitKey(pub(crate) i32);

impl WaitKey {
    pub(crate) fn fd(fd: RawFd) -> WaitKey {
        WaitKey(fd)
    }

    pub(crate) fn as_fd(self) -> Option<RawFd> {
        (self.0 >= 0).then_some(self.0)
    }
}

/// A parked task and what it is parked on.
pub(crate) struct Waiter {
    pub(crate) task: Rc<Task>,
    pub(crate) interest: Option<Interest>,
    pub(crate) deadline: Option<u64>,
}

/// The per-loop registry of parked tasks, keyed by [`WaitKey`].
///
/// At most one waiter per key; an entry with an fd key exists iff the
/// poller holds matching interest for that fd (the loop removes both
/// together on every wake).
#[derive(Default)]
pub(crate) struct WaiterTable {
    entries: HashMap<WaitKey, Waiter>,
}

impl WaiterTable {
    pub(crate) fn insert(&mut self, key: WaitKey, waiter: Waiter) -> Option<Waiter> {
        self.entries.insert(key, waiter)
    }

    pub(crate) fn remove(&mut self, key: WaitKey) -> Option<Waiter> {
        self.entries.remove(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn keys(&self) -> Vec<WaitKey> {
        self.entries.keys().copied().collect()
    }
}

impl std::fmt::Debug for WaiterTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaiterTable")
            .field("len", &self.entries.len())
            .finish()
    }
}
