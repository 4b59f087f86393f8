//! The per-thread driver: ready queue, waiting set, poller and clock.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::marker::PhantomData;
use std::os::fd::RawFd;
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::interest::{Interest, Readiness};
use crate::poller::Poller;
use crate::queue::ReadyQueue;
use crate::sys;
use crate::task::{context, JoinHandle, Task, TaskStatus, WakeReason};
use crate::time;
use crate::timeout::TimerHeap;
use crate::waiters::{WaitKey, Waiter, WaiterTable};

/// Size of the readiness batch one poll can deliver.
const MAX_EVENTS: usize = 256;

thread_local! {
    static CURRENT_LOOP: Cell<*const EventLoop> = const { Cell::new(ptr::null()) };
}

/// Runs `f` against the loop currently driving this thread, if any.
pub(crate) fn with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
    CURRENT_LOOP.with(|current| {
        let ptr = current.get();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: the pointer is set by `EventLoop::run` for exactly as
            // long as that call is on this thread's stack, and all callers
            // reach this from inside `run` (tasks only execute there).
            Some(f(unsafe { &*ptr }))
        }
    })
}

/// Cooperatively gives up the processor.
///
/// Inside a task this re-enqueues the task behind everything already in
/// its loop's ready queue and switches to the scheduler. Outside a task it
/// degrades to an OS-level yield.
pub fn yield_now() {
    let yielded = with_current(|event_loop| event_loop.yield_current()).is_some();
    if !yielded {
        thread::yield_now();
    }
}

/// A cooperative scheduler plus readiness event loop for one OS thread.
///
/// Tasks spawned on a loop are pinned to it for life. `run` drives them
/// until everything finished or [`EventLoop::stop`] is called; parking and
/// unparking happen through the socket adapter and the timer module.
pub struct EventLoop {
    poller: Poller,
    ready: RefCell<ReadyQueue>,
    waiters: RefCell<WaiterTable>,
    timeouts: RefCell<TimerHeap>,
    current: RefCell<Option<Rc<Task>>>,
    sched_ctx: UnsafeCell<context::Context>,
    running: Arc<AtomicBool>,
    now: Cell<u64>,
    next_timer_key: Cell<i32>,
    // Loop state is thread-confined; `Rc` and `RefCell` already make this
    // neither `Send` nor `Sync`, the marker spells it out.
    _pinned: PhantomData<*const ()>,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        let poller = Poller::new(MAX_EVENTS).map_err(Error::from_io)?;
        Ok(EventLoop {
            poller,
            ready: RefCell::new(ReadyQueue::default()),
            waiters: RefCell::new(WaiterTable::default()),
            timeouts: RefCell::new(TimerHeap::default()),
            current: RefCell::new(None),
            sched_ctx: UnsafeCell::new(context::Context::default()),
            running: Arc::new(AtomicBool::new(false)),
            now: Cell::new(time::now_ms()),
            next_timer_key: Cell::new(-2),
            _pinned: PhantomData,
        })
    }

    /// Runs `f` against the loop driving the calling thread.
    pub fn with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
        with_current(f)
    }

    /// Creates a task running `f` and schedules it at the back of the
    /// ready queue.
    pub fn spawn<F>(&self, f: F) -> JoinHandle
    where
        F: FnOnce() + 'static,
    {
        let task = Task::new(Box::new(f));
        debug!("task {} spawned", task.id());
        task.set_status(TaskStatus::Ready);
        self.ready.borrow_mut().enqueue(Rc::clone(&task));
        JoinHandle { task }
    }

    /// Drives tasks and I/O until no work remains or [`stop`] is called.
    ///
    /// When the loop winds down, any task still parked is woken with
    /// [`Error::Aborted`] and run to completion: nothing stays `Waiting`
    /// after `run` returns.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&self) -> Result<()> {
        let installed = CURRENT_LOOP.with(|current| {
            if current.get().is_null() {
                current.set(self as *const EventLoop);
                true
            } else {
                false
            }
        });
        if !installed {
            // Nested `run` on one thread would alias scheduler contexts.
            return Err(Error::InvalidParam);
        }
        let _reset = TlsGuard;

        self.running.store(true, Ordering::SeqCst);
        debug!("event loop starting");

        let mut events = Vec::with_capacity(MAX_EVENTS);
        let mut result = Ok(());
        while self.running.load(Ordering::SeqCst) && self.has_work() {
            if let Err(err) = self.tick(&mut events) {
                result = Err(err);
                break;
            }
        }

        self.shutdown_drain();
        debug!("event loop stopped");
        result
    }

    /// Asks the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.poller.wake();
    }

    /// A `Send + Sync` handle that stops the loop from another thread by
    /// flipping the running flag and breaking the poller out of its wait.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
            waker: self.poller.waker(),
        }
    }

    fn has_work(&self) -> bool {
        !self.ready.borrow().is_empty() || !self.waiters.borrow().is_empty()
    }

    /// One loop tick: poll, deliver readiness, expire deadlines, drain the
    /// ready queue.
    fn tick(&self, events: &mut Vec<(RawFd, Readiness)>) -> Result<()> {
        self.now.set(time::now_ms());

        let poll_timeout = if !self.ready.borrow().is_empty() {
            Some(Duration::ZERO)
        } else {
            self.timeouts
                .borrow()
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(self.now.get())))
        };

        self.poller
            .wait(events, poll_timeout)
            .map_err(Error::from_io)?;

        // Readiness is delivered before deadlines of the same tick.
        for (fd, readiness) in events.drain(..) {
            trace!("fd {} ready: {:?}", fd, readiness);
            self.wake_with_reason(WaitKey::fd(fd), WakeReason::Ready);
        }

        self.now.set(time::now_ms());
        loop {
            let expired = match self.timeouts.borrow().peek() {
                Some((key, deadline)) if deadline <= self.now.get() => Some(key),
                _ => None,
            };
            let Some(key) = expired else { break };
            self.timeouts.borrow_mut().pop();
            self.wake_with_reason(key, WakeReason::Timeout);
        }

        // Drain fully before the next poll; tasks enqueued while draining
        // (spawns, yields, wakes from `signal_fd`) run in this same tick.
        loop {
            let task = self.ready.borrow_mut().dequeue();
            let Some(task) = task else { break };
            self.run_task(task);
        }
        Ok(())
    }

    /// Unparks whatever waits on `key`, recording `reason`. All three
    /// registrations (registry, poller interest, heap entry) are gone
    /// before the task runs again.
    fn wake_with_reason(&self, key: WaitKey, reason: WakeReason) {
        let waiter = self.waiters.borrow_mut().remove(key);
        let Some(waiter) = waiter else {
            // Readiness for a descriptor nobody is parked on; level
            // triggered reporting makes this benign.
            trace!("no waiter for {:?}", key);
            return;
        };
        if let Some(fd) = key.as_fd() {
            if let Err(err) = self.poller.remove(fd) {
                warn!("deregistering fd {} failed: {}", fd, err);
            }
        }
        self.timeouts.borrow_mut().remove(key);
        trace!(
            "task {} woken: {:?} (was waiting for {:?}, deadline {:?})",
            waiter.task.id(),
            reason,
            waiter.interest,
            waiter.deadline
        );
        waiter.task.set_wake_reason(reason);
        waiter.task.set_status(TaskStatus::Ready);
        self.ready.borrow_mut().enqueue(waiter.task);
    }

    /// Context-switches into `task` until it yields, parks or finishes.
    fn run_task(&self, task: Rc<Task>) {
        task.set_status(TaskStatus::Running);
        *self.current.borrow_mut() = Some(Rc::clone(&task));
        // SAFETY: the scheduler context lives in `self`, the task context
        // in a task kept alive by the current slot; no RefCell borrow is
        // held across the switch.
        unsafe { context::switch(self.sched_ctx.get(), task.ctx_ptr()) }
        *self.current.borrow_mut() = None;
        if task.is_finished() {
            debug!("task {} finished", task.id());
            task.release_stack();
        }
    }

    /// Wakes every remaining waiter with `Aborted` and runs the ready
    /// queue dry, so no task outlives its loop in `Waiting`.
    fn shutdown_drain(&self) {
        loop {
            let keys = self.waiters.borrow().keys();
            for key in keys {
                self.wake_with_reason(key, WakeReason::Aborted);
            }
            let task = self.ready.borrow_mut().dequeue();
            match task {
                Some(task) => self.run_task(task),
                None if self.waiters.borrow().is_empty() => break,
                None => {}
            }
        }
    }

    // ---- park/unpark, used by the socket adapter and timers ----

    pub(crate) fn current_task(&self) -> Option<Rc<Task>> {
        self.current.borrow().clone()
    }

    pub(crate) fn sched_ctx_ptr(&self) -> *mut context::Context {
        self.sched_ctx.get()
    }

    /// Parks the current task until `fd` reports `interest`, the timeout
    /// passes, or the socket is torn down.
    pub(crate) fn wait_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<WakeReason> {
        let task = self.current_task().ok_or(Error::InvalidParam)?;
        self.poller.add(fd, interest).map_err(Error::from_io)?;

        let key = WaitKey::fd(fd);
        let deadline = timeout.map(|t| time::now_ms() + time::timeout_ms(t));
        {
            // A displaced waiter on this fd may have left a deadline
            // behind; an indefinite wait must never inherit it.
            let mut timeouts = self.timeouts.borrow_mut();
            timeouts.remove(key);
            if let Some(deadline) = deadline {
                timeouts.push(key, deadline);
            }
        }
        let displaced = self.waiters.borrow_mut().insert(
            key,
            Waiter {
                task: Rc::clone(&task),
                interest: Some(interest),
                deadline,
            },
        );
        if let Some(displaced) = displaced {
            // One waiter per fd; a second parker on the same descriptor
            // evicts the first rather than stranding it.
            warn!(
                "task {} displaced task {} waiting on fd {}",
                task.id(),
                displaced.task.id(),
                fd
            );
            displaced.task.set_wake_reason(WakeReason::Aborted);
            displaced.task.set_status(TaskStatus::Ready);
            self.ready.borrow_mut().enqueue(displaced.task);
        }

        trace!(
            "task {} parking on fd {} ({:?}, deadline {:?})",
            task.id(),
            fd,
            interest,
            deadline
        );
        task.set_status(TaskStatus::Waiting);
        self.park(&task);
        Ok(task.wake_reason())
    }

    /// Parks the current task on a deadline alone.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Result<WakeReason> {
        let task = self.current_task().ok_or(Error::InvalidParam)?;
        let key = self.alloc_timer_key();
        let deadline = time::now_ms() + time::timeout_ms(timeout);
        self.timeouts.borrow_mut().push(key, deadline);
        self.waiters.borrow_mut().insert(
            key,
            Waiter {
                task: Rc::clone(&task),
                interest: None,
                deadline: Some(deadline),
            },
        );
        trace!("task {} sleeping until {}", task.id(), deadline);
        task.set_status(TaskStatus::Waiting);
        self.park(&task);
        Ok(task.wake_reason())
    }

    /// Synchronously unparks whoever waits on `fd` as if the OS had
    /// reported readiness; the woken task's retry decides what that means.
    /// A no-op when nothing waits on `fd`.
    pub fn signal_fd(&self, fd: RawFd) {
        self.wake_with_reason(WaitKey::fd(fd), WakeReason::Ready);
    }

    /// Unparks whoever waits on `fd` with the cancellation verdict; the
    /// socket teardown path.
    pub(crate) fn cancel_fd(&self, fd: RawFd) {
        self.wake_with_reason(WaitKey::fd(fd), WakeReason::Aborted);
    }

    /// Re-enqueues the current task and switches to the scheduler.
    pub(crate) fn yield_current(&self) {
        let Some(task) = self.current_task() else {
            return;
        };
        task.set_status(TaskStatus::Ready);
        self.ready.borrow_mut().enqueue(Rc::clone(&task));
        self.park(&task);
    }

    fn park(&self, task: &Task) {
        // SAFETY: symmetric to `run_task`; no RefCell borrow held here.
        unsafe { context::switch(task.ctx_ptr(), self.sched_ctx.get()) }
    }

    fn alloc_timer_key(&self) -> WaitKey {
        let key = self.next_timer_key.get();
        // Negative keys only; wrap well clear of fd space.
        self.next_timer_key
            .set(if key == i32::MIN { -2 } else { key - 1 });
        WaitKey(key)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("ready", &self.ready.borrow().len())
            .field("waiting", &self.waiters.borrow().len())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

/// Clears the thread-local loop pointer when `run` unwinds or returns.
struct TlsGuard;

impl Drop for TlsGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|current| current.set(ptr::null()));
    }
}

/// Stops an [`EventLoop`] from any thread.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    waker: Arc<sys::Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            warn!("waking stopped loop failed: {}", err);
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
