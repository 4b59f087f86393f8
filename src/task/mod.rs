//! Threadlets: stackful cooperative units of execution.

pub(crate) mod context;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{error, trace};

use self::context::Context;
use crate::error::{Error, Result};
use crate::event_loop::{self, yield_now};
use crate::time;

/// Every task gets an unshared fixed-size stack.
const STACK_SIZE: usize = 64 * 1024;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum TaskStatus {
    Ready,
    Running,
    Waiting,
    Finished,
    Aborted,
}

/// The verdict attached to a task at the moment it is unparked.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum WakeReason {
    Ready,
    Timeout,
    Aborted,
}

/// A stackful task pinned to the loop that first scheduled it.
///
/// Shared by `Rc` between the loop (ready queue, waiter registry, current
/// slot) and the spawner's [`JoinHandle`]. All fields are interior-mutable
/// because every touch happens on the owning loop's thread.
pub(crate) struct Task {
    id: u64,
    entry: RefCell<Option<Box<dyn FnOnce()>>>,
    stack: RefCell<Option<Box<[u8]>>>,
    ctx: UnsafeCell<Context>,
    status: Cell<TaskStatus>,
    wake_reason: Cell<WakeReason>,
    finished: Cell<bool>,
}

impl Task {
    /// Allocates a task ready for its first resumption; not scheduled.
    pub(crate) fn new(entry: Box<dyn FnOnce()>) -> Rc<Task> {
        let mut stack = vec![0u8; STACK_SIZE].into_boxed_slice();
        let ctx = Context::seed(&mut stack, trampoline);
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        trace!("task {} created", id);
        Rc::new(Task {
            id,
            entry: RefCell::new(Some(entry)),
            stack: RefCell::new(Some(stack)),
            ctx: UnsafeCell::new(ctx),
            status: Cell::new(TaskStatus::Ready),
            wake_reason: Cell::new(WakeReason::Ready),
            finished: Cell::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.set(status);
    }

    pub(crate) fn wake_reason(&self) -> WakeReason {
        self.wake_reason.get()
    }

    pub(crate) fn set_wake_reason(&self, reason: WakeReason) {
        self.wake_reason.set(reason);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub(crate) fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    /// Frees the stack once the task can never run again.
    pub(crate) fn release_stack(&self) {
        self.stack.borrow_mut().take();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("status", &self.status.get())
            .field("finished", &self.finished.get())
            .finish()
    }
}

/// First (and only) frame on every task stack.
///
/// Runs the entry closure, marks the task finished and switches back to
/// the scheduler for good. The `Rc` taken from the current slot is dropped
/// before that final switch; the slot itself keeps the task alive until
/// the loop reclaims it, so the raw context pointers stay valid across the
/// switch.
extern "C" fn trampoline() -> ! {
    let switch_out = event_loop::with_current(|event_loop| {
        let task = match event_loop.current_task() {
            Some(task) => task,
            // A task context resumed without a driving loop; unrecoverable.
            None => process::abort(),
        };
        let entry = task.entry.borrow_mut().take();
        let mut ended = TaskStatus::Finished;
        if let Some(entry) = entry {
            if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
                error!("task {} panicked", task.id);
                ended = TaskStatus::Aborted;
            }
        }
        task.finished.set(true);
        task.status.set(ended);
        trace!("task {} ran to completion", task.id);
        (task.ctx_ptr(), event_loop.sched_ctx_ptr())
    });

    match switch_out {
        Some((task_ctx, sched_ctx)) => {
            // SAFETY: the loop's current slot still owns the task, so both
            // contexts outlive this switch; nothing borrows loop state here.
            unsafe { context::switch(task_ctx, sched_ctx) }
            // The scheduler never resumes a finished task.
            process::abort()
        }
        None => process::abort(),
    }
}

/// Handle to a spawned task.
///
/// Holding it is optional: a task runs to completion whether or not the
/// handle is kept. It is not `Send`; the task lives and dies with the loop
/// that spawned it.
pub struct JoinHandle {
    pub(crate) task: Rc<Task>,
}

impl JoinHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Parks the calling task until the target finishes, yielding between
    /// polls of the finished flag.
    ///
    /// Returns [`Error::Timeout`] when the deadline passes first,
    /// [`Error::InvalidParam`] when called from outside a task or on the
    /// calling task itself — joining is a task-level operation regardless
    /// of whether the target already finished.
    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| time::now_ms() + time::timeout_ms(t));
        loop {
            let current = event_loop::with_current(|el| el.current_task().map(|t| t.id()));
            match current {
                Some(Some(id)) if id == self.task.id() => return Err(Error::InvalidParam),
                Some(Some(_)) => {}
                _ => return Err(Error::InvalidParam),
            }
            if self.task.is_finished() {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if time::now_ms() >= deadline {
                    return Err(Error::Timeout);
                }
            }
            yield_now();
        }
    }
}

impl fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task.id())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}
