//! Task-level timers: parked sleeps and repeating intervals.
//!
//! Both are plain timeout-only waits on the owning loop; no descriptor is
//! involved and nothing but the clock can wake them early (apart from the
//! loop winding down, which reports [`Error::Aborted`]).

use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop;
use crate::task::WakeReason;
use crate::time;

/// Parks the calling task for `ms` milliseconds.
///
/// Zero parks until the next loop iteration's deadline sweep, which makes
/// it a slightly stronger `yield_now`: everything already ready runs
/// first. Fails with [`Error::InvalidParam`] outside a task.
pub fn sleep_ms(ms: u64) -> Result<()> {
    sleep(Duration::from_millis(ms))
}

/// [`sleep_ms`] with a `Duration`.
pub fn sleep(duration: Duration) -> Result<()> {
    let reason = event_loop::with_current(|event_loop| event_loop.wait_timeout(duration))
        .ok_or(Error::InvalidParam)??;
    match reason {
        // A sleep's deadline firing is its success.
        WakeReason::Timeout | WakeReason::Ready => Ok(()),
        WakeReason::Aborted => Err(Error::Aborted),
    }
}

/// A repeating timer that does not drift: each tick sleeps to an absolute
/// deadline advanced by the period, not by "now plus period".
///
/// ```no_run
/// use threadlet::timer::Interval;
/// use threadlet::EventLoop;
///
/// let event_loop = EventLoop::new().unwrap();
/// event_loop.spawn(|| {
///     let mut interval = Interval::every_ms(100);
///     for _ in 0..5 {
///         interval.tick().unwrap();
///         // runs once per 100ms, give or take scheduling delay
///     }
/// });
/// event_loop.run().unwrap();
/// ```
#[derive(Debug)]
pub struct Interval {
    period_ms: u64,
    next_deadline: u64,
}

impl Interval {
    pub fn every_ms(period_ms: u64) -> Interval {
        Interval {
            period_ms: period_ms.max(1),
            next_deadline: time::now_ms(),
        }
    }

    pub fn every(period: Duration) -> Interval {
        Interval::every_ms(time::timeout_ms(period))
    }

    /// Parks until the next period boundary.
    ///
    /// A tick that is already overdue (the task lagged more than a whole
    /// period) returns immediately and re-anchors, rather than firing a
    /// burst of catch-up ticks.
    pub fn tick(&mut self) -> Result<()> {
        self.next_deadline += self.period_ms;
        let now = time::now_ms();
        if self.next_deadline <= now {
            self.next_deadline = now;
            return Ok(());
        }
        sleep(Duration::from_millis(self.next_deadline - now))
    }
}
