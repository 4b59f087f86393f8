use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use threadlet::{yield_now, Error, EventLoop};

mod util;
use util::init;

#[test]
fn run_with_no_tasks_returns_immediately() {
    init();
    let event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();
}

#[test]
fn tasks_run_in_spawn_order() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let order = Rc::new(Cell::new(0u32));

    for expected in 0..4 {
        let order = Rc::clone(&order);
        event_loop.spawn(move || {
            assert_eq!(order.get(), expected);
            order.set(expected + 1);
        });
    }

    event_loop.run().unwrap();
    assert_eq!(order.get(), 4);
}

#[test]
fn yield_interleaves_tasks() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let trace = Rc::new(Cell::new(0u32));

    let a = Rc::clone(&trace);
    event_loop.spawn(move || {
        a.set(a.get() * 10 + 1);
        yield_now();
        a.set(a.get() * 10 + 3);
    });
    let b = Rc::clone(&trace);
    event_loop.spawn(move || {
        b.set(b.get() * 10 + 2);
        yield_now();
        b.set(b.get() * 10 + 4);
    });

    event_loop.run().unwrap();
    // a, b, a again, b again: strict FIFO interleaving.
    assert_eq!(trace.get(), 1234);
}

#[test]
fn join_waits_for_completion() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let target = event_loop.spawn(|| {
        threadlet::timer::sleep_ms(30).unwrap();
    });

    let joined = Rc::new(Cell::new(false));
    let saw = Rc::clone(&joined);
    event_loop.spawn(move || {
        target.join(Some(Duration::from_secs(5))).unwrap();
        assert!(target.is_finished());
        saw.set(true);
    });

    event_loop.run().unwrap();
    assert!(joined.get());
}

#[test]
fn join_times_out_on_a_slow_task() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let target = event_loop.spawn(|| {
        threadlet::timer::sleep_ms(300).unwrap();
    });

    let verdict = Rc::new(Cell::new(false));
    let saw = Rc::clone(&verdict);
    event_loop.spawn(move || {
        let err = target.join(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        saw.set(true);
    });

    event_loop.run().unwrap();
    assert!(verdict.get());
}

#[test]
fn join_outside_a_task_is_refused() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let handle = event_loop.spawn(|| {});
    let err = handle.join(Some(Duration::from_millis(10))).unwrap_err();
    assert!(matches!(err, Error::InvalidParam));

    event_loop.run().unwrap();
    assert!(handle.is_finished());

    // Still refused once the target has finished; only `is_finished` is
    // answerable from outside a task.
    let err = handle.join(None).unwrap_err();
    assert!(matches!(err, Error::InvalidParam));
}

#[test]
fn a_panicking_task_does_not_take_the_loop_down() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let survivor = Rc::new(Cell::new(false));

    event_loop.spawn(|| panic!("task blew up"));
    let saw = Rc::clone(&survivor);
    event_loop.spawn(move || saw.set(true));

    event_loop.run().unwrap();
    assert!(survivor.get());
}

#[test]
fn spawning_from_a_task_schedules_behind_the_queue() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let done = Rc::new(Cell::new(false));

    let saw = Rc::clone(&done);
    event_loop.spawn(move || {
        let inner_done = Rc::clone(&saw);
        EventLoop::with_current(move |el| {
            el.spawn(move || inner_done.set(true));
        })
        .unwrap();
    });

    event_loop.run().unwrap();
    assert!(done.get());
}

#[test]
fn nested_run_is_refused() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let verdict = Rc::new(Cell::new(false));

    let saw = Rc::clone(&verdict);
    event_loop.spawn(move || {
        let inner = EventLoop::new().unwrap();
        let err = inner.run().unwrap_err();
        assert!(matches!(err, Error::InvalidParam));
        saw.set(true);
    });

    event_loop.run().unwrap();
    assert!(verdict.get());
}

#[test]
fn stop_handle_aborts_parked_tasks_from_another_thread() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let aborted = Rc::new(Cell::new(false));

    let saw = Rc::clone(&aborted);
    event_loop.spawn(move || {
        // Nothing will ever make this deadline-free sleep expire.
        let err = threadlet::timer::sleep(Duration::from_secs(3600)).unwrap_err();
        assert!(matches!(err, Error::Aborted));
        saw.set(true);
    });

    let stopper = event_loop.stop_handle();
    let thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        stopper.stop();
    });

    event_loop.run().unwrap();
    thread.join().unwrap();
    assert!(aborted.get());
}
