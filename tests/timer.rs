use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use threadlet::time::now_ms;
use threadlet::timer::{sleep_ms, Interval};
use threadlet::EventLoop;

mod util;
use util::init;

#[test]
fn repeating_interval_fires_on_schedule() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let wakes = Rc::new(RefCell::new(Vec::new()));

    let recorded = Rc::clone(&wakes);
    event_loop.spawn(move || {
        let start = now_ms();
        let mut interval = Interval::every_ms(100);
        for _ in 0..5 {
            interval.tick().unwrap();
            recorded.borrow_mut().push(now_ms() - start);
        }
    });

    event_loop.run().unwrap();

    let wakes = wakes.borrow();
    assert_eq!(wakes.len(), 5);
    assert!(wakes[0] >= 95, "first wake too early: {}ms", wakes[0]);
    // Allow generous scheduling slack above the ideal 500ms.
    assert!(wakes[4] <= 900, "last wake too late: {}ms", wakes[4]);
    for pair in wakes.windows(2) {
        assert!(
            pair[1] >= pair[0] + 95,
            "wakes closer than a period: {:?}",
            *wakes
        );
    }
}

#[test]
fn parked_sleepers_overlap() {
    init();
    let event_loop = EventLoop::new().unwrap();

    let start = now_ms();
    for _ in 0..2 {
        event_loop.spawn(|| sleep_ms(50).unwrap());
    }
    event_loop.run().unwrap();

    let elapsed = now_ms() - start;
    // Both sleeps park on the timeout heap, so they wait concurrently.
    assert!(elapsed >= 45, "finished early: {}ms", elapsed);
    assert!(elapsed < 150, "sleeps serialised: {}ms", elapsed);
}

#[test]
fn blocking_computation_serialises_cooperatively() {
    init();
    let event_loop = EventLoop::new().unwrap();

    let start = now_ms();
    for _ in 0..2 {
        // Ordinary computation never suspends; each task occupies the loop
        // for its full 50ms.
        event_loop.spawn(|| std::thread::sleep(Duration::from_millis(50)));
    }
    event_loop.run().unwrap();

    let elapsed = now_ms() - start;
    assert!(elapsed >= 95, "tasks ran in parallel: {}ms", elapsed);
}

#[test]
fn zero_sleep_runs_ready_work_first() {
    init();
    let event_loop = EventLoop::new().unwrap();
    let order = Rc::new(Cell::new(0u32));

    let first = Rc::clone(&order);
    event_loop.spawn(move || {
        sleep_ms(0).unwrap();
        // The other task ran while this one sat on the deadline sweep.
        assert_eq!(first.get(), 1);
        first.set(2);
    });
    let second = Rc::clone(&order);
    event_loop.spawn(move || {
        assert_eq!(second.get(), 0);
        second.set(1);
    });

    event_loop.run().unwrap();
    assert_eq!(order.get(), 2);
}

#[test]
fn sleep_outside_a_task_is_refused() {
    init();
    assert!(matches!(
        sleep_ms(1),
        Err(threadlet::Error::InvalidParam)
    ));
}
