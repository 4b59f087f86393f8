use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use threadlet::shared;

mod util;
use util::init;

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// The process-wide table is genuinely process-wide, so everything touching
// it lives in this one test.
#[test]
fn process_wide_table_hands_values_between_threads() {
    init();

    shared::init(16).unwrap();
    // A second init refuses.
    assert!(shared::init(16).is_err());

    let drops = Arc::new(AtomicUsize::new(0));
    let handle = shared::alloc(DropCounter(Arc::clone(&drops))).unwrap();
    let raw = handle.into_raw();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(move || {
                // Handles travel as plain integers.
                let handle = shared::Handle::from_raw(raw);
                let guard = shared::acquire::<DropCounter>(handle, Some(Duration::from_secs(1)))
                    .expect("handle should be live");
                let _ = &*guard;
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(shared::release(handle));
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    // Stale after the last release.
    assert!(shared::acquire::<DropCounter>(handle, None).is_none());
    assert!(!shared::release(handle));

    // Replace-then-release on a fresh slot.
    let numbers = shared::alloc(1_u64).unwrap();
    shared::replace(numbers, 2_u64, None).unwrap();
    assert_eq!(*shared::acquire::<u64>(numbers, None).unwrap(), 2);
    assert!(shared::release(numbers));

    shared::shutdown();
    assert!(shared::alloc(3_u64).is_err());
    shared::init(16).unwrap();
    shared::shutdown();
}
