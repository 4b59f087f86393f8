//! The process-wide handle table for sharing heap values across threads.
//!
//! Tasks on different loops never touch each other's loop state; values
//! travel between them as opaque [`Handle`]s into this table. A handle
//! encodes a slot index and the slot's generation at allocation time;
//! freeing a slot bumps its generation, so every handle minted before the
//! free is observably stale afterwards.
//!
//! Slots are pinned with an atomic refcount and their contents guarded by
//! a per-slot mutex; the table-wide lock is only taken to grow the slot
//! array. Guards must never be held across a yield: a parked task would
//! hold the slot lock against every other thread.

use std::any::Any;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::error::{Error, Result};

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GENERATION_SHIFT: u32 = INDEX_BITS;
const GENERATION_MASK: u64 = 0xff;

/// The smallest table ever allocated; growth doubles from here.
const MIN_SLOTS: usize = 64;
/// Hard ceiling implied by the 24-bit index field.
const MAX_SLOTS: usize = 1 << INDEX_BITS;

/// An opaque, copyable reference to a slot in a [`HandleTable`].
///
/// Layout: low 24 bits slot index, next 8 bits generation, upper 32 bits
/// reserved (zero). A handle is live while the slot is allocated and the
/// generations still match.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    fn encode(index: usize, generation: u8) -> Handle {
        Handle(index as u64 | (u64::from(generation) << GENERATION_SHIFT))
    }

    fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    fn generation(self) -> u8 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u8
    }

    /// The raw 64-bit value, e.g. for embedding in a wire message.
    pub fn into_raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Handle {
        Handle(raw)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

type SlotValue = Option<Box<dyn Any + Send>>;

struct Slot {
    value: Arc<Mutex<SlotValue>>,
    refs: AtomicU32,
    generation: AtomicU8,
    in_use: AtomicBool,
}

impl Slot {
    fn new() -> Arc<Slot> {
        Arc::new(Slot {
            value: Arc::new(Mutex::new(None)),
            refs: AtomicU32::new(0),
            generation: AtomicU8::new(0),
            in_use: AtomicBool::new(false),
        })
    }
}

/// A generation-tagged, reference-counted table of type-erased values.
pub struct HandleTable {
    slots: RwLock<Vec<Arc<Slot>>>,
}

impl HandleTable {
    /// A table starting with room for `capacity` values, rounded up to a
    /// power of two. It grows by doubling when full.
    pub fn with_capacity(capacity: usize) -> HandleTable {
        let capacity = capacity
            .next_power_of_two()
            .clamp(MIN_SLOTS, MAX_SLOTS);
        let slots = (0..capacity).map(|_| Slot::new()).collect();
        HandleTable {
            slots: RwLock::new(slots),
        }
    }

    /// Stores `value` in a free slot with a reference count of one.
    ///
    /// The returned handle (or a copy of it) must eventually be passed to
    /// [`release`] to run the value's destructor.
    ///
    /// [`release`]: HandleTable::release
    pub fn alloc<T: Any + Send>(&self, value: T) -> Result<Handle> {
        let mut boxed: Box<dyn Any + Send> = Box::new(value);
        loop {
            boxed = {
                let slots = self.slots.read();
                match Self::try_insert(&slots, boxed) {
                    Ok(handle) => return Ok(handle),
                    Err(boxed) => boxed,
                }
            };
            self.grow()?;
        }
    }

    fn try_insert(
        slots: &[Arc<Slot>],
        boxed: Box<dyn Any + Send>,
    ) -> std::result::Result<Handle, Box<dyn Any + Send>> {
        for (index, slot) in slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // The slot is ours: nobody can pin it while `refs` is 0.
                *slot.value.lock() = Some(boxed);
                let generation = slot.generation.load(Ordering::Acquire);
                slot.refs.store(1, Ordering::Release);
                return Ok(Handle::encode(index, generation));
            }
        }
        Err(boxed)
    }

    fn grow(&self) -> Result<()> {
        let mut slots = self.slots.write();
        let current = slots.len();
        if current >= MAX_SLOTS {
            return Err(Error::NoResources);
        }
        let target = (current * 2).clamp(MIN_SLOTS, MAX_SLOTS);
        debug!("handle table growing from {} to {} slots", current, target);
        slots.extend((current..target).map(|_| Slot::new()));
        Ok(())
    }

    /// Pins the value behind `handle` and locks its slot, waiting at most
    /// `timeout` for the lock.
    ///
    /// `None` means the handle is stale, the value's type is not `T`, or
    /// the lock could not be taken in time; in every such case the
    /// refcount is left as it was found.
    pub fn acquire<T: Any + Send>(
        &self,
        handle: Handle,
        timeout: Option<Duration>,
    ) -> Option<Guard<T>> {
        let slot = self.slot(handle.index())?;
        if slot.generation.load(Ordering::Acquire) != handle.generation() {
            return None;
        }

        // Pin: increment the refcount only while it is nonzero, so a slot
        // being freed cannot be revived.
        let mut refs = slot.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return None;
            }
            match slot.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => refs = current,
            }
        }
        // The slot may have been freed and reallocated between the
        // generation check and the pin; re-check now that it cannot move.
        if slot.generation.load(Ordering::Acquire) != handle.generation() {
            Self::release_ref(&slot);
            return None;
        }

        let guard = match timeout {
            Some(timeout) => match slot.value.try_lock_arc_for(timeout) {
                Some(guard) => guard,
                None => {
                    Self::release_ref(&slot);
                    return None;
                }
            },
            None => slot.value.lock_arc(),
        };

        let ptr = guard
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .map(NonNull::from);
        match ptr {
            Some(ptr) => Some(Guard {
                guard: Some(guard),
                slot,
                ptr,
            }),
            None => {
                drop(guard);
                Self::release_ref(&slot);
                None
            }
        }
    }

    /// Drops one reference to `handle`'s slot; the last drop runs the
    /// value's destructor and retires the generation.
    ///
    /// Returns false for a stale handle. Only call this for a reference
    /// actually owned (the one from [`alloc`], or one taken over from
    /// another thread); guards return theirs automatically.
    ///
    /// [`alloc`]: HandleTable::alloc
    pub fn release(&self, handle: Handle) -> bool {
        let Some(slot) = self.slot(handle.index()) else {
            return false;
        };
        // The caller owns a reference, so the slot cannot be freed out
        // from under this check.
        if slot.generation.load(Ordering::Acquire) != handle.generation() {
            return false;
        }
        Self::release_ref(&slot);
        true
    }

    /// Swaps the value behind `handle` for `value` under the slot lock;
    /// the previous value's destructor runs. The storage-resizing
    /// operation of the table.
    pub fn replace<T: Any + Send>(
        &self,
        handle: Handle,
        value: T,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut guard = self.acquire_raw(handle, timeout)?;
        *guard = Some(Box::new(value));
        drop(guard);
        let Some(slot) = self.slot(handle.index()) else {
            return Err(Error::InvalidParam);
        };
        Self::release_ref(&slot);
        Ok(())
    }

    /// The untyped half of [`acquire`], used by `replace`. The caller must
    /// pair it with a `release_ref`.
    ///
    /// [`acquire`]: HandleTable::acquire
    fn acquire_raw(
        &self,
        handle: Handle,
        timeout: Option<Duration>,
    ) -> Result<ArcMutexGuard<RawMutex, SlotValue>> {
        let slot = self.slot(handle.index()).ok_or(Error::InvalidParam)?;
        if slot.generation.load(Ordering::Acquire) != handle.generation() {
            return Err(Error::InvalidParam);
        }
        let mut refs = slot.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return Err(Error::InvalidParam);
            }
            match slot.refs.compare_exchange_weak(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => refs = current,
            }
        }
        if slot.generation.load(Ordering::Acquire) != handle.generation() {
            Self::release_ref(&slot);
            return Err(Error::InvalidParam);
        }
        let guard = match timeout {
            Some(timeout) => slot.value.try_lock_arc_for(timeout).ok_or_else(|| {
                Self::release_ref(&slot);
                Error::Timeout
            })?,
            None => slot.value.lock_arc(),
        };
        Ok(guard)
    }

    fn release_ref(slot: &Arc<Slot>) {
        if slot.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last reference: destructor runs exactly once, then the
        // generation retires every outstanding handle before the slot is
        // offered for reuse.
        let dropped = slot.value.lock().take();
        drop(dropped);
        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.in_use.store(false, Ordering::Release);
    }

    fn slot(&self, index: usize) -> Option<Arc<Slot>> {
        self.slots.read().get(index).cloned()
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("slots", &self.slots.read().len())
            .finish()
    }
}

/// A pinned, locked view of a value in the table.
///
/// Dereferences to the stored value; dropping it unlocks the slot and
/// returns the reference taken by `acquire`. Do not hold one across a
/// yield.
pub struct Guard<T> {
    // Declared first only for reading order; Drop does the real
    // sequencing: unlock, then unpin.
    guard: Option<ArcMutexGuard<RawMutex, SlotValue>>,
    slot: Arc<Slot>,
    ptr: NonNull<T>,
}

impl<T> std::ops::Deref for Guard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: `ptr` points into the boxed value, which cannot be
        // replaced or dropped while the slot lock and pin are held.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for Guard<T> {
    fn drop(&mut self) {
        self.guard.take();
        HandleTable::release_ref(&self.slot);
    }
}

impl<T> fmt::Debug for Guard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").finish_non_exhaustive()
    }
}

// ---- the process-wide instance ----

static GLOBAL: RwLock<Option<Arc<HandleTable>>> = RwLock::new(None);

/// Creates the process-wide table. Fails with [`Error::InvalidParam`] if
/// it already exists.
pub fn init(capacity: usize) -> Result<()> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(Error::InvalidParam);
    }
    *global = Some(Arc::new(HandleTable::with_capacity(capacity)));
    Ok(())
}

/// Tears the process-wide table down, dropping every still-stored value.
/// Outstanding guards stay valid; their slots are simply unreachable for
/// new lookups.
pub fn shutdown() {
    *GLOBAL.write() = None;
}

fn global() -> Result<Arc<HandleTable>> {
    GLOBAL.read().as_ref().cloned().ok_or(Error::InvalidParam)
}

/// [`HandleTable::alloc`] on the process-wide table.
pub fn alloc<T: Any + Send>(value: T) -> Result<Handle> {
    global()?.alloc(value)
}

/// [`HandleTable::acquire`] on the process-wide table.
pub fn acquire<T: Any + Send>(handle: Handle, timeout: Option<Duration>) -> Option<Guard<T>> {
    global().ok()?.acquire(handle, timeout)
}

/// [`HandleTable::release`] on the process-wide table.
pub fn release(handle: Handle) -> bool {
    global().map(|table| table.release(handle)).unwrap_or(false)
}

/// [`HandleTable::replace`] on the process-wide table.
pub fn replace<T: Any + Send>(handle: Handle, value: T, timeout: Option<Duration>) -> Result<()> {
    global()?.replace(handle, value, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn alloc_acquire_release_round_trip() {
        let table = HandleTable::with_capacity(4);
        let handle = table.alloc(41_u32).unwrap();

        {
            let guard = table.acquire::<u32>(handle, None).unwrap();
            assert_eq!(*guard, 41);
        }

        assert!(table.release(handle));
        assert!(table.acquire::<u32>(handle, None).is_none());
    }

    #[test]
    fn destructor_runs_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let table = HandleTable::with_capacity(4);
        let handle = table.alloc(DropCounter(Arc::clone(&drops))).unwrap();

        for _ in 0..3 {
            let guard = table.acquire::<DropCounter>(handle, None).unwrap();
            drop(guard);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert!(table.release(handle));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        // A second release sees a stale generation.
        assert!(!table.release(handle));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_generation_fails_acquire() {
        let table = HandleTable::with_capacity(4);
        let first = table.alloc(1_u8).unwrap();
        assert!(table.release(first));

        // Reuse the slot until the old handle's index is reallocated.
        let mut reused = None;
        for _ in 0..MIN_SLOTS {
            let handle = table.alloc(2_u8).unwrap();
            if handle.index() == first.index() {
                reused = Some(handle);
                break;
            }
        }
        let reused = reused.expect("slot not reused");

        assert!(table.acquire::<u8>(first, None).is_none());
        assert_eq!(*table.acquire::<u8>(reused, None).unwrap(), 2);
    }

    #[test]
    fn wrong_type_fails_without_leaking_the_pin() {
        let table = HandleTable::with_capacity(4);
        let handle = table.alloc(7_u32).unwrap();

        assert!(table.acquire::<String>(handle, None).is_none());
        // The failed acquire returned its pin: release still frees.
        assert!(table.release(handle));
        assert!(table.acquire::<u32>(handle, None).is_none());
    }

    #[test]
    fn replace_swaps_and_drops_the_old_value() {
        let drops = Arc::new(AtomicUsize::new(0));
        let table = HandleTable::with_capacity(4);
        let handle = table.alloc(DropCounter(Arc::clone(&drops))).unwrap();

        table.replace(handle, 9_u64, None).unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(*table.acquire::<u64>(handle, None).unwrap(), 9);

        assert!(table.release(handle));
    }

    #[test]
    fn grows_past_initial_capacity() {
        let table = HandleTable::with_capacity(1);
        let handles: Vec<_> = (0..MIN_SLOTS + 8)
            .map(|i| table.alloc(i as u64).unwrap())
            .collect();
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(*table.acquire::<u64>(*handle, None).unwrap(), i as u64);
            assert!(table.release(*handle));
        }
    }

    #[test]
    fn acquire_times_out_on_a_held_lock() {
        let table = Arc::new(HandleTable::with_capacity(4));
        let handle = table.alloc(1_u32).unwrap();

        let guard = table.acquire::<u32>(handle, None).unwrap();
        let contender = Arc::clone(&table);
        let waited = std::thread::spawn(move || {
            contender
                .acquire::<u32>(handle, Some(Duration::from_millis(50)))
                .is_none()
        })
        .join()
        .unwrap();
        assert!(waited);
        drop(guard);

        assert!(table.release(handle));
    }

    #[test]
    fn handles_cross_threads() {
        let table = Arc::new(HandleTable::with_capacity(4));
        let handle = table.alloc(String::from("shared")).unwrap();

        let remote = Arc::clone(&table);
        std::thread::spawn(move || {
            let guard = remote.acquire::<String>(handle, None).unwrap();
            assert_eq!(&*guard, "shared");
            drop(guard);
            // This thread takes over the owning reference.
            assert!(remote.release(handle));
        })
        .join()
        .unwrap();

        assert!(table.acquire::<String>(handle, None).is_none());
    }
}
