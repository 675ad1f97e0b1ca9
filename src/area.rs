//! Per-thread mutator areas.
//!
//! An area carries a worker's occupancy credit and its `busy` flag. The flag
//! is the only thing the resize coordinator reads to decide whether any
//! mutator is still inside the container, so it is stored with `SeqCst` to
//! pair with the coordinator's `resizing` handshake.

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub(crate) struct Area {
    /// Occupancy credit drawn from the container-wide counter. Only the
    /// owning worker moves it, so plain relaxed loads and stores suffice.
    pub(crate) reserved: AtomicU32,
    pub(crate) busy: AtomicBool,
}

impl Area {
    fn new() -> Self {
        Self {
            reserved: AtomicU32::new(0),
            busy: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn reserved(&self) -> u32 {
        self.reserved.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_reserved(&self, n: u32) {
        self.reserved.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn spend_one(&self) {
        self.reserved.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn take_reserved(&self) -> u32 {
        self.reserved.swap(0, Ordering::Relaxed)
    }
}

/// The fixed set of areas, one per declared worker, plus the free chain that
/// hands out area indices. Indices are reused aggressively so a map created
/// for `n` workers never allocates an area past index `n - 1`.
pub(crate) struct AreaSet {
    slots: Box<[CachePadded<Area>]>,
    free: Mutex<Vec<u32>>,
}

impl AreaSet {
    pub(crate) fn new(workers: usize) -> Self {
        let slots = (0..workers).map(|_| CachePadded::new(Area::new())).collect();
        let free = Mutex::new((0..workers as u32).rev().collect());
        Self { slots, free }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn claim(&self) -> usize {
        self.free
            .lock()
            .pop()
            .expect("more concurrent workers than the map was created for") as usize
    }

    pub(crate) fn release(&self, idx: usize) {
        let area = self.get(idx);
        debug_assert_eq!(area.reserved(), 0);
        debug_assert!(!area.is_busy());
        self.free.lock().push(idx as u32);
    }

    #[inline]
    pub(crate) fn get(&self, idx: usize) -> &Area {
        &self.slots[idx]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Area> {
        self.slots.iter().map(|padded| &**padded)
    }
}

#[cfg(test)]
mod tests {
    use super::AreaSet;

    #[test]
    fn indices_are_unique_and_reused() {
        let set = AreaSet::new(2);
        let a = set.claim();
        let b = set.claim();
        assert_ne!(a, b);
        set.release(a);
        assert_eq!(set.claim(), a);
    }

    #[test]
    #[should_panic(expected = "more concurrent workers")]
    fn exhaustion_panics() {
        let set = AreaSet::new(1);
        let _held = set.claim();
        set.claim();
    }
}
