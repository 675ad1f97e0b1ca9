//! The bucket array: Robin Hood open addressing over per-bucket spinlocks.
//!
//! Probe walks hold at most two bucket locks at a time, acquired
//! hand-over-hand in probe order so that a walker never observes a gap
//! another mutator is rewriting.

use crate::lock::{SpinGuard, SpinLock};
use crate::KeyRef;
use std::alloc::{alloc, Layout};
use std::mem;
use std::ptr;

/// Heap record for one entry. The key bytes are copied in on insert and
/// owned by the record until delete, overwrite never replaces them.
pub(crate) struct Kv<V> {
    pub(crate) value: V,
    pub(crate) key: Box<[u8]>,
}

/// The lock-protected portion of a bucket.
///
/// `psl` is the probe sequence length: the forward distance (wrapping) from
/// the entry's ideal bucket `hash & mask` to the bucket it actually sits in.
/// `hash` and `psl` are meaningless while `kv` is `None`.
pub(crate) struct Slot<V> {
    pub(crate) hash: u32,
    pub(crate) psl: u32,
    pub(crate) kv: Option<Box<Kv<V>>>,
}

pub(crate) type Bucket<V> = SpinLock<Slot<V>>;

/// Result of a probe: the terminal bucket is still locked and the caller is
/// obliged to release it, either by dropping the guard or by feeding it to
/// [`Table::cascade_insert`] / [`Table::backward_shift`].
pub(crate) struct Probe<'a, V> {
    pub(crate) found: bool,
    pub(crate) idx: usize,
    pub(crate) psl: u32,
    pub(crate) guard: SpinGuard<'a, Slot<V>>,
}

pub(crate) struct Table<V> {
    buckets: Box<[Bucket<V>]>,
}

#[cfg(test)]
thread_local! {
    /// Makes the calling thread's next table allocation fail. Thread-local
    /// so parallel tests cannot steal each other's injected failure.
    pub(crate) static FAIL_NEXT_TABLE_ALLOC: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

impl<V> Table<V> {
    /// Allocates a table of `len` empty buckets, `len` a power of two.
    /// Returns `None` when the allocator refuses, the caller decides whether
    /// that is fatal.
    pub(crate) fn try_new(len: usize) -> Option<Box<Table<V>>> {
        debug_assert!(len.is_power_of_two());

        #[cfg(test)]
        if FAIL_NEXT_TABLE_ALLOC.with(|fail| fail.replace(false)) {
            return None;
        }

        let layout = Layout::array::<Bucket<V>>(len).ok()?;
        // SAFETY: `len` is nonzero, so `layout` has nonzero size.
        let head = unsafe { alloc(layout) } as *mut Bucket<V>;
        if head.is_null() {
            return None;
        }
        for offset in 0..len {
            // SAFETY: `head` spans `len` buckets and each one is written
            // exactly once before anything reads it.
            unsafe {
                head.add(offset).write(SpinLock::new(Slot {
                    hash: 0,
                    psl: 0,
                    kv: None,
                }));
            }
        }
        // SAFETY: `head` was allocated with exactly the array layout that
        // `Box<[Bucket<V>]>` deallocates with.
        let buckets = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(head, len)) };
        Some(Box::new(Table { buckets }))
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    #[inline]
    pub(crate) fn bucket(&self, idx: usize) -> &Bucket<V> {
        &self.buckets[idx]
    }

    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = &mut Slot<V>> + '_ {
        self.buckets.iter_mut().map(|bucket| bucket.get_mut())
    }

    /// Robin Hood linear probe. Locks the ideal bucket, then walks forward
    /// hand-over-hand until it hits the entry, an empty slot, or a slot whose
    /// occupant is closer to its ideal position than we are to ours (no later
    /// slot can hold the key once that happens).
    pub(crate) fn find<'t>(&'t self, key: &KeyRef<'_>) -> Probe<'t, V> {
        let mask = self.mask();
        let mut idx = key.hash as usize & mask;
        let mut psl = 0u32;
        let mut guard = self.buckets[idx].lock();

        loop {
            if guard.kv.is_none() || guard.psl < psl {
                return Probe {
                    found: false,
                    idx,
                    psl,
                    guard,
                };
            }
            if guard.hash == key.hash {
                if let Some(kv) = &guard.kv {
                    if *kv.key == *key.bytes {
                        return Probe {
                            found: true,
                            idx,
                            psl,
                            guard,
                        };
                    }
                }
            }

            psl += 1;
            idx = (idx + 1) & mask;
            let next = self.buckets[idx].lock();
            guard = next;
        }
    }

    /// Cascading forward insertion: places `record` at the locked bucket the
    /// probe ended on, then keeps pushing the displaced record rightwards,
    /// stealing any slot whose occupant has a strictly smaller psl, until a
    /// displaced record lands in an empty bucket.
    pub(crate) fn cascade_insert<'a>(
        &'a self,
        mut idx: usize,
        mut guard: SpinGuard<'a, Slot<V>>,
        mut record: Slot<V>,
    ) {
        mem::swap(&mut *guard, &mut record);
        if record.kv.is_none() {
            return;
        }

        let mask = self.mask();
        loop {
            idx = (idx + 1) & mask;
            let next = self.buckets[idx].lock();
            guard = next;
            record.psl += 1;

            if guard.kv.is_none() {
                *guard = record;
                return;
            }
            if guard.psl < record.psl {
                mem::swap(&mut *guard, &mut record);
            }
        }
    }

    /// Backward shift after a delete: `guard` is the emptied bucket. Each
    /// successor with a nonzero psl moves one slot back (its psl decremented),
    /// carrying the hole forward until the run ends. Leaves no tombstones.
    pub(crate) fn backward_shift<'a>(&'a self, mut idx: usize, mut guard: SpinGuard<'a, Slot<V>>) {
        debug_assert!(guard.kv.is_none());
        let mask = self.mask();

        loop {
            let next_idx = (idx + 1) & mask;
            let mut next = self.buckets[next_idx].lock();
            if next.kv.is_none() || next.psl == 0 {
                return;
            }
            *guard = Slot {
                hash: next.hash,
                psl: next.psl - 1,
                kv: next.kv.take(),
            };
            guard = next;
            idx = next_idx;
        }
    }
}

#[cfg(test)]
impl<V> Table<V> {
    /// Walks the whole table and asserts the Robin Hood layout: every entry
    /// sits at `(hash + psl) & mask`, displacement grows by at most one per
    /// slot, and an entry behind an empty bucket is in its ideal spot.
    pub(crate) fn assert_layout(&self) {
        let len = self.len();
        let mask = self.mask();
        for idx in 0..len {
            let slot = self.buckets[idx].lock();
            let next = self.buckets[(idx + 1) & mask].lock();
            if slot.kv.is_some() {
                assert_eq!(
                    (slot.hash as usize + slot.psl as usize) & mask,
                    idx,
                    "entry at {idx} is displaced from its probe path"
                );
                if next.kv.is_some() {
                    assert!(
                        next.psl <= slot.psl + 1,
                        "psl climbs by more than one at {idx}"
                    );
                }
            } else if next.kv.is_some() {
                assert_eq!(next.psl, 0, "entry after a hole at {idx} is displaced");
            }
        }
    }

    pub(crate) fn live_entries(&self) -> usize {
        self.buckets
            .iter()
            .filter(|bucket| bucket.lock().kv.is_some())
            .count()
    }

    fn insert_for_test(&self, key: &KeyRef<'_>, value: V) {
        let probe = self.find(key);
        assert!(!probe.found);
        let kv = Box::new(Kv {
            value,
            key: key.bytes.into(),
        });
        self.cascade_insert(
            probe.idx,
            probe.guard,
            Slot {
                hash: key.hash,
                psl: probe.psl,
                kv: Some(kv),
            },
        );
    }

    fn delete_for_test(&self, key: &KeyRef<'_>) -> Option<V> {
        let mut probe = self.find(key);
        if !probe.found {
            return None;
        }
        let kv = probe.guard.kv.take()?;
        self.backward_shift(probe.idx, probe.guard);
        Some(kv.value)
    }
}
