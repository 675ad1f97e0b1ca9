//! CasMap is a process-local concurrent associative container keyed by byte
//! strings, built for a fixed pool of worker threads.
//!
//! All three primitive operations (conditional set, read, conditional
//! delete) go through a single compare-and-swap style entry point,
//! [`Worker::cas`]. Storage is a single open-addressed Robin Hood table with
//! one spinlock per bucket; probe walks take the locks hand-over-hand so
//! operations on unrelated keys proceed in parallel. When the load threshold
//! is crossed the table doubles online: the triggering thread coordinates,
//! and every worker that touches the map while the resize is pending helps
//! rehash a share of the old array.
//!
//! Each worker thread claims a [`Worker`] handle up front and performs every
//! operation through it. The handle carries the thread's occupancy credit so
//! the hot path stays off the shared counter.
//!
//! ```
//! use casmap::CasMap;
//!
//! let map: CasMap<u64> = CasMap::new();
//! let mut worker = map.worker();
//! assert!(worker.set(b"answer", 42));
//! assert_eq!(worker.get(b"answer"), Some(42));
//! assert!(worker.delete(b"answer"));
//! assert_eq!(worker.get(b"answer"), None);
//! ```

mod area;
mod hooks;
mod lock;
mod resize;
mod table;

pub use hooks::{DropReason, Hooks};

use area::{Area, AreaSet};
use once_cell::sync::OnceCell;
use resize::ResizeState;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use table::{Kv, Probe, Slot, Table};

fn default_worker_count() -> usize {
    static DEFAULT_WORKER_COUNT: OnceCell<usize> = OnceCell::new();
    *DEFAULT_WORKER_COUNT
        .get_or_init(|| std::thread::available_parallelism().map_or(1, usize::from))
}

/// Construction parameters.
///
/// `workers` is a hard cap on concurrently claimed [`Worker`] handles.
/// `max_load` is the occupancy fraction past which the table doubles.
/// `reserve_batch` is how much occupancy credit a worker draws from the
/// shared counter at a time; larger batches mean fewer contended updates but
/// more slack held per thread.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub workers: usize,
    pub initial_capacity_log2: u32,
    pub max_load: f32,
    pub reserve_batch: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            initial_capacity_log2: 6,
            max_load: 0.94,
            reserve_batch: 24,
        }
    }
}

/// A key bound to its hash, valid for as long as the borrowed bytes.
/// Produced by [`CasMap::key`]; hashing happens once even if the key is used
/// for several operations.
pub struct KeyRef<'a> {
    pub(crate) bytes: &'a [u8],
    pub(crate) hash: u32,
}

impl<'a> KeyRef<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// One primitive operation for [`Worker::cas`].
pub enum CasOp<'e, V> {
    /// Insert if the key is absent. If it is present, overwrite only when
    /// the stored value equals `expected`.
    Set { expected: &'e V, new: V },
    /// Read the stored value.
    Get,
    /// Remove the entry regardless of its stored value.
    Delete,
    /// Remove the entry only when the stored value equals `expected`.
    DeleteIf { expected: &'e V },
}

/// Outcome of [`Worker::cas`].
///
/// `Again` carries the value that was actually stored: for `Get` it is the
/// read result, for a failed compare it is what the caller should retry
/// against. `Error` means the operation was not applicable (key absent, or
/// the table is physically full after a failed resize).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasResult<V> {
    Success,
    Again(V),
    Error,
}

/// The container handle. Share it between threads with `Arc`.
pub struct CasMap<V, S = RandomState> {
    current: AtomicPtr<Table<V>>,
    next: AtomicPtr<Table<V>>,
    /// Slots spoken for: live entries plus every worker's unused credit.
    occupied: AtomicU32,
    max_load: f32,
    reserve_batch: u32,
    areas: AreaSet,
    resize: ResizeState,
    hooks: Option<Box<dyn Hooks<V>>>,
    hasher: S,
}

// SAFETY: the raw table pointers are owned by the map and every shared
// access path is serialized by bucket locks or the resize rendezvous.
unsafe impl<V: Send, S: Send> Send for CasMap<V, S> {}
unsafe impl<V: Send + Sync, S: Send + Sync> Sync for CasMap<V, S> {}

enum Reserve {
    Granted(u32),
    ResizeNeeded,
    Exhausted,
}

/// An entered critical section: the worker's area is marked busy and any
/// pending resize has been helped to completion. Dropping the guard leaves
/// the critical section, so the busy flag is cleared even when a user hook
/// panics mid-operation; a stuck flag would hang the next coordinator's
/// quiescence scan forever.
struct BusyGuard<'a, V, S> {
    map: &'a CasMap<V, S>,
    area: &'a Area,
}

impl<V, S> Drop for BusyGuard<'_, V, S> {
    fn drop(&mut self) {
        self.map.leave(self.area);
    }
}

impl<V> CasMap<V, RandomState> {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Self::with_options_and_hasher(options, RandomState::default())
    }
}

impl<V> Default for CasMap<V, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, S: BuildHasher> CasMap<V, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_options_and_hasher(Options::default(), hasher)
    }

    /// Builds the map. The initial size is rounded up to a power of two
    /// large enough that one full reserve batch fits under the load ceiling
    /// and every worker could hold a slot at once.
    ///
    /// # Panics
    ///
    /// If `workers` is zero, `max_load` is outside `(0, 1]`, or
    /// `reserve_batch` is zero.
    pub fn with_options_and_hasher(options: Options, hasher: S) -> Self {
        assert!(options.workers >= 1);
        assert!(options.max_load > 0.0 && options.max_load <= 1.0);
        assert!(options.reserve_batch >= 1);

        let floor = usize::max(
            options.workers + 1,
            (options.reserve_batch as f32 / options.max_load) as usize + 1,
        )
        .next_power_of_two();
        let len = usize::max(1usize << options.initial_capacity_log2, floor);

        let table = Table::try_new(len).expect("initial table allocation failed");
        Self {
            current: AtomicPtr::new(Box::into_raw(table)),
            next: AtomicPtr::new(ptr::null_mut()),
            occupied: AtomicU32::new(0),
            max_load: options.max_load,
            reserve_batch: options.reserve_batch,
            areas: AreaSet::new(options.workers),
            resize: ResizeState::new(),
            hooks: None,
            hasher,
        }
    }

    /// Installs a value lifecycle hook. Builder-style; call before the map
    /// is shared with workers.
    pub fn with_hooks(mut self, hooks: Box<dyn Hooks<V>>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Binds `bytes` to its hash.
    pub fn key<'a>(&self, bytes: &'a [u8]) -> KeyRef<'a> {
        let mut hasher = self.hasher.build_hasher();
        hasher.write(bytes);
        KeyRef {
            bytes,
            hash: hasher.finish() as u32,
        }
    }
}

impl<V, S> CasMap<V, S> {
    /// Claims a worker slot.
    ///
    /// # Panics
    ///
    /// If more than `options.workers` handles are claimed at once.
    pub fn worker(&self) -> Worker<'_, V, S> {
        Worker {
            map: self,
            idx: self.areas.claim(),
        }
    }

    /// Slots currently spoken for: live entries plus unused worker credit.
    /// Once every worker handle is dropped this equals the entry count.
    pub fn occupied(&self) -> u32 {
        self.occupied.load(Ordering::Relaxed)
    }

    /// Current bucket count. Requires `&mut self`, which proves no worker
    /// handle is live and therefore no resize can be in flight.
    pub fn capacity(&mut self) -> usize {
        // SAFETY: exclusive access, the pointer is stable and valid.
        unsafe { (**self.current.get_mut()).len() }
    }

    fn reserve_for(&self, area: &Area, want: u32) -> Reserve {
        // SAFETY: the caller's area is busy, which pins the current table.
        let len = unsafe { (*self.current.load(Ordering::Acquire)).len() } as u32;
        let ceiling = len as f32 * self.max_load;

        let mut occupied = self.occupied.load(Ordering::Relaxed);
        loop {
            if (occupied + want) as f32 > ceiling
                && !self.resize.resize_fail.load(Ordering::SeqCst)
            {
                return Reserve::ResizeNeeded;
            }
            let granted = u32::min(want, len - occupied);
            if granted == 0 {
                return Reserve::Exhausted;
            }
            match self.occupied.compare_exchange_weak(
                occupied,
                occupied + granted,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    area.add_reserved(granted);
                    return Reserve::Granted(granted);
                }
                Err(observed) => occupied = observed,
            }
        }
    }

    /// Marks the area busy and, if a resize is pending, helps drive it
    /// before entering. The guard leaves the critical section on drop.
    fn enter<'a>(&'a self, area: &'a Area) -> BusyGuard<'a, V, S> {
        area.set_busy(true);
        if self.resize.resizing.load(Ordering::SeqCst) {
            self.run_resize(area, false);
        }
        BusyGuard { map: self, area }
    }

    /// Leaves the critical section. The late `resizing` check keeps a
    /// quiescing coordinator from waiting forever on an area that went idle
    /// just after the coordinator scanned it.
    fn leave(&self, area: &Area) {
        area.set_busy(false);
        if self.resize.resizing.load(Ordering::SeqCst) {
            self.resize.nudge_coordinator();
        }
    }

    /// The hook runs first, on the still-stored value: if it panics, the
    /// entry stays in place and the table remains consistent.
    fn remove_found<'t>(
        &self,
        area: &Area,
        table: &'t Table<V>,
        mut probe: Probe<'t, V>,
    ) -> CasResult<V> {
        if let Some(hooks) = &self.hooks {
            let kv = probe.guard.kv.as_ref().unwrap();
            hooks.drop_value(&kv.value, DropReason::Delete);
        }
        let kv = probe.guard.kv.take().unwrap();
        drop(kv);
        table.backward_shift(probe.idx, probe.guard);
        area.add_reserved(1);
        CasResult::Success
    }
}

impl<V, S> Drop for CasMap<V, S> {
    fn drop(&mut self) {
        let next = *self.next.get_mut();
        if !next.is_null() {
            // SAFETY: exclusive access; a leftover next table owns no entries.
            unsafe { drop(Box::from_raw(next)) };
        }
        // SAFETY: exclusive access; no worker handle can outlive the map.
        let mut table = unsafe { Box::from_raw(*self.current.get_mut()) };
        if let Some(hooks) = &self.hooks {
            for slot in table.slots_mut() {
                if let Some(kv) = &slot.kv {
                    hooks.drop_value(&kv.value, DropReason::Destroy);
                }
            }
        }
    }
}

/// A claimed worker slot. Every operation enters the container through one
/// of these; dropping it returns unused occupancy credit and frees the slot
/// for another thread.
pub struct Worker<'map, V, S = RandomState> {
    map: &'map CasMap<V, S>,
    idx: usize,
}

impl<'map, V, S> Worker<'map, V, S> {
    #[inline]
    fn area(&self) -> &'map Area {
        self.map.areas.get(self.idx)
    }

    /// This worker's unused occupancy credit.
    pub fn reserved(&self) -> u32 {
        self.area().reserved()
    }

    /// Returns all unused credit to the shared counter without giving up
    /// the worker slot.
    pub fn flush(&mut self) {
        let reserved = self.area().take_reserved();
        if reserved != 0 {
            self.map.occupied.fetch_sub(reserved, Ordering::Relaxed);
        }
    }

    /// Pre-draws up to `want` slots of occupancy credit, growing the table
    /// if the request crosses the load threshold. Returns the amount
    /// granted; zero only when the table is physically full after a failed
    /// resize (or when `want` is zero).
    pub fn reserve(&mut self, want: u32) -> u32 {
        let map = self.map;
        let area = self.area();
        let _busy = map.enter(area);

        loop {
            match map.reserve_for(area, want) {
                Reserve::Granted(granted) => return granted,
                Reserve::Exhausted => return 0,
                Reserve::ResizeNeeded => {
                    let coordinator = !map.resize.resizing.swap(true, Ordering::SeqCst);
                    map.run_resize(area, coordinator);
                }
            }
        }
    }

    /// Current bucket count, observed from inside a critical section.
    pub fn capacity(&mut self) -> usize {
        let map = self.map;
        let area = self.area();
        let _busy = map.enter(area);

        // SAFETY: the busy area pins the current table.
        unsafe { (*map.current.load(Ordering::Acquire)).len() }
    }
}

impl<'map, V: Clone + PartialEq, S> Worker<'map, V, S> {
    /// The single entry point for all three primitives. See [`CasOp`] for
    /// the per-operation contract and [`CasResult`] for outcomes.
    ///
    /// ```
    /// use casmap::{CasMap, CasOp, CasResult};
    ///
    /// let map: CasMap<u32> = CasMap::new();
    /// let mut worker = map.worker();
    /// let key = map.key(b"k");
    ///
    /// assert_eq!(worker.cas(&key, CasOp::Set { expected: &0, new: 1 }), CasResult::Success);
    /// // A mismatched compare reports what is actually stored.
    /// assert_eq!(worker.cas(&key, CasOp::Set { expected: &7, new: 9 }), CasResult::Again(1));
    /// assert_eq!(worker.cas(&key, CasOp::Get), CasResult::Again(1));
    /// assert_eq!(worker.cas(&key, CasOp::Delete), CasResult::Success);
    /// assert_eq!(worker.cas(&key, CasOp::Get), CasResult::Error);
    /// ```
    pub fn cas(&mut self, key: &KeyRef<'_>, mut op: CasOp<'_, V>) -> CasResult<V> {
        let map = self.map;
        let area = self.area();
        let _busy = map.enter(area);

        loop {
            // SAFETY: this worker's area is busy, so no resize can commit
            // and free the table behind this pointer.
            let table = unsafe { &*map.current.load(Ordering::Acquire) };
            let mut probe = table.find(key);

            if probe.found {
                return match op {
                    CasOp::Set { expected, new } => {
                        let kv = probe.guard.kv.as_mut().unwrap();
                        if *expected == kv.value {
                            if let Some(hooks) = &map.hooks {
                                hooks.drop_value(&kv.value, DropReason::Set);
                            }
                            kv.value = new;
                            drop(probe.guard);
                            CasResult::Success
                        } else {
                            if let Some(hooks) = &map.hooks {
                                hooks.acquire(&kv.value);
                            }
                            let observed = kv.value.clone();
                            drop(probe.guard);
                            CasResult::Again(observed)
                        }
                    }
                    CasOp::Get => {
                        let kv = probe.guard.kv.as_ref().unwrap();
                        if let Some(hooks) = &map.hooks {
                            hooks.acquire(&kv.value);
                        }
                        let observed = kv.value.clone();
                        drop(probe.guard);
                        CasResult::Again(observed)
                    }
                    CasOp::Delete => map.remove_found(area, table, probe),
                    CasOp::DeleteIf { expected } => {
                        let kv = probe.guard.kv.as_ref().unwrap();
                        if *expected == kv.value {
                            map.remove_found(area, table, probe)
                        } else {
                            if let Some(hooks) = &map.hooks {
                                hooks.acquire(&kv.value);
                            }
                            let observed = kv.value.clone();
                            drop(probe.guard);
                            CasResult::Again(observed)
                        }
                    }
                };
            }

            match op {
                CasOp::Get | CasOp::Delete | CasOp::DeleteIf { .. } => {
                    drop(probe.guard);
                    return CasResult::Error;
                }
                CasOp::Set { expected, new } => {
                    if area.reserved() == 0 {
                        match map.reserve_for(area, map.reserve_batch) {
                            Reserve::Granted(_) => {}
                            Reserve::ResizeNeeded => {
                                drop(probe.guard);
                                let coordinator =
                                    !map.resize.resizing.swap(true, Ordering::SeqCst);
                                map.run_resize(area, coordinator);
                                // The key may have appeared while the bucket
                                // lock was released; probe again.
                                op = CasOp::Set { expected, new };
                                continue;
                            }
                            Reserve::Exhausted => {
                                drop(probe.guard);
                                return CasResult::Error;
                            }
                        }
                    }
                    area.spend_one();
                    let kv = Box::new(Kv {
                        value: new,
                        key: key.bytes.into(),
                    });
                    table.cascade_insert(
                        probe.idx,
                        probe.guard,
                        Slot {
                            hash: key.hash,
                            psl: probe.psl,
                            kv: Some(kv),
                        },
                    );
                    return CasResult::Success;
                }
            }
        }
    }
}

impl<'map, V: Clone + PartialEq, S: BuildHasher> Worker<'map, V, S> {
    /// Unconditional upsert built from CAS retries. Returns `false` only
    /// when the table is physically full after a failed resize.
    pub fn set(&mut self, key: &[u8], value: V) -> bool {
        let key = self.map.key(key);
        let mut expected: Option<V> = None;
        loop {
            let guess = expected.as_ref().unwrap_or(&value);
            match self.cas(
                &key,
                CasOp::Set {
                    expected: guess,
                    new: value.clone(),
                },
            ) {
                CasResult::Success => return true,
                CasResult::Again(observed) => expected = Some(observed),
                CasResult::Error => return false,
            }
        }
    }

    /// Reads the value stored under `key`.
    pub fn get(&mut self, key: &[u8]) -> Option<V> {
        let key = self.map.key(key);
        match self.cas(&key, CasOp::Get) {
            CasResult::Again(value) => Some(value),
            _ => None,
        }
    }

    /// Removes `key`. Returns whether an entry was removed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let key = self.map.key(key);
        matches!(self.cas(&key, CasOp::Delete), CasResult::Success)
    }

    /// Removes `key` only if the stored value equals `expected`.
    pub fn delete_if(&mut self, key: &[u8], expected: &V) -> CasResult<V> {
        let key = self.map.key(key);
        self.cas(&key, CasOp::DeleteIf { expected })
    }
}

impl<V, S> Drop for Worker<'_, V, S> {
    fn drop(&mut self) {
        let reserved = self.area().take_reserved();
        if reserved != 0 {
            self.map.occupied.fetch_sub(reserved, Ordering::Relaxed);
        }
        self.map.areas.release(self.idx);
    }
}

#[cfg(test)]
impl<V, S> CasMap<V, S> {
    fn table_mut(&mut self) -> &mut Table<V> {
        // SAFETY: exclusive access to the handle.
        unsafe { &mut **self.current.get_mut() }
    }
}

#[cfg(test)]
mod tests {
    use super::{CasMap, CasOp, CasResult, Options};

    fn small_options() -> Options {
        Options {
            workers: 2,
            initial_capacity_log2: 4,
            max_load: 0.5,
            reserve_batch: 4,
        }
    }

    #[test]
    fn round_trip() {
        let map: CasMap<u64> = CasMap::new();
        let mut worker = map.worker();
        let key = map.key(b"x");

        assert_eq!(
            worker.cas(&key, CasOp::Set { expected: &0, new: 0x1234 }),
            CasResult::Success
        );
        assert_eq!(worker.cas(&key, CasOp::Get), CasResult::Again(0x1234));
        assert_eq!(worker.cas(&key, CasOp::Delete), CasResult::Success);
        assert_eq!(worker.cas(&key, CasOp::Get), CasResult::Error);
    }

    #[test]
    fn mismatched_compare_reports_stored_value() {
        let map: CasMap<char> = CasMap::new();
        let mut worker = map.worker();
        let key = map.key(b"k");

        assert_eq!(
            worker.cas(&key, CasOp::Set { expected: &'a', new: 'a' }),
            CasResult::Success
        );
        assert_eq!(
            worker.cas(&key, CasOp::Set { expected: &'b', new: 'c' }),
            CasResult::Again('a')
        );
        assert_eq!(
            worker.cas(&key, CasOp::Set { expected: &'a', new: 'c' }),
            CasResult::Success
        );
        assert_eq!(worker.cas(&key, CasOp::Get), CasResult::Again('c'));
    }

    #[test]
    fn conditional_delete_contract() {
        let map: CasMap<u32> = CasMap::new();
        let mut worker = map.worker();

        worker.set(b"k", 5);
        assert_eq!(worker.delete_if(b"k", &9), CasResult::Again(5));
        assert_eq!(worker.get(b"k"), Some(5));
        assert_eq!(worker.delete_if(b"k", &5), CasResult::Success);
        assert_eq!(worker.get(b"k"), None);
        assert_eq!(worker.delete_if(b"k", &5), CasResult::Error);
    }

    #[test]
    fn growth_preserves_entries_and_layout() {
        let mut map: CasMap<usize> = CasMap::with_options(small_options());
        {
            let mut worker = map.worker();
            assert_eq!(worker.capacity(), 16);
            for i in 0..40usize {
                assert!(worker.set(format!("key-{i}").as_bytes(), i));
            }
            assert!(worker.capacity() >= 32);
            for i in 0..40usize {
                assert_eq!(worker.get(format!("key-{i}").as_bytes()), Some(i));
            }
        }
        map.table_mut().assert_layout();
        assert_eq!(map.table_mut().live_entries(), 40);
    }

    #[test]
    fn reservations_are_conserved() {
        let mut map: CasMap<usize> = CasMap::with_options(small_options());
        {
            let mut worker = map.worker();
            for i in 0..20usize {
                worker.set(&i.to_le_bytes(), i);
            }
            for i in 0..7usize {
                worker.delete(&i.to_le_bytes());
            }
            let reserved = worker.reserved();
            assert_eq!(map.occupied(), 13 + reserved);
        }
        // Dropping the worker flushes its credit.
        assert_eq!(map.occupied(), 13);
        assert_eq!(map.table_mut().live_entries(), 13);
        map.table_mut().assert_layout();
    }

    #[test]
    fn explicit_reserve_covers_a_burst() {
        let map: CasMap<u32> = CasMap::with_options(small_options());
        let mut worker = map.worker();

        let granted = worker.reserve(10);
        assert!(granted >= 1);
        assert_eq!(worker.reserved(), granted);

        for i in 0..granted {
            worker.set(&i.to_le_bytes(), i);
        }
        assert_eq!(worker.reserved(), 0);

        worker.reserve(4);
        worker.flush();
        assert_eq!(worker.reserved(), 0);
    }

    #[test]
    fn failed_resize_fills_the_table_then_errors() {
        let mut map: CasMap<usize> = CasMap::with_options(Options {
            workers: 1,
            ..small_options()
        });
        {
            let mut worker = map.worker();
            // Threshold is 8 of 16; the next refill past it trips a resize
            // whose allocation is made to fail.
            crate::table::FAIL_NEXT_TABLE_ALLOC.with(|fail| fail.set(true));

            let mut stored = 0usize;
            for i in 0..64usize {
                if worker.set(format!("k{i}").as_bytes(), i) {
                    stored += 1;
                } else {
                    break;
                }
            }
            // The table stayed at 16 buckets and filled completely.
            assert_eq!(worker.capacity(), 16);
            assert_eq!(stored, 16);
            assert!(!worker.set(b"one-more", 0));

            // Reads and deletes still work at full occupancy.
            assert_eq!(worker.get(b"k3"), Some(3));
            assert!(worker.delete(b"k3"));
            assert!(worker.set(b"replacement", 99));
        }
        map.table_mut().assert_layout();
    }

    #[test]
    #[should_panic(expected = "more concurrent workers")]
    fn worker_cap_is_enforced() {
        let map: CasMap<u32> = CasMap::with_options(Options {
            workers: 1,
            ..Options::default()
        });
        let _held = map.worker();
        map.worker();
    }
}
