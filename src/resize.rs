//! Cooperative table growth.
//!
//! The thread that trips the load threshold becomes the coordinator: it
//! allocates the doubled array, waits for every other worker to leave its
//! critical section, then opens the barrier. Workers that notice the resize
//! on their way into the container join as helpers. All participants claim
//! disjoint chunks of the old array and rehash them into the new one; the
//! last participant to finish commits the swap and wakes the rest.

use crate::area::Area;
use crate::table::{Slot, Table};
use crate::{CasMap, KeyRef};
use parking_lot::{Condvar, Mutex};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub(crate) struct ResizeState {
    pub(crate) resizing: AtomicBool,
    pub(crate) resize_fail: AtomicBool,
    rehash_idx: AtomicU32,
    sync: Mutex<Rendezvous>,
    /// Waited on by helpers until the coordinator opens the barrier.
    coordinator_ready: Condvar,
    /// Waited on by the coordinator while any area is still busy.
    helper_arrived: Condvar,
    /// Waited on by participants that finished their share before commit.
    commit_done: Condvar,
}

struct Rendezvous {
    participants: u32,
    barrier_open: bool,
}

impl ResizeState {
    pub(crate) fn new() -> Self {
        Self {
            resizing: AtomicBool::new(false),
            resize_fail: AtomicBool::new(false),
            rehash_idx: AtomicU32::new(0),
            sync: Mutex::new(Rendezvous {
                participants: 0,
                barrier_open: false,
            }),
            coordinator_ready: Condvar::new(),
            helper_arrived: Condvar::new(),
            commit_done: Condvar::new(),
        }
    }

    /// Late signal from a mutator leaving its critical section while a
    /// resize is pending, so a quiescing coordinator rechecks the areas.
    pub(crate) fn nudge_coordinator(&self) {
        let _sync = self.sync.lock();
        self.helper_arrived.notify_one();
    }
}

impl<V, S> CasMap<V, S> {
    /// Drives a resize to completion, as the coordinator (the thread whose
    /// test-and-set flipped `resizing`) or as a helper. On return the resize
    /// this thread observed is over, one way or the other, and `area` is
    /// busy again so the caller can re-enter its critical section.
    pub(crate) fn run_resize(&self, area: &Area, coordinator: bool) {
        let state = &self.resize;
        if state.resize_fail.load(Ordering::SeqCst) {
            return;
        }

        area.set_busy(false);

        let old_ptr;
        let new_ptr;
        if coordinator {
            old_ptr = self.current.load(Ordering::Acquire);
            // SAFETY: this thread owns the coordinator role, so the current
            // table cannot be replaced or freed underneath it.
            let old_len = unsafe { (*old_ptr).len() };

            match Table::try_new(old_len << 1) {
                Some(table) => {
                    new_ptr = Box::into_raw(table);
                    self.next.store(new_ptr, Ordering::Release);
                    state.rehash_idx.store(0, Ordering::SeqCst);
                }
                None => {
                    area.set_busy(true);
                    state.resize_fail.store(true, Ordering::SeqCst);
                    state.resizing.store(false, Ordering::SeqCst);
                    // Helpers may already be parked at the barrier.
                    let _sync = state.sync.lock();
                    state.coordinator_ready.notify_all();
                    return;
                }
            }

            let mut sync = state.sync.lock();
            sync.participants += 1;
            'drain: loop {
                for other in self.areas.iter() {
                    if other.is_busy() {
                        state.helper_arrived.wait(&mut sync);
                        continue 'drain;
                    }
                }
                break;
            }
            sync.barrier_open = true;
            state.coordinator_ready.notify_all();
            drop(sync);
        } else {
            let mut sync = state.sync.lock();
            if !state.resizing.load(Ordering::SeqCst) {
                // Finished (or failed) before we arrived.
                drop(sync);
                area.set_busy(true);
                return;
            }
            state.helper_arrived.notify_one();
            sync.participants += 1;
            while !sync.barrier_open {
                if !state.resizing.load(Ordering::SeqCst) {
                    // The coordinator could not allocate the new table.
                    sync.participants -= 1;
                    drop(sync);
                    area.set_busy(true);
                    return;
                }
                state.coordinator_ready.wait(&mut sync);
            }
            old_ptr = self.current.load(Ordering::Acquire);
            new_ptr = self.next.load(Ordering::Acquire);
            drop(sync);
        }

        // A nonzero participant count pins both tables; marking the area
        // busy again keeps the handshake invariants for the next resize.
        area.set_busy(true);

        // SAFETY: the participant count includes this thread, so neither
        // table can be freed before the commit below.
        let old = unsafe { &*old_ptr };
        let new = unsafe { &*new_ptr };
        self.rehash_share(old, new);

        let mut sync = state.sync.lock();
        sync.participants -= 1;
        if sync.participants == 0 {
            self.current.store(new_ptr, Ordering::Release);
            self.next.store(ptr::null_mut(), Ordering::Release);
            // SAFETY: every entry has been moved out, every other participant
            // is waiting on `commit_done`, and non-participants are fenced
            // off by the `resizing` flag until it clears below.
            unsafe { drop(Box::from_raw(old_ptr)) };
            sync.barrier_open = false;
            state.commit_done.notify_all();
            state.resizing.store(false, Ordering::SeqCst);
        } else {
            while sync.barrier_open {
                state.commit_done.wait(&mut sync);
            }
        }
    }

    /// Claims chunks of the old array and reinserts every live entry into
    /// the new one. Entry hashes were computed once at insert and are reused
    /// here; only the probe position is recomputed against the wider mask.
    fn rehash_share(&self, old: &Table<V>, new: &Table<V>) {
        let len = old.len();
        let chunk = usize::max(1, len / self.areas.len());

        loop {
            let start = self
                .resize
                .rehash_idx
                .fetch_add(chunk as u32, Ordering::SeqCst) as usize;
            if start >= len {
                return;
            }
            let end = usize::min(start + chunk, len);

            for idx in start..end {
                // SAFETY: mutators are quiesced behind the barrier and rehash
                // chunks are disjoint, so this slot is only touched by this
                // thread.
                let slot = unsafe { &mut *old.bucket(idx).data_ptr() };
                let Some(kv) = slot.kv.take() else { continue };

                let key = KeyRef {
                    bytes: &kv.key,
                    hash: slot.hash,
                };
                let probe = new.find(&key);
                new.cascade_insert(
                    probe.idx,
                    probe.guard,
                    Slot {
                        hash: slot.hash,
                        psl: probe.psl,
                        kv: Some(kv),
                    },
                );
            }
        }
    }
}
