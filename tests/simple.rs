use casmap::{CasMap, CasOp, CasResult, DropReason, Hooks, Options};
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn insert_get() {
    const ITER: u32 = 1024;
    let map = CasMap::new();
    let mut worker = map.worker();

    for i in 0..ITER {
        assert!(worker.set(&i.to_le_bytes(), i + 7));
    }
    for i in 0..ITER {
        assert_eq!(worker.get(&i.to_le_bytes()), Some(i + 7));
    }
}

#[test]
fn insert_remove() {
    const ITER: u32 = 1024;
    let map = CasMap::new();
    let mut worker = map.worker();

    for i in 0..ITER {
        assert!(worker.set(&i.to_le_bytes(), i));
    }
    for i in 0..ITER {
        assert!(worker.delete(&i.to_le_bytes()));
    }
    for i in 0..ITER {
        assert_eq!(worker.get(&i.to_le_bytes()), None);
    }
}

#[test]
fn works_with_a_supplied_build_hasher() {
    let map: CasMap<u64, fxhash::FxBuildHasher> =
        CasMap::with_hasher(fxhash::FxBuildHasher::default());
    let mut worker = map.worker();

    for i in 0..256u64 {
        assert!(worker.set(&i.to_le_bytes(), i * 2));
    }
    for i in 0..256u64 {
        assert_eq!(worker.get(&i.to_le_bytes()), Some(i * 2));
    }
}

#[test]
fn empty_key_is_a_key() {
    let map = CasMap::new();
    let mut worker = map.worker();

    assert!(worker.set(b"", 1u8));
    assert_eq!(worker.get(b""), Some(1));
    assert!(worker.delete(b""));
    assert_eq!(worker.get(b""), None);
}

#[test]
fn compare_and_swap_round() {
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
    assert_eq!(worker.cas(&key, CasOp::Delete), CasResult::Error);
}

#[test]
fn mismatch_hands_back_the_stored_value() {
    let map: CasMap<&'static str> = CasMap::new();
    let mut worker = map.worker();
    let key = map.key(b"k");

    assert_eq!(
        worker.cas(&key, CasOp::Set { expected: &"", new: "a" }),
        CasResult::Success
    );
    assert_eq!(
        worker.cas(&key, CasOp::Set { expected: &"b", new: "c" }),
        CasResult::Again("a")
    );
    assert_eq!(
        worker.cas(&key, CasOp::Set { expected: &"a", new: "c" }),
        CasResult::Success
    );
    assert_eq!(worker.get(b"k"), Some("c"));
}

#[derive(Default)]
struct Counters {
    acquire: AtomicUsize,
    set: AtomicUsize,
    delete: AtomicUsize,
    destroy: AtomicUsize,
}

struct CountingHooks(Arc<Counters>);

impl Hooks<u64> for CountingHooks {
    fn acquire(&self, _value: &u64) {
        self.0.acquire.fetch_add(1, Ordering::SeqCst);
    }

    fn drop_value(&self, _value: &u64, reason: DropReason) {
        let counter = match reason {
            DropReason::Set => &self.0.set,
            DropReason::Delete => &self.0.delete,
            DropReason::Destroy => &self.0.destroy,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn every_value_placed_is_dropped_exactly_once() {
    let counters = Arc::new(Counters::default());
    let map: CasMap<u64> =
        CasMap::new().with_hooks(Box::new(CountingHooks(Arc::clone(&counters))));

    {
        let mut worker = map.worker();
        for i in 0..100u64 {
            assert!(worker.set(&i.to_le_bytes(), i));
        }
        for i in 0..30u64 {
            assert!(worker.set(&i.to_le_bytes(), i + 1000));
        }
        for i in 50..70u64 {
            assert!(worker.delete(&i.to_le_bytes()));
        }
        assert_eq!(worker.get(&99u64.to_le_bytes()), Some(99));
    }
    drop(map);

    assert_eq!(counters.set.load(Ordering::SeqCst), 30);
    assert_eq!(counters.delete.load(Ordering::SeqCst), 20);
    assert_eq!(counters.destroy.load(Ordering::SeqCst), 80);
    // 130 values entered the map, 130 were let go.
    assert_eq!(
        counters.set.load(Ordering::SeqCst)
            + counters.delete.load(Ordering::SeqCst)
            + counters.destroy.load(Ordering::SeqCst),
        130
    );
    // 30 failed compares plus one read.
    assert_eq!(counters.acquire.load(Ordering::SeqCst), 31);
}

struct PanicOnce(AtomicBool);

impl Hooks<u32> for PanicOnce {
    fn drop_value(&self, _value: &u32, _reason: DropReason) {
        if !self.0.swap(true, Ordering::SeqCst) {
            panic!("hook failure");
        }
    }
}

#[test]
fn a_panicking_hook_does_not_wedge_the_map() {
    let options = Options {
        workers: 2,
        initial_capacity_log2: 4,
        max_load: 0.5,
        reserve_batch: 4,
    };
    let map: CasMap<u32> = CasMap::with_options(options)
        .with_hooks(Box::new(PanicOnce(AtomicBool::new(false))));

    let mut worker = map.worker();
    assert!(worker.set(b"k", 1));
    let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        worker.delete(b"k")
    }))
    .is_err();
    assert!(panicked);
    // The aborted delete left the entry in place.
    assert_eq!(worker.get(b"k"), Some(1));
    drop(worker);

    // Reuse the area the panic ran on, park it idle, and grow the table
    // from the other worker: the resize has to see that area as quiescent.
    let _idle = map.worker();
    let mut active = map.worker();
    for i in 0..40u32 {
        assert!(active.set(&i.to_le_bytes(), i));
    }
    assert_eq!(active.get(b"k"), Some(1));
    assert!(active.delete(b"k"));
}

/// Hashes to the first four little-endian key bytes, so tests can place
/// keys in chosen buckets.
#[derive(Clone, Default)]
struct FirstBytes;

struct FirstBytesHasher(u64);

impl Hasher for FirstBytesHasher {
    fn write(&mut self, bytes: &[u8]) {
        let mut buf = [0u8; 4];
        buf[..bytes.len().min(4)].copy_from_slice(&bytes[..bytes.len().min(4)]);
        self.0 = u32::from_le_bytes(buf) as u64;
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

impl BuildHasher for FirstBytes {
    type Hasher = FirstBytesHasher;

    fn build_hasher(&self) -> FirstBytesHasher {
        FirstBytesHasher(0)
    }
}

#[test]
fn colliding_chains_survive_deletions_in_any_order() {
    // Bucket count stays at 64 here, so hashes 7, 71 and 135 collide and
    // form a probe chain of length three.
    let options = Options {
        workers: 1,
        initial_capacity_log2: 6,
        max_load: 0.94,
        reserve_batch: 4,
    };
    let chain: [u32; 3] = [7, 71, 135];
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        let map: CasMap<u32, FirstBytes> =
            CasMap::with_options_and_hasher(options, FirstBytes);
        let mut worker = map.worker();

        for hash in chain {
            assert!(worker.set(&hash.to_le_bytes(), hash));
        }
        for (step, &victim) in order.iter().enumerate() {
            assert!(worker.delete(&chain[victim].to_le_bytes()));
            for &survivor in order[step + 1..].iter() {
                assert_eq!(
                    worker.get(&chain[survivor].to_le_bytes()),
                    Some(chain[survivor]),
                    "lost {} deleting in order {order:?}",
                    chain[survivor]
                );
            }
        }
    }
}

#[test]
fn delete_if_on_a_chain_member() {
    let options = Options {
        workers: 1,
        initial_capacity_log2: 6,
        max_load: 0.94,
        reserve_batch: 4,
    };
    let map: CasMap<u32, FirstBytes> = CasMap::with_options_and_hasher(options, FirstBytes);
    let mut worker = map.worker();

    for hash in [9u32, 73, 137] {
        assert!(worker.set(&hash.to_le_bytes(), hash));
    }
    assert_eq!(
        worker.delete_if(&73u32.to_le_bytes(), &0),
        CasResult::Again(73)
    );
    assert_eq!(
        worker.delete_if(&73u32.to_le_bytes(), &73),
        CasResult::Success
    );
    assert_eq!(worker.get(&9u32.to_le_bytes()), Some(9));
    assert_eq!(worker.get(&137u32.to_le_bytes()), Some(137));
    assert_eq!(worker.get(&73u32.to_le_bytes()), None);
}
