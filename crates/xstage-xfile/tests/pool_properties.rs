#![forbid(unsafe_code)]

use proptest::prelude::*;
use xstage_types::{BlockSize, ByteOffset};
use xstage_xfile::{Partition, PoolStats, XfilePool};

fn page() -> u64 {
    BlockSize::system_page().as_u64()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from(i % 251).expect("fits").wrapping_add(seed))
        .collect()
}

#[test]
fn scenario_a_bounded_round_trip_then_release() {
    let pool = XfilePool::new();
    let part = pool.acquire_partition("scenario-a", 64 * 1024).expect("partition");
    let data = pattern(4096, 0);
    part.store(&data, ByteOffset::ZERO).expect("store");
    let mut out = vec![0_u8; 4096];
    part.load(&mut out, ByteOffset::ZERO).expect("load");
    assert_eq!(out, data);

    pool.release_partition(part);
    assert_eq!(pool.stats().live_partitions, 0);
    assert_eq!(pool.stats(), PoolStats::default());
}

#[test]
fn scenario_b_small_partitions_share_a_backing_file() {
    let pool = XfilePool::new();
    let a = pool.acquire_partition("scenario-b", 4096).expect("a");
    let b = pool.acquire_partition("scenario-b", 4096).expect("b");
    assert_eq!(a.backing_id(), b.backing_id());
    assert_eq!(pool.refcount(a.backing_id()), Some(2));

    let id = a.backing_id();
    pool.release_partition(a);
    assert_eq!(pool.refcount(id), Some(1));
    assert_eq!(pool.stats().backing_files, 1);
}

#[test]
fn scenario_c_unbounded_usage_tracks_written_pages() {
    let pool = XfilePool::new();
    let part = pool.acquire_partition("scenario-c", 0).expect("partition");
    let far = ByteOffset(64 << 20);
    let end = far.checked_add(1 << 20).expect("end");
    part.ensure_backed(end).expect("extend");
    part.store(&pattern(1 << 20, 3), far).expect("store 1 MiB");

    let used = part.bytes_used().expect("bytes used");
    let logical = part.file().metadata().expect("meta").len();
    assert!(used > 0, "written pages must be counted");
    assert!(used < logical, "used={used} must not be the logical size {logical}");
}

#[test]
fn p2_unbounded_partition_owns_its_file_for_life() {
    let pool = XfilePool::new();
    let private = pool.acquire_partition("p2", 0).expect("private");
    let id = private.backing_id();
    let mut others = Vec::new();
    for i in 0..8 {
        let max = if i % 2 == 0 { 0 } else { page() };
        let other = pool.acquire_partition("p2-other", max).expect("other");
        assert_ne!(other.backing_id(), id);
        others.push(other);
    }
    assert_eq!(pool.refcount(id), Some(1));
    drop(others);
    assert_eq!(pool.refcount(id), Some(1));
    drop(private);
    assert_eq!(pool.refcount(id), None);
}

#[test]
fn p4_capacity_is_enforced_without_partial_write() {
    let pool = XfilePool::new();
    let part = pool.acquire_partition("p4", 3000).expect("partition");
    let before = pattern(3000, 9);
    part.store(&before, ByteOffset::ZERO).expect("fill");

    let err = part
        .store(&[0xFF; 64], ByteOffset(2990))
        .expect_err("crosses capacity");
    assert!(err.is_out_of_space());
    let mut big = vec![0_u8; 3001];
    let err = part.load(&mut big, ByteOffset::ZERO).expect_err("too long");
    assert!(err.is_out_of_space());

    let mut out = vec![0_u8; 3000];
    part.load(&mut out, ByteOffset::ZERO).expect("load");
    assert_eq!(out, before);
}

#[test]
fn p7_released_tail_range_reads_back_zeroed() {
    let pool = XfilePool::new();
    let keep = pool.acquire_partition("keep", page()).expect("keep");
    let len = usize::try_from(page()).expect("page");
    {
        let former = pool.acquire_partition("former", page()).expect("former");
        former.store(&vec![0xCD; len], ByteOffset::ZERO).expect("store");
    }
    let next = pool.acquire_partition("next", page()).expect("next");
    assert_eq!(next.backing_id(), keep.backing_id());
    assert_eq!(next.start().0, page());

    let mut out = vec![0xFF_u8; len];
    next.load(&mut out, ByteOffset::ZERO).expect("load");
    assert!(out.iter().all(|&b| b == 0), "former occupant's data leaked");
}

#[test]
fn p7_discard_twice_matches_discard_once() {
    let pool = XfilePool::new();
    let once = pool.acquire_partition("once", 4 * page()).expect("once");
    let twice = pool.acquire_partition("twice", 4 * page()).expect("twice");
    let len = usize::try_from(4 * page()).expect("len");
    let data = pattern(len, 1);
    for part in [&once, &twice] {
        part.store(&data, ByteOffset::ZERO).expect("store");
    }

    once.discard(ByteOffset(page()), 2 * page());
    twice.discard(ByteOffset(page()), 2 * page());
    twice.discard(ByteOffset(page()), 2 * page());

    let mut a = vec![0_u8; len];
    let mut b = vec![0_u8; len];
    once.load(&mut a, ByteOffset::ZERO).expect("load once");
    twice.load(&mut b, ByteOffset::ZERO).expect("load twice");
    assert_eq!(a, b);
    assert_eq!(once.bytes_used().expect("once"), twice.bytes_used().expect("twice"));
}

fn ranges_overlap(a: &Partition, b: &Partition) -> bool {
    let (a0, a1) = (a.start().0, a.start().0 + a.max_bytes());
    let (b0, b1) = (b.start().0, b.start().0 + b.max_bytes());
    a0 < b1 && b0 < a1
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn p1_shared_partitions_never_overlap(
        sizes in proptest::collection::vec(1_u64..20_000, 1..12),
        drop_mask in proptest::collection::vec(any::<bool>(), 12),
    ) {
        let pool = XfilePool::new();
        let mut parts = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            parts.push(pool.acquire_partition("p1", *size).expect("acquire"));
            // Interleave releases so reclaimed tails get reused.
            if drop_mask[i] && parts.len() > 1 {
                let _ = parts.remove(0);
            }
        }

        for (i, a) in parts.iter().enumerate() {
            for b in &parts[i + 1..] {
                if a.backing_id() == b.backing_id() {
                    prop_assert!(!ranges_overlap(a, b));
                }
            }
        }

        for (i, part) in parts.iter().enumerate() {
            let seed = u8::try_from(i).expect("fits");
            let len = usize::try_from(part.max_bytes()).expect("len");
            part.store(&vec![seed; len], ByteOffset::ZERO).expect("fill");
        }
        for (i, part) in parts.iter().enumerate() {
            let seed = u8::try_from(i).expect("fits");
            let len = usize::try_from(part.max_bytes()).expect("len");
            let mut out = vec![0_u8; len];
            part.load(&mut out, ByteOffset::ZERO).expect("read back");
            prop_assert!(out.iter().all(|&b| b == seed));
        }
    }

    #[test]
    fn p3_store_then_load_round_trips(
        pos in 0_u64..60_000,
        data in proptest::collection::vec(any::<u8>(), 1..4096),
        unbounded in any::<bool>(),
    ) {
        let pool = XfilePool::new();
        let max = if unbounded { 0 } else { 64 * 1024 };
        let part = pool.acquire_partition("p3", max).expect("acquire");
        let pos = ByteOffset(pos);
        part.store(&data, pos).expect("store");
        let mut out = vec![0_u8; data.len()];
        part.load(&mut out, pos).expect("load");
        prop_assert_eq!(out, data);
    }

    #[test]
    fn p5_backing_file_destroyed_exactly_after_last_release(
        order in (1_usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let pool = XfilePool::new();
        let mut parts: Vec<Option<Partition>> = (0..order.len())
            .map(|_| Some(pool.acquire_partition("p5", 4096).expect("acquire")))
            .collect();
        let id = parts[0].as_ref().expect("first").backing_id();
        prop_assert_eq!(pool.refcount(id), Some(u32::try_from(order.len()).expect("fits")));

        for (released, index) in order.iter().enumerate() {
            let part = parts[*index].take().expect("not yet released");
            pool.release_partition(part);
            let remaining = order.len() - released - 1;
            if remaining == 0 {
                prop_assert_eq!(pool.refcount(id), None);
            } else {
                prop_assert_eq!(pool.refcount(id), Some(u32::try_from(remaining).expect("fits")));
            }
        }
        prop_assert_eq!(pool.stats(), PoolStats::default());
    }
}
