//! Invariant checks for the detector as a whole.

use sprace::{AccessKind, RaceKind};
use tests::Session;

/// Series composition never races: neither plain calls nor a fully synced
/// spawn leave anything to report, whatever the access pattern.
#[test]
fn series_composition_reports_nothing() {
    let mut s = Session::new();
    let a = 0x50_0000;
    s.enter(1);
    // A tangle of serial reads and writes through nested calls.
    for i in 0..8 {
        s.write(a + i % 3, 1);
        let call_id = s.call();
        s.enter(1);
        s.read(a, 4);
        s.write(a, 4);
        s.leave();
        s.ret(call_id);
    }
    // A spawn whose sync completes before the next access.
    let detach_id = s.spawn_begin(0);
    s.write(a, 4);
    s.spawn_end(detach_id, 0);
    s.sync(0);
    s.write(a, 4);
    s.read(a, 4);
    s.leave();
    assert_eq!(s.race_count(), 0);
}

/// Swapping which of two parallel accesses runs first in the serial
/// order yields the same race pairs (the RW/WR kinds mirror).
#[test]
fn parallel_access_order_commutes() {
    let a = 0x51_0000;

    // Child writes, continuation reads.
    let mut s1 = Session::new();
    s1.enter(1);
    let d = s1.spawn_begin(0);
    s1.det.store(1000, a, 4, 4, false);
    s1.spawn_end(d, 0);
    s1.det.load(1001, a, 4, 4, false);
    s1.sync(0);
    s1.leave();

    // Child reads, continuation writes.
    let mut s2 = Session::new();
    s2.enter(1);
    let d = s2.spawn_begin(0);
    s2.det.load(1001, a, 4, 4, false);
    s2.spawn_end(d, 0);
    s2.det.store(1000, a, 4, 4, false);
    s2.sync(0);
    s2.leave();

    assert_eq!(s1.race_count(), 1);
    assert_eq!(s2.race_count(), 1);
    assert_eq!(s1.race_pairs(), s2.race_pairs());
    let k1 = s1.det.races().next().unwrap().kind();
    let k2 = s2.det.races().next().unwrap().kind();
    assert!(matches!(
        (k1, k2),
        (RaceKind::Wr, RaceKind::Rw) | (RaceKind::Rw, RaceKind::Wr)
    ));
}

/// Writes bracketed by the allocation's lifetime do not race with it; a
/// free that happens in parallel with a write is reported as a
/// Free-typed write-write race.
#[test]
fn alloc_free_bracketing() {
    // Bracketed: alloc, parallel write, free after the sync.  Clean.
    let mut s = Session::new();
    let a = 0x52_0000;
    s.enter(1);
    s.det.after_allocfn(200, a, 8, 0);
    let d = s.spawn_begin(0);
    s.write(a, 8);
    s.spawn_end(d, 0);
    s.sync(0);
    s.det.after_free(201, a);
    s.leave();
    assert_eq!(s.race_count(), 0);

    // The spawned child frees; the continuation's write races with the
    // free itself.
    let mut s = Session::new();
    let b = 0x53_0000;
    s.enter(1);
    s.det.after_allocfn(210, b, 8, 0);
    let d = s.spawn_begin(0);
    s.det.after_free(211, b);
    s.spawn_end(d, 0);
    s.write(b, 8);
    s.sync(0);
    s.leave();
    assert_eq!(s.race_count(), 1);
    let race = s.det.races().next().unwrap();
    assert_eq!(race.kind(), RaceKind::Ww);
    assert_eq!(race.first_kind(), AccessKind::Free);
}

/// Repeating the same access within one strand neither changes the check
/// results nor re-reports: the occupancy gate makes it a no-op.
#[test]
fn occupancy_gate_is_idempotent() {
    let mut s = Session::new();
    let a = 0x54_0000;
    s.enter(1);
    let d = s.spawn_begin(0);
    for _ in 0..5 {
        s.det.store(300, a, 4, 4, false);
    }
    s.spawn_end(d, 0);
    for _ in 0..5 {
        s.det.store(301, a, 4, 4, false);
    }
    s.sync(0);
    s.leave();
    // One WW race, found once: the four repeats on either side are
    // swallowed by the occupancy bits, not reported as duplicates.
    assert_eq!(s.race_count(), 1);
    assert_eq!(s.duplicate_count(), 0);
}

/// Two parallel writes to the same byte under a common lock are
/// suppressed; under disjoint locksets exactly one race is reported.
#[test]
fn lockset_suppression() {
    let common = {
        let mut s = Session::new();
        let a = 0x55_0000;
        s.enter(1);
        let d = s.spawn_begin(0);
        s.det.acquire_lock(7);
        s.det.store(400, a, 4, 4, false);
        s.det.release_lock(7);
        s.spawn_end(d, 0);
        s.det.acquire_lock(7);
        s.det.store(401, a, 4, 4, false);
        s.det.release_lock(7);
        s.sync(0);
        s.leave();
        s.race_count()
    };
    assert_eq!(common, 0);

    let disjoint = {
        let mut s = Session::new();
        let a = 0x56_0000;
        s.enter(1);
        let d = s.spawn_begin(0);
        s.det.acquire_lock(7);
        s.det.store(400, a, 4, 4, false);
        s.det.release_lock(7);
        s.spawn_end(d, 0);
        s.det.acquire_lock(8);
        s.det.store(401, a, 4, 4, false);
        s.det.release_lock(8);
        s.sync(0);
        s.leave();
        s.race_count()
    };
    assert_eq!(disjoint, 1);
}

/// Atomic accesses behave as if bracketed by the designated atomic lock:
/// two parallel atomics never race, an atomic against a plain write does.
#[test]
fn atomics_model_the_designated_lock() {
    let mut s = Session::new();
    let a = 0x57_0000;
    s.enter(1);
    let d = s.spawn_begin(0);
    s.det.store(500, a, 4, 4, true);
    s.spawn_end(d, 0);
    s.det.store(501, a, 4, 4, true);
    s.sync(0);
    s.leave();
    assert_eq!(s.race_count(), 0);

    let mut s = Session::new();
    let b = 0x58_0000;
    s.enter(1);
    let d = s.spawn_begin(0);
    s.det.store(500, b, 4, 4, true);
    s.spawn_end(d, 0);
    s.det.store(501, b, 4, 4, false);
    s.sync(0);
    s.leave();
    assert_eq!(s.race_count(), 1);
}

/// Parallel loops stay race free for iteration counts past the 16-bit
/// version wrap, with each iteration writing its own byte.
#[test]
fn loop_versioning_correct_across_counts() {
    for n in [10u64, 1_000, (1 << 16) + 10] {
        let mut s = Session::new();
        let base = 0x59_0000;
        s.enter(1);
        let l = s.loop_begin();
        let store_id = s.id();
        for i in 0..n {
            s.iter_begin(&l);
            s.det.store(store_id, base + i, 1, 1, false);
            s.iter_end(&l);
        }
        s.loop_end(&l, 0);
        s.sync(0);
        s.leave();
        assert_eq!(s.race_count(), 0, "n = {n}");
        if n > 1 << 16 {
            assert!(s.det.iterbag_rotations() >= 1);
        }
    }
}

/// Re-running the same racing block in one session adds duplicates, never
/// new distinct races, and the distinct count is independent of how many
/// bytes the block touches.
#[test]
fn dedup_is_monotonic_and_size_independent() {
    fn racy_block(s: &mut Session, base: u64, n: u64) {
        let d = s.spawn_begin(0);
        for i in 0..n {
            s.det.store(600, base + 4 * i, 4, 4, false);
        }
        s.spawn_end(d, 0);
        for i in 0..n {
            s.det.store(601, base + 4 * i, 4, 4, false);
        }
        s.sync(0);
    }

    let mut s = Session::new();
    s.enter(1);
    racy_block(&mut s, 0x5A_0000, 4);
    let first_distinct = s.race_count();
    let first_dups = s.duplicate_count();
    racy_block(&mut s, 0x5A_0000, 4);
    s.leave();
    assert_eq!(first_distinct, 1);
    assert_eq!(s.race_count(), first_distinct);
    assert!(s.duplicate_count() > first_dups);

    // A wider block reports the same single distinct race.
    let mut wide = Session::new();
    wide.enter(1);
    racy_block(&mut wide, 0x5B_0000, 32);
    wide.leave();
    assert_eq!(wide.race_count(), 1);
}
