//! End-to-end scenarios: hand-written instrumentation traces of small
//! programs with known race sets.

use sprace::{AccessKind, RaceKind};
use tests::Session;

/// `int s = 0; cilk_for (i = 0..N) s += i;`: every iteration loads and
/// stores `s`, so exactly two distinct races exist: the body's store
/// against a later iteration's load, and against its store.
#[test]
fn cilk_for_sum_races_on_accumulator() {
    let mut s = Session::new();
    let sum = 0x10_0000;
    s.enter(1);
    let l = s.loop_begin();
    let (load_id, store_id) = (s.id(), s.id());
    for _ in 0..10_000 {
        s.iter_begin(&l);
        s.det.load(load_id, sum, 4, 4, false);
        s.det.store(store_id, sum, 4, 4, false);
        s.iter_end(&l);
    }
    s.loop_end(&l, 0);
    s.sync(0);
    s.leave();

    assert_eq!(s.race_count(), 2);
    let kinds: Vec<RaceKind> = s.det.races().map(|r| r.kind()).collect();
    assert!(kinds.contains(&RaceKind::Ww));
    assert!(kinds.iter().any(|k| matches!(k, RaceKind::Wr | RaceKind::Rw)));
    for race in s.det.races() {
        assert_eq!(race.addr(), sum);
    }
    // 10000 iterations re-detect the same two races over and over.
    assert!(s.duplicate_count() > 0);
}

/// The same loop with the body guarded by a mutex: every pair of
/// conflicting accesses shares a lock, so nothing is reported.
#[test]
fn locked_sum_is_race_free() {
    let mut s = Session::new();
    let sum = 0x11_0000;
    let mutex = 7;
    s.enter(1);
    let l = s.loop_begin();
    let (load_id, store_id) = (s.id(), s.id());
    for _ in 0..1_000 {
        s.iter_begin(&l);
        s.det.acquire_lock(mutex);
        s.det.load(load_id, sum, 4, 4, false);
        s.det.store(store_id, sum, 4, 4, false);
        s.det.release_lock(mutex);
        s.iter_end(&l);
    }
    s.loop_end(&l, 0);
    s.sync(0);
    s.leave();

    assert_eq!(s.race_count(), 0);
}

/// Recursive divide-and-conquer reduction: every leaf writes its own
/// slot, and the combine step runs after the sync.  No races.
#[test]
fn parallel_divide_sum_is_race_free() {
    fn divide(s: &mut Session, base: u64, lo: u64, hi: u64) {
        if hi - lo == 1 {
            let slot = base + lo * 8;
            s.write(slot, 8);
            s.read(slot, 8);
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let detach_id = s.spawn_begin(0);
        divide(s, base, lo, mid);
        s.spawn_end(detach_id, 0);
        {
            let call_id = s.call();
            s.enter(1);
            divide(s, base, mid, hi);
            s.leave();
            s.ret(call_id);
        }
        s.sync(0);
        // Combine the two halves in series.
        s.read(base + lo * 8, 8);
        s.read(base + mid * 8, 8);
        s.write(base + lo * 8, 8);
    }

    let mut s = Session::new();
    s.enter(1);
    divide(&mut s, 0x12_0000, 0, 32);
    s.leave();
    assert_eq!(s.race_count(), 0);
}

/// `x = malloc(8); cilk_spawn write x[0..8]; x = realloc(x, 4);`: the
/// shrink discards x[4..8] while the spawned write to them is still
/// outstanding: a Realloc-typed race on exactly that tail.
#[test]
fn realloc_narrowing_races_with_spawned_write() {
    let mut s = Session::new();
    let x = 0x20_0000;
    s.enter(1);
    s.det.after_allocfn(100, x, 8, 0);
    let detach_id = s.spawn_begin(0);
    let write_id = s.write(x, 8);
    s.spawn_end(detach_id, 0);
    // Shrink in place while the spawned write is unsynced.
    s.det.after_allocfn(101, x, 4, x);
    s.sync(0);
    s.leave();

    assert_eq!(s.race_count(), 1);
    let race = s.det.races().next().unwrap();
    assert_eq!(race.kind(), RaceKind::Ww);
    assert_eq!(race.first_id(), write_id);
    assert_eq!(race.second_kind(), AccessKind::Realloc);
    // The race lands on the discarded tail x[4..8].
    assert!(race.addr() >= x + 4 && race.addr() < x + 8);
}

/// One strand runs `strcpy(cpy, src)`, a parallel strand runs
/// `strdup(cpy)`: the library read of `cpy` races with the library write.
#[test]
fn strcpy_strdup_library_race() {
    let mut s = Session::new();
    let (src, cpy, dup) = (0x30_0000, 0x30_1000, 0x30_2000);
    let len = 16;
    s.enter(1);
    // Spawned strand: strcpy(cpy, src).
    let detach_id = s.spawn_begin(0);
    let read_src = s.id();
    s.det.record_read(read_src, AccessKind::FnRw, src, len, 0);
    let write_cpy = s.id();
    s.det.record_write(write_cpy, AccessKind::FnRw, cpy, len, 0);
    s.spawn_end(detach_id, 0);
    // Continuation: strdup(cpy) reads cpy and writes a fresh block.
    let strdup_id = s.id();
    s.det.record_read(strdup_id, AccessKind::Alloc, cpy, len, 0);
    s.det.after_allocfn(strdup_id, dup, len, 0);
    s.det.record_write(strdup_id, AccessKind::Alloc, dup, len, 0);
    s.sync(0);
    s.leave();

    assert_eq!(s.race_count(), 1);
    let race = s.det.races().next().unwrap();
    assert_eq!(race.kind(), RaceKind::Wr);
    assert_eq!(race.first_id(), write_cpy);
    assert_eq!(race.second_id(), strdup_id);
    assert!(race.addr() >= cpy && race.addr() < cpy + len);
}

/// A parallel loop of 70,000 one-byte writes to distinct addresses: no
/// races, and the 16-bit iter-bag version counter must wrap at least
/// once, rotating the iter-bag.
#[test]
fn loop_version_wrap_stays_race_free() {
    let mut s = Session::new();
    let base = 0x40_0000;
    s.enter(1);
    let l = s.loop_begin();
    let store_id = s.id();
    for i in 0..70_000u64 {
        s.iter_begin(&l);
        s.det.store(store_id, base + i, 1, 1, false);
        s.iter_end(&l);
    }
    s.loop_end(&l, 0);
    s.sync(0);
    s.leave();

    assert_eq!(s.race_count(), 0);
    assert!(s.det.iterbag_rotations() >= 1);
}
