//! Shadow memory: three access dictionaries plus locker tables, and the
//! check-then-record protocol run on every memory operation.
//!
//! Reads and Writes hold the last race-relevant access per byte; Allocs
//! holds the allocation site covering each live byte.  A new read is
//! checked against previous writes and merged into Reads; a new write is
//! checked against previous reads and check-and-inserted into Writes.  A
//! previous access races with the current strand when the root of its set
//! is a P-bag, or, inside a parallel loop, when it was recorded under an
//! earlier version of the frame's iter-bag.

pub(crate) mod alloc;
pub(crate) mod dict;

use crate::access::{AccessKind, InstId, MemAccess};
use crate::callstack::{CallStack, CallStackArena};
use crate::lockset::{Intersection, LockSet, LockerList};
use crate::report::{AccessLoc, RaceKind, Reporter};
use crate::spbag::{DsArena, DsIndex, Version};
use dict::{AccessDict, Chunk, LockerDict, WriteTpl, LG_LINE_SIZE};

/// The bag the current strand records accesses under.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CurStrand {
    /// S-bag (or iter-bag, for loop frames) handle of the current frame.
    pub handle: DsIndex,
    /// The handle's version at the time of the access.
    pub version: Version,
    /// Set to the iter-bag handle when the current frame is a loop frame.
    pub iter: Option<DsIndex>,
}

/// Is `prev` logically parallel with the current strand?
///
/// True when the root of `prev`'s set is a P-bag; inside a loop frame,
/// also when `prev` was recorded under the live iter-bag with an older
/// version (a concurrent earlier iteration).
pub(crate) fn in_parallel(
    ds: &mut DsArena,
    cs: &mut CallStackArena,
    prev: &MemAccess,
    cur: &CurStrand,
) -> bool {
    let Some(func) = prev.func() else {
        return false;
    };
    let root = ds.find(cs, func);
    if ds.is_pbag(cs, root) {
        return true;
    }
    match cur.iter {
        Some(iterbag) => root == iterbag && prev.version() < cur.version,
        None => false,
    }
}

/// Borrowed detector state the protocol needs alongside the dictionaries.
pub(crate) struct Ctx<'a> {
    pub ds: &'a mut DsArena,
    pub cs: &'a mut CallStackArena,
    pub reporter: &'a mut Reporter,
    /// The current call stack, snapshotted into the second endpoint of any
    /// race reported.
    pub call_stack: CallStack,
}

fn loc_of_prev(ds: &DsArena, cs: &CallStackArena, prev: &MemAccess) -> AccessLoc {
    let frames = match prev.func() {
        Some(f) => cs.frames(ds.stack_of(f)),
        None => Vec::new(),
    };
    AccessLoc {
        id: prev.acc_id(),
        kind: prev.kind(),
        frames,
    }
}

fn loc_of_alloc(
    ds: &DsArena,
    cs: &CallStackArena,
    allocs: &AccessDict,
    addr: u64,
) -> Option<AccessLoc> {
    allocs.find(addr).map(|a| loc_of_prev(ds, cs, a))
}

pub(crate) struct ShadowMem {
    reads: AccessDict,
    writes: AccessDict,
    allocs: AccessDict,
    read_lockers: LockerDict,
    write_lockers: LockerDict,
    lockers_used: bool,
}

impl ShadowMem {
    pub fn new() -> Self {
        ShadowMem {
            reads: AccessDict::new(),
            writes: AccessDict::new(),
            allocs: AccessDict::new(),
            read_lockers: LockerDict::new(),
            write_lockers: LockerDict::new(),
            lockers_used: false,
        }
    }

    fn tpl(cur: &CurStrand, id: InstId, kind: AccessKind) -> WriteTpl {
        WriteTpl {
            access: MemAccess::new(cur.handle, cur.version, id, kind),
        }
    }

    // ---------------------------------------------------------------
    // Occupancy gate

    /// Mark the access's bytes occupied in the appropriate dictionary.
    /// False means every byte was already seen this strand.
    pub fn set_occupied(&mut self, is_read: bool, addr: u64, size: u64) -> bool {
        if is_read {
            self.reads.set_occupied(addr, size)
        } else {
            self.writes.set_occupied(addr, size)
        }
    }

    /// Fast-path variant for small aligned accesses.
    pub fn set_occupied_fast(&mut self, is_read: bool, addr: u64, size: u64) -> bool {
        if is_read {
            self.reads.set_occupied_fast(addr, size)
        } else {
            self.writes.set_occupied_fast(addr, size)
        }
    }

    /// Reset occupancy at a strand boundary.
    pub fn clear_occupied(&mut self) {
        self.reads.clear_occupied();
        self.writes.clear_occupied();
    }

    // ---------------------------------------------------------------
    // Determinacy-race protocol

    /// Check a new access against previous writes; report WR for a read,
    /// WW for a write-typed access.
    pub fn check_race_with_prev_write(
        &mut self,
        ctx: &mut Ctx<'_>,
        cur_is_read: bool,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
    ) {
        let ShadowMem { writes, allocs, .. } = self;
        let race_kind = if cur_is_read { RaceKind::Wr } else { RaceKind::Ww };
        let ds = &mut *ctx.ds;
        let cs = &mut *ctx.cs;
        let reporter = &mut *ctx.reporter;
        let call_stack = ctx.call_stack;
        writes.for_each_distinct(Chunk::new(addr, size), |acc_addr, prev| {
            if in_parallel(ds, cs, &prev, cur) {
                let first = loc_of_prev(ds, cs, &prev);
                let second = AccessLoc {
                    id,
                    kind,
                    frames: cs.frames(call_stack),
                };
                let alloc = loc_of_alloc(ds, cs, allocs, acc_addr);
                reporter.report_race(&first, &second, alloc.as_ref(), acc_addr, race_kind);
            }
        });
    }

    /// Check a new write-typed access against previous reads (RW races).
    pub fn check_race_with_prev_read(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
    ) {
        let ShadowMem { reads, allocs, .. } = self;
        let ds = &mut *ctx.ds;
        let cs = &mut *ctx.cs;
        let reporter = &mut *ctx.reporter;
        let call_stack = ctx.call_stack;
        reads.for_each_distinct(Chunk::new(addr, size), |acc_addr, prev| {
            if in_parallel(ds, cs, &prev, cur) {
                let first = loc_of_prev(ds, cs, &prev);
                let second = AccessLoc {
                    id,
                    kind,
                    frames: cs.frames(call_stack),
                };
                let alloc = loc_of_alloc(ds, cs, allocs, acc_addr);
                reporter.report_race(&first, &second, alloc.as_ref(), acc_addr, RaceKind::Rw);
            }
        });
    }

    /// Merge a new read into the Reads dictionary.
    pub fn update_with_read(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
    ) {
        let tpl = Self::tpl(cur, id, kind);
        self.reads.update_in_series(
            ctx.ds,
            ctx.cs,
            Chunk::new(addr, size),
            tpl,
            |ds, cs, prev| in_parallel(ds, cs, prev, cur),
        );
    }

    /// Combined check-and-insert of a new write into the Writes
    /// dictionary, reporting WW races against parallel previous writes.
    pub fn check_and_update_write(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
    ) {
        let ShadowMem { writes, allocs, .. } = self;
        let ds = &mut *ctx.ds;
        let cs = &mut *ctx.cs;
        let reporter = &mut *ctx.reporter;
        let call_stack = ctx.call_stack;
        let tpl = Self::tpl(cur, id, kind);
        writes.check_and_update(
            ds,
            cs,
            Chunk::new(addr, size),
            tpl,
            |ds, cs, prev| in_parallel(ds, cs, prev, cur),
            |ds, cs, acc_addr, _span, prev| {
                let first = loc_of_prev(ds, cs, &prev);
                let second = AccessLoc {
                    id,
                    kind,
                    frames: cs.frames(call_stack),
                };
                let alloc = loc_of_alloc(ds, cs, allocs, acc_addr);
                reporter.report_race(&first, &second, alloc.as_ref(), acc_addr, RaceKind::Ww);
            },
        );
    }

    // ---------------------------------------------------------------
    // Fast paths for small aligned power-of-two accesses

    /// Fast-path read: update Reads and check against the previous write,
    /// touching at most one slot in each dictionary.  Falls back to the
    /// slow path when the access straddles refined entries.
    pub fn check_read_fast(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
    ) {
        debug_assert!(size.is_power_of_two() && size <= 1 << LG_LINE_SIZE);
        let lg = size.trailing_zeros();

        // 0: no previous write line, 1: single-slot check, 2: slow path.
        let write_state = match self.writes.line_at(addr) {
            Some(line) if !line.is_empty() => {
                if 1u64 << line.lg_grain() == size {
                    1
                } else {
                    2
                }
            }
            _ => 0,
        };
        if write_state == 2 {
            self.check_race_with_prev_write(ctx, true, id, kind, addr, size, cur);
        }

        let read_slow = {
            let line = self.reads.line_refined(ctx.ds, ctx.cs, addr, lg);
            1u64 << line.lg_grain() != size
        };
        if read_slow {
            self.update_with_read(ctx, id, kind, addr, size, cur);
        } else {
            let tpl = Self::tpl(cur, id, kind);
            let prev = {
                let line = self.reads.line_refined(ctx.ds, ctx.cs, addr, lg);
                *line.entry(addr).unwrap()
            };
            if !prev.is_valid() || !in_parallel(ctx.ds, ctx.cs, &prev, cur) {
                let line = self.reads.line_refined(ctx.ds, ctx.cs, addr, lg);
                AccessDict::write_slot(line, ctx.ds, ctx.cs, addr, tpl);
            }
        }

        if write_state == 1 {
            let prev = self
                .writes
                .line_at(addr)
                .and_then(|l| l.entry(addr))
                .copied();
            if let Some(prev) = prev {
                if prev.is_valid() && in_parallel(ctx.ds, ctx.cs, &prev, cur) {
                    self.report_single(ctx, id, kind, addr, prev, RaceKind::Wr);
                }
            }
        }
    }

    /// Fast-path write: check-and-update Writes and check against the
    /// previous read, touching at most one slot in each dictionary.
    pub fn check_write_fast(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
    ) {
        debug_assert!(size.is_power_of_two() && size <= 1 << LG_LINE_SIZE);
        let lg = size.trailing_zeros();

        let read_state = match self.reads.line_at(addr) {
            Some(line) if !line.is_empty() => {
                if 1u64 << line.lg_grain() == size {
                    1
                } else {
                    2
                }
            }
            _ => 0,
        };
        if read_state == 2 {
            self.check_race_with_prev_read(ctx, id, kind, addr, size, cur);
        }

        let write_slow = {
            let line = self.writes.line_refined(ctx.ds, ctx.cs, addr, lg);
            1u64 << line.lg_grain() != size
        };
        if write_slow {
            self.check_and_update_write(ctx, id, kind, addr, size, cur);
        } else {
            let tpl = Self::tpl(cur, id, kind);
            let prev = {
                let line = self.writes.line_refined(ctx.ds, ctx.cs, addr, lg);
                *line.entry(addr).unwrap()
            };
            if prev.is_valid() && in_parallel(ctx.ds, ctx.cs, &prev, cur) {
                self.report_single(ctx, id, kind, addr, prev, RaceKind::Ww);
            } else {
                let line = self.writes.line_refined(ctx.ds, ctx.cs, addr, lg);
                AccessDict::write_slot(line, ctx.ds, ctx.cs, addr, tpl);
            }
        }

        if read_state == 1 {
            let prev = self
                .reads
                .line_at(addr)
                .and_then(|l| l.entry(addr))
                .copied();
            if let Some(prev) = prev {
                if prev.is_valid() && in_parallel(ctx.ds, ctx.cs, &prev, cur) {
                    self.report_single(ctx, id, kind, addr, prev, RaceKind::Rw);
                }
            }
        }
    }

    /// Report one race at `addr` between `prev` and the current access.
    fn report_single(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        prev: MemAccess,
        race_kind: RaceKind,
    ) {
        let first = loc_of_prev(ctx.ds, ctx.cs, &prev);
        let second = AccessLoc {
            id,
            kind,
            frames: ctx.cs.frames(ctx.call_stack),
        };
        let alloc = loc_of_alloc(ctx.ds, ctx.cs, &self.allocs, addr);
        ctx.reporter
            .report_race(&first, &second, alloc.as_ref(), addr, race_kind);
    }

    // ---------------------------------------------------------------
    // Data-race (lockset) protocol

    fn locker_access(
        cur: &CurStrand,
        id: InstId,
        kind: AccessKind,
    ) -> impl Fn(&mut DsArena) -> MemAccess + '_ {
        move |ds: &mut DsArena| {
            ds.inc_ref(cur.handle, 1);
            MemAccess::new(cur.handle, cur.version, id, kind)
        }
    }

    /// Does some locker of a parallel previous access have a lockset
    /// disjoint from the current one?
    fn data_race_with(
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        list: &LockerList,
        cur: &CurStrand,
        lockset: &LockSet,
    ) -> bool {
        for locker in list.iter() {
            if in_parallel(ds, cs, &locker.access, cur)
                && LockSet::intersect(&locker.lockset, lockset) == Intersection::EMPTY
            {
                return true;
            }
        }
        false
    }

    /// Record the current lockset against the bytes of a read.
    pub fn update_lockers_with_read(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
        lockset: &LockSet,
    ) {
        self.lockers_used = true;
        self.read_lockers.update_lockers(
            ctx.ds,
            ctx.cs,
            Chunk::new(addr, size),
            Self::locker_access(cur, id, kind),
            lockset,
            |ds, cs, prev| in_parallel(ds, cs, prev, cur),
        );
    }

    /// Check a locked access against previous reads, suppressing races
    /// whose locksets intersect.
    pub fn check_data_race_with_prev_read(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
        lockset: &LockSet,
    ) {
        let ShadowMem {
            reads,
            read_lockers,
            allocs,
            ..
        } = self;
        let ds = &mut *ctx.ds;
        let cs = &mut *ctx.cs;
        let reporter = &mut *ctx.reporter;
        let call_stack = ctx.call_stack;
        reads.for_each_valid(Chunk::new(addr, size), |acc_addr, span, prev| {
            if !in_parallel(ds, cs, &prev, cur) {
                return;
            }
            read_lockers.for_each_list(Chunk::new(acc_addr, span), |laddr, list| {
                let unsuppressed = match list {
                    None => true,
                    Some(list) => Self::data_race_with(ds, cs, list, cur, lockset),
                };
                if unsuppressed {
                    let first = loc_of_prev(ds, cs, &prev);
                    let second = AccessLoc {
                        id,
                        kind,
                        frames: cs.frames(call_stack),
                    };
                    let alloc = loc_of_alloc(ds, cs, allocs, laddr);
                    reporter.report_race(&first, &second, alloc.as_ref(), laddr, RaceKind::Rw);
                }
            });
        });
    }

    /// Check a locked access against previous writes, suppressing races
    /// whose locksets intersect.
    pub fn check_data_race_with_prev_write(
        &mut self,
        ctx: &mut Ctx<'_>,
        cur_is_read: bool,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
        lockset: &LockSet,
    ) {
        let ShadowMem {
            writes,
            write_lockers,
            allocs,
            ..
        } = self;
        let race_kind = if cur_is_read { RaceKind::Wr } else { RaceKind::Ww };
        let ds = &mut *ctx.ds;
        let cs = &mut *ctx.cs;
        let reporter = &mut *ctx.reporter;
        let call_stack = ctx.call_stack;
        writes.for_each_valid(Chunk::new(addr, size), |acc_addr, span, prev| {
            if !in_parallel(ds, cs, &prev, cur) {
                return;
            }
            write_lockers.for_each_list(Chunk::new(acc_addr, span), |laddr, list| {
                let unsuppressed = match list {
                    None => true,
                    Some(list) => Self::data_race_with(ds, cs, list, cur, lockset),
                };
                if unsuppressed {
                    let first = loc_of_prev(ds, cs, &prev);
                    let second = AccessLoc {
                        id,
                        kind,
                        frames: cs.frames(call_stack),
                    };
                    let alloc = loc_of_alloc(ds, cs, allocs, laddr);
                    reporter.report_race(&first, &second, alloc.as_ref(), laddr, race_kind);
                }
            });
        });
    }

    /// Combined check-and-insert of a locked write: like
    /// [`ShadowMem::check_and_update_write`] but races against parallel
    /// previous writes are suppressed when a locker's lockset intersects
    /// the current one.  The lockers for the written range are refreshed
    /// afterwards.
    pub fn check_data_race_and_update_write(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        cur: &CurStrand,
        lockset: &LockSet,
    ) {
        self.lockers_used = true;
        {
            let ShadowMem {
                writes,
                write_lockers,
                allocs,
                ..
            } = self;
            let ds = &mut *ctx.ds;
            let cs = &mut *ctx.cs;
            let reporter = &mut *ctx.reporter;
            let call_stack = ctx.call_stack;
            let tpl = Self::tpl(cur, id, kind);
            writes.check_and_update(
                ds,
                cs,
                Chunk::new(addr, size),
                tpl,
                |ds, cs, prev| in_parallel(ds, cs, prev, cur),
                |ds, cs, acc_addr, span, prev| {
                    write_lockers.for_each_list(Chunk::new(acc_addr, span), |laddr, list| {
                        let unsuppressed = match list {
                            None => true,
                            Some(list) => Self::data_race_with(ds, cs, list, cur, lockset),
                        };
                        if unsuppressed {
                            let first = loc_of_prev(ds, cs, &prev);
                            let second = AccessLoc {
                                id,
                                kind,
                                frames: cs.frames(call_stack),
                            };
                            let alloc = loc_of_alloc(ds, cs, allocs, laddr);
                            reporter.report_race(
                                &first,
                                &second,
                                alloc.as_ref(),
                                laddr,
                                RaceKind::Ww,
                            );
                        }
                    });
                },
            );
        }
        self.write_lockers.update_lockers(
            ctx.ds,
            ctx.cs,
            Chunk::new(addr, size),
            Self::locker_access(cur, id, kind),
            lockset,
            |ds, cs, prev| in_parallel(ds, cs, prev, cur),
        );
    }

    // ---------------------------------------------------------------
    // Allocation tracking and clearing

    /// Record the allocation site covering `[addr, addr+size)`.
    pub fn record_alloc(
        &mut self,
        ctx: &mut Ctx<'_>,
        addr: u64,
        size: u64,
        cur: &CurStrand,
        alloca_id: InstId,
    ) {
        let tpl = WriteTpl {
            access: MemAccess::new(cur.handle, cur.version, alloca_id, AccessKind::Alloc),
        };
        self.allocs
            .set_range(ctx.ds, ctx.cs, Chunk::new(addr, size), tpl);
    }

    /// Drop the allocation records covering `[addr, addr+size)`.
    pub fn clear_alloc(&mut self, ctx: &mut Ctx<'_>, addr: u64, size: u64) {
        self.allocs
            .clear_range(ctx.ds, ctx.cs, Chunk::new(addr, size));
    }

    /// Invalidate the read/write (and locker) records covering the range.
    pub fn clear(&mut self, ctx: &mut Ctx<'_>, addr: u64, size: u64) {
        let chunk = Chunk::new(addr, size);
        self.reads.clear_range(ctx.ds, ctx.cs, chunk);
        self.writes.clear_range(ctx.ds, ctx.cs, chunk);
        if self.lockers_used {
            self.read_lockers.clear_range(ctx.ds, ctx.cs, chunk);
            self.write_lockers.clear_range(ctx.ds, ctx.cs, chunk);
        }
    }

    /// Tear down every dictionary, releasing all held references.  Called
    /// once at detector shutdown.
    pub fn clear_all(&mut self, ctx: &mut Ctx<'_>) {
        self.reads.release_all(ctx.ds, ctx.cs);
        self.writes.release_all(ctx.ds, ctx.cs);
        self.allocs.release_all(ctx.ds, ctx.cs);
        self.read_lockers.release_all(ctx.ds, ctx.cs);
        self.write_lockers.release_all(ctx.ds, ctx.cs);
    }
}
