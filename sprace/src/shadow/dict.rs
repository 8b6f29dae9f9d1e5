//! The shadow-memory dictionary: pages of refinable lines keyed by address.
//!
//! A dictionary maps a 48-bit byte address to a summary record.  Pages
//! (covering 2^24 bytes each) hang off a hash table; each page holds 2^15
//! lines of 2^9 bytes.  A line starts at the coarsest grain, one record for
//! the whole line, and is refined to smaller power-of-two grains when a
//! narrower access lands on it, replicating existing records across the new
//! entries.  A per-line count of valid entries lets traversals skip empty
//! lines wholesale, and Reads/Writes pages carry a byte-granular occupancy
//! bitmap used to deduplicate repeated accesses within one strand.

use fxhash::FxHashMap;

use super::alloc::LinePool;
use crate::access::MemAccess;
use crate::callstack::CallStackArena;
use crate::lockset::{Intersection, Locker, LockerList, LockSet};
use crate::spbag::DsArena;

/// log2 of bytes per line.
pub(crate) const LG_LINE_SIZE: u32 = 9;
/// Bytes per line.
pub(crate) const LINE_SIZE: u64 = 1 << LG_LINE_SIZE;
/// log2 of lines per page.
pub(crate) const LG_LINES_PER_PAGE: u32 = 15;
/// log2 of bytes covered by one page.
pub(crate) const LG_PAGE_COVER: u32 = LG_LINE_SIZE + LG_LINES_PER_PAGE;

const LINES_PER_PAGE: usize = 1 << LG_LINES_PER_PAGE;
/// Occupancy words per page: one bit per byte covered.
const OCC_WORDS: usize = 1 << (LG_PAGE_COVER - 6);

pub(crate) fn byte_of(addr: u64) -> u64 {
    addr & (LINE_SIZE - 1)
}

fn line_of(addr: u64) -> usize {
    ((addr >> LG_LINE_SIZE) & ((1 << LG_LINES_PER_PAGE) - 1)) as usize
}

fn page_of(addr: u64) -> u64 {
    addr >> LG_PAGE_COVER
}

pub(crate) fn is_line_start(addr: u64) -> bool {
    byte_of(addr) == 0
}

fn occ_word_of(addr: u64) -> usize {
    ((addr >> 6) & (OCC_WORDS as u64 - 1)) as usize
}

/// A contiguous region of memory being processed, consumed front to back.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Chunk {
    pub addr: u64,
    pub size: u64,
}

impl Chunk {
    pub fn new(addr: u64, size: u64) -> Self {
        Chunk { addr, size }
    }

    pub fn is_empty(self) -> bool {
        self.size == 0
    }

    /// The remainder of this chunk after advancing to the next
    /// `2^lg_grain`-aligned address.
    pub fn next(self, lg_grain: u32) -> Chunk {
        let grain = 1u64 << lg_grain;
        let next_addr = (self.addr + grain) & !(grain - 1);
        let step = next_addr - self.addr;
        if step > self.size {
            Chunk {
                addr: next_addr,
                size: 0,
            }
        } else {
            Chunk {
                addr: next_addr,
                size: self.size - step,
            }
        }
    }

    /// The grain implied by this chunk's start (and, within a line, its
    /// end), capped at the line size.
    pub fn lg_grainsize(self) -> u32 {
        debug_assert!(self.addr != 0, "chunk at null address");
        let mut lg = self.addr.trailing_zeros().min(LG_LINE_SIZE);
        if self.size >= LINE_SIZE {
            return lg;
        }
        let next_line = (self.addr | (LINE_SIZE - 1)) + 1;
        if self.addr + self.size < next_line {
            lg = lg.min((self.addr + self.size).trailing_zeros());
        }
        lg
    }
}

/// What a dictionary stores per byte range.  Implementations manage the
/// disjoint-set reference counts of the handles they hold.
pub(crate) trait ShadowEntry: Default {
    fn is_valid(&self) -> bool;
    /// Copy this entry for replication across refined slots.
    fn replicate(&self, ds: &mut DsArena) -> Self;
    /// Invalidate this entry, dropping the references it held.
    fn release(&mut self, ds: &mut DsArena, cs: &mut CallStackArena);
}

impl ShadowEntry for MemAccess {
    fn is_valid(&self) -> bool {
        MemAccess::is_valid(self)
    }

    fn replicate(&self, ds: &mut DsArena) -> Self {
        if let Some(f) = self.func() {
            ds.inc_ref(f, 1);
        }
        *self
    }

    fn release(&mut self, ds: &mut DsArena, cs: &mut CallStackArena) {
        if let Some(f) = self.take_func() {
            ds.dec_ref(cs, f, 1);
        }
    }
}

impl ShadowEntry for LockerList {
    fn is_valid(&self) -> bool {
        LockerList::is_valid(self)
    }

    fn replicate(&self, ds: &mut DsArena) -> Self {
        let mut out = LockerList::default();
        let mut tail = &mut out.head;
        for locker in self.iter() {
            if let Some(f) = locker.access.func() {
                ds.inc_ref(f, 1);
            }
            *tail = Some(Box::new(Locker {
                access: locker.access,
                lockset: locker.lockset.clone(),
                next: None,
            }));
            tail = &mut tail.as_mut().unwrap().next;
        }
        out
    }

    fn release(&mut self, ds: &mut DsArena, cs: &mut CallStackArena) {
        let mut head = self.head.take();
        while let Some(mut locker) = head {
            locker.access.release(ds, cs);
            head = locker.next.take();
        }
    }
}

/// One line of shadow memory: a lazily-allocated array of records at the
/// line's current grain.
pub(crate) struct Line<T> {
    data: Option<Box<[T]>>,
    nonnull: u16,
    lg_grain: u8,
}

impl<T: ShadowEntry> Line<T> {
    fn new() -> Self {
        Line {
            data: None,
            nonnull: 0,
            lg_grain: LG_LINE_SIZE as u8,
        }
    }

    pub fn lg_grain(&self) -> u32 {
        self.lg_grain as u32
    }

    pub fn is_empty(&self) -> bool {
        self.nonnull == 0
    }

    pub fn is_materialized(&self) -> bool {
        self.data.is_some()
    }

    fn idx(&self, addr: u64) -> usize {
        (byte_of(addr) >> self.lg_grain()) as usize
    }

    pub fn materialize(&mut self, pool: &mut LinePool<T>) {
        debug_assert!(self.data.is_none());
        self.data = Some(pool.alloc(self.lg_grain()));
    }

    pub fn entry(&self, addr: u64) -> Option<&T> {
        let idx = self.idx(addr);
        self.data.as_ref().map(|d| &d[idx])
    }

    pub fn entry_mut(&mut self, addr: u64) -> &mut T {
        let idx = self.idx(addr);
        &mut self.data.as_mut().unwrap()[idx]
    }

    /// Reduce the line's grain, replicating existing records across the
    /// finer entries.
    pub fn refine(
        &mut self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        pool: &mut LinePool<T>,
        new_lg: u32,
    ) {
        debug_assert!(new_lg < self.lg_grain());
        let old_lg = self.lg_grain();
        let Some(mut old) = self.data.take() else {
            self.lg_grain = new_lg as u8;
            return;
        };

        let repl = 1usize << (old_lg - new_lg);
        let mut new_data = pool.alloc(new_lg);
        if self.nonnull > 0 {
            for (i, e) in old.iter().enumerate() {
                if e.is_valid() {
                    for slot in &mut new_data[repl * i..repl * (i + 1)] {
                        *slot = e.replicate(ds);
                    }
                }
            }
            self.nonnull *= repl as u16;
        }
        for e in old.iter_mut() {
            if e.is_valid() {
                e.release(ds, cs);
            }
        }
        pool.free(old);
        self.data = Some(new_data);
        self.lg_grain = new_lg as u8;
    }

    /// Invalidate everything in the line and return it to the coarsest
    /// grain.
    pub fn reset(&mut self, ds: &mut DsArena, cs: &mut CallStackArena, pool: &mut LinePool<T>) {
        if let Some(mut data) = self.data.take() {
            if self.nonnull > 0 {
                for e in data.iter_mut() {
                    if e.is_valid() {
                        e.release(ds, cs);
                    }
                }
            }
            pool.free(data);
        }
        self.nonnull = 0;
        self.lg_grain = LG_LINE_SIZE as u8;
    }

    /// Release one valid entry in place.
    fn clear_entry(&mut self, ds: &mut DsArena, cs: &mut CallStackArena, addr: u64) {
        let idx = self.idx(addr);
        let e = &mut self.data.as_mut().unwrap()[idx];
        debug_assert!(e.is_valid());
        e.release(ds, cs);
        self.nonnull -= 1;
    }
}

/// A page: 2^15 lines plus an optional occupancy bitmap.
pub(crate) struct Page<T> {
    lines: Box<[Line<T>]>,
    occupancy: Option<Box<[u64]>>,
}

impl<T: ShadowEntry> Page<T> {
    fn new() -> Box<Self> {
        Box::new(Page {
            lines: (0..LINES_PER_PAGE).map(|_| Line::new()).collect(),
            occupancy: None,
        })
    }

    pub fn line(&self, addr: u64) -> &Line<T> {
        &self.lines[line_of(addr)]
    }

    pub fn line_mut(&mut self, addr: u64) -> &mut Line<T> {
        &mut self.lines[line_of(addr)]
    }
}

/// Prepare the line containing `chunk.addr` for entry-grain writes: create
/// the page if needed, refine the line to the chunk's grain, and
/// materialize its array.
fn line_for_update<'a, T: ShadowEntry>(
    pages: &'a mut FxHashMap<u64, Box<Page<T>>>,
    pool: &mut LinePool<T>,
    ds: &mut DsArena,
    cs: &mut CallStackArena,
    chunk: Chunk,
) -> &'a mut Line<T> {
    let page = pages.entry(page_of(chunk.addr)).or_insert_with(Page::new);
    let line = page.line_mut(chunk.addr);
    let access_lg = chunk.lg_grainsize();
    if line.lg_grain() > access_lg {
        line.refine(ds, cs, pool, access_lg);
    }
    if !line.is_materialized() {
        line.materialize(pool);
    }
    line
}

/// A dictionary from byte addresses to `T` records.
pub(crate) struct Dict<T: ShadowEntry> {
    pages: FxHashMap<u64, Box<Page<T>>>,
    pool: LinePool<T>,
    /// Word-granular addresses whose occupancy bits are set for the
    /// current strand.
    touched_words: Vec<u64>,
}

impl<T: ShadowEntry> Dict<T> {
    pub fn new() -> Self {
        Dict {
            pages: FxHashMap::default(),
            pool: LinePool::new(),
            touched_words: Vec::new(),
        }
    }

    pub fn page(&self, addr: u64) -> Option<&Page<T>> {
        self.pages.get(&page_of(addr)).map(|p| &**p)
    }

    /// The record covering `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&T> {
        let line = self.page(addr)?.line(addr);
        if line.is_empty() {
            return None;
        }
        let e = line.entry(addr)?;
        e.is_valid().then_some(e)
    }

    // ---------------------------------------------------------------
    // Occupancy

    /// Mark the bytes of `[addr, addr+size)` occupied for the current
    /// strand.  Returns true if any byte was not already occupied; false
    /// means the whole access is redundant within this strand.
    pub fn set_occupied(&mut self, addr: u64, size: u64) -> bool {
        let Dict {
            pages,
            touched_words,
            ..
        } = self;
        let mut chunk = Chunk::new(addr, size);
        let mut found_unoccupied = false;
        while !chunk.is_empty() {
            let page = pages.entry(page_of(chunk.addr)).or_insert_with(Page::new);
            let occ = page
                .occupancy
                .get_or_insert_with(|| vec![0u64; OCC_WORDS].into_boxed_slice());
            let page_key = page_of(chunk.addr);
            loop {
                let bit = chunk.addr & 63;
                let mask = if chunk.size >= 64 {
                    u64::MAX << bit
                } else {
                    ((1u64 << chunk.size) - 1) << bit
                };
                let word = occ_word_of(chunk.addr);
                let cur = occ[word];
                if cur == 0 {
                    touched_words.push(chunk.addr);
                }
                if !cur & mask != 0 {
                    found_unoccupied = true;
                }
                occ[word] = cur | mask;
                chunk = chunk.next(6);
                if chunk.is_empty() || page_of(chunk.addr) != page_key {
                    break;
                }
            }
        }
        found_unoccupied
    }

    /// Single-word fast path of [`Dict::set_occupied`] for small aligned
    /// accesses.
    pub fn set_occupied_fast(&mut self, addr: u64, size: u64) -> bool {
        debug_assert!(size >= 1 && size <= 16 && addr & (size - 1) == 0);
        let Dict {
            pages,
            touched_words,
            ..
        } = self;
        let page = pages.entry(page_of(addr)).or_insert_with(Page::new);
        let occ = page
            .occupancy
            .get_or_insert_with(|| vec![0u64; OCC_WORDS].into_boxed_slice());
        let mask = ((1u64 << size) - 1) << (addr & 63);
        let word = occ_word_of(addr);
        let cur = occ[word];
        if cur == 0 {
            touched_words.push(addr);
        }
        occ[word] = cur | mask;
        !cur & mask != 0
    }

    /// Clear the occupancy words touched since the last strand boundary.
    pub fn clear_occupied(&mut self) {
        let Dict {
            pages,
            touched_words,
            ..
        } = self;
        for &addr in touched_words.iter() {
            if let Some(page) = pages.get_mut(&page_of(addr)) {
                if let Some(occ) = &mut page.occupancy {
                    occ[occ_word_of(addr)] = 0;
                }
            }
        }
        touched_words.clear();
    }

    // ---------------------------------------------------------------
    // Clearing

    /// Release every record in the dictionary and drop its pages.  Used at
    /// detector shutdown so the reference-count balance check can run.
    pub fn release_all(&mut self, ds: &mut DsArena, cs: &mut CallStackArena) {
        let Dict {
            pages,
            pool,
            touched_words,
        } = self;
        for page in pages.values_mut() {
            for line in page.lines.iter_mut() {
                line.reset(ds, cs, pool);
            }
        }
        pages.clear();
        touched_words.clear();
    }

    /// Invalidate every record covering `chunk`.
    pub fn clear_range(&mut self, ds: &mut DsArena, cs: &mut CallStackArena, chunk: Chunk) {
        let Dict { pages, pool, .. } = self;
        let mut chunk = chunk;
        while !chunk.is_empty() {
            let Some(page) = pages.get_mut(&page_of(chunk.addr)) else {
                chunk = chunk.next(LG_PAGE_COVER);
                continue;
            };
            let line = page.line_mut(chunk.addr);
            if line.is_empty() {
                chunk = chunk.next(LG_LINE_SIZE);
                continue;
            }
            let access_lg = chunk.lg_grainsize();
            if access_lg == LG_LINE_SIZE {
                line.reset(ds, cs, pool);
                chunk = chunk.next(LG_LINE_SIZE);
                continue;
            }
            if line.lg_grain() > access_lg {
                line.refine(ds, cs, pool, access_lg);
            }
            loop {
                let valid = line.entry(chunk.addr).map_or(false, |e| e.is_valid());
                if valid {
                    line.clear_entry(ds, cs, chunk.addr);
                    if line.is_empty() {
                        // The line just emptied; forget its refinement and
                        // skip to the next one.
                        line.reset(ds, cs, pool);
                        chunk = chunk.next(LG_LINE_SIZE);
                        break;
                    }
                }
                chunk = chunk.next(line.lg_grain());
                if chunk.is_empty() || is_line_start(chunk.addr) {
                    break;
                }
            }
        }
    }
}

pub(crate) type AccessDict = Dict<MemAccess>;
pub(crate) type LockerDict = Dict<LockerList>;

/// The new record applied slot by slot during an update.
#[derive(Clone, Copy)]
pub(crate) struct WriteTpl {
    pub access: MemAccess,
}

impl WriteTpl {
    fn write(
        &self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        line: &mut Line<MemAccess>,
        addr: u64,
    ) {
        if line.entry(addr).unwrap().is_valid() {
            line.entry_mut(addr).release(ds, cs);
        } else {
            line.nonnull += 1;
        }
        *line.entry_mut(addr) = ShadowEntry::replicate(&self.access, ds);
    }
}

impl AccessDict {
    /// Visit every valid record covering `chunk`, skipping runs of entries
    /// from the same set handle (replicas created by refinement).  Missing
    /// pages and empty lines are skipped wholesale.
    pub fn for_each_distinct(&self, chunk: Chunk, mut visit: impl FnMut(u64, MemAccess)) {
        let mut chunk = chunk;
        let mut prev: Option<MemAccess> = None;
        while !chunk.is_empty() {
            let Some(page) = self.page(chunk.addr) else {
                chunk = chunk.next(LG_PAGE_COVER);
                prev = None;
                continue;
            };
            let line = page.line(chunk.addr);
            if line.is_empty() {
                chunk = chunk.next(LG_LINE_SIZE);
                prev = None;
                continue;
            }
            match line.entry(chunk.addr) {
                Some(e) if e.is_valid() => {
                    let skip = prev.map_or(false, |p| p.same_source(e));
                    if !skip {
                        visit(chunk.addr, *e);
                    }
                    prev = Some(*e);
                }
                _ => {
                    prev = None;
                }
            }
            chunk = chunk.next(line.lg_grain());
        }
    }

    /// Overwrite every slot covering `chunk` unconditionally.  Whole-line
    /// spans coalesce the line back to the coarsest grain.
    pub fn set_range(
        &mut self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        chunk: Chunk,
        tpl: WriteTpl,
    ) {
        let Dict { pages, pool, .. } = self;
        let mut chunk = chunk;
        while !chunk.is_empty() {
            if chunk.lg_grainsize() == LG_LINE_SIZE {
                let page = pages.entry(page_of(chunk.addr)).or_insert_with(Page::new);
                let line = page.line_mut(chunk.addr);
                if line.lg_grain() != LG_LINE_SIZE {
                    line.reset(ds, cs, pool);
                }
                if !line.is_materialized() {
                    line.materialize(pool);
                }
                tpl.write(ds, cs, line, chunk.addr);
                chunk = chunk.next(LG_LINE_SIZE);
                continue;
            }
            let line = line_for_update(pages, pool, ds, cs, chunk);
            loop {
                tpl.write(ds, cs, line, chunk.addr);
                chunk = chunk.next(line.lg_grain());
                if chunk.is_empty() || is_line_start(chunk.addr) {
                    break;
                }
            }
        }
    }

    /// Merge a new access into the dictionary: slots that are empty or
    /// whose previous access is in series with the current strand are
    /// overwritten; slots holding a parallel previous access are left
    /// alone.
    pub fn update_in_series(
        &mut self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        chunk: Chunk,
        tpl: WriteTpl,
        mut in_parallel: impl FnMut(&mut DsArena, &mut CallStackArena, &MemAccess) -> bool,
    ) {
        let Dict { pages, pool, .. } = self;
        let mut chunk = chunk;
        while !chunk.is_empty() {
            let line = line_for_update(pages, pool, ds, cs, chunk);
            loop {
                let prev = *line.entry(chunk.addr).unwrap();
                if !prev.is_valid() || !in_parallel(ds, cs, &prev) {
                    tpl.write(ds, cs, line, chunk.addr);
                }
                chunk = chunk.next(line.lg_grain());
                if chunk.is_empty() || is_line_start(chunk.addr) {
                    break;
                }
            }
        }
    }

    /// Combined check-and-insert for a write access: parallel previous
    /// accesses are reported (once per distinct record) and kept; empty
    /// and in-series slots are overwritten.  `on_race` receives the
    /// position, the number of bytes the offending slot covers within the
    /// access, and the previous record.
    pub fn check_and_update(
        &mut self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        chunk: Chunk,
        tpl: WriteTpl,
        mut in_parallel: impl FnMut(&mut DsArena, &mut CallStackArena, &MemAccess) -> bool,
        mut on_race: impl FnMut(&mut DsArena, &mut CallStackArena, u64, u64, MemAccess),
    ) {
        let Dict { pages, pool, .. } = self;
        let mut chunk = chunk;
        let mut last_reported: Option<MemAccess> = None;
        while !chunk.is_empty() {
            let line = line_for_update(pages, pool, ds, cs, chunk);
            loop {
                let prev = *line.entry(chunk.addr).unwrap();
                if !prev.is_valid() {
                    tpl.write(ds, cs, line, chunk.addr);
                    last_reported = None;
                } else if in_parallel(ds, cs, &prev) {
                    let repeat = last_reported.map_or(false, |r| r.same_source(&prev));
                    if !repeat {
                        let nxt = chunk.next(line.lg_grain());
                        let span = if nxt.is_empty() {
                            chunk.size
                        } else {
                            nxt.addr - chunk.addr
                        };
                        on_race(ds, cs, chunk.addr, span, prev);
                    }
                    last_reported = Some(prev);
                } else {
                    tpl.write(ds, cs, line, chunk.addr);
                    last_reported = None;
                }
                chunk = chunk.next(line.lg_grain());
                if chunk.is_empty() || is_line_start(chunk.addr) {
                    break;
                }
            }
        }
    }

    /// Visit every valid record covering `chunk` without deduplicating
    /// replicated runs, passing the byte span each slot covers within the
    /// access.  Used by the data-race path, which pairs each record with
    /// the locker lists over its span.
    pub fn for_each_valid(&self, chunk: Chunk, mut visit: impl FnMut(u64, u64, MemAccess)) {
        let mut chunk = chunk;
        while !chunk.is_empty() {
            let Some(page) = self.page(chunk.addr) else {
                chunk = chunk.next(LG_PAGE_COVER);
                continue;
            };
            let line = page.line(chunk.addr);
            if line.is_empty() {
                chunk = chunk.next(LG_LINE_SIZE);
                continue;
            }
            if let Some(e) = line.entry(chunk.addr) {
                if e.is_valid() {
                    let nxt = chunk.next(line.lg_grain());
                    let span = if nxt.is_empty() {
                        chunk.size
                    } else {
                        nxt.addr - chunk.addr
                    };
                    visit(chunk.addr, span, *e);
                }
            }
            chunk = chunk.next(line.lg_grain());
        }
    }

    /// The line covering `addr`, if its page exists.  Fast-path helper.
    pub fn line_at(&self, addr: u64) -> Option<&Line<MemAccess>> {
        self.page(addr).map(|p| p.line(addr))
    }

    /// The line covering `addr`, refined down to `lg_grain` and
    /// materialized.  Fast-path helper.
    pub fn line_refined(
        &mut self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        addr: u64,
        lg_grain: u32,
    ) -> &mut Line<MemAccess> {
        let Dict { pages, pool, .. } = self;
        let page = pages.entry(page_of(addr)).or_insert_with(Page::new);
        let line = page.line_mut(addr);
        if line.lg_grain() > lg_grain {
            line.refine(ds, cs, pool, lg_grain);
        }
        if !line.is_materialized() {
            line.materialize(pool);
        }
        line
    }

    /// Write directly to the slot at `addr` in `line`; fast-path helper
    /// shared with the slow-path writer.
    pub fn write_slot(
        line: &mut Line<MemAccess>,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        addr: u64,
        tpl: WriteTpl,
    ) {
        tpl.write(ds, cs, line, addr);
    }
}

impl LockerDict {
    /// Update the locker lists covering `chunk` for a new access under
    /// `lockset`, pruning lockers made redundant by it.
    pub fn update_lockers(
        &mut self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        chunk: Chunk,
        make_access: impl Fn(&mut DsArena) -> MemAccess,
        lockset: &LockSet,
        mut in_parallel: impl FnMut(&mut DsArena, &mut CallStackArena, &MemAccess) -> bool,
    ) {
        let Dict { pages, pool, .. } = self;
        let mut chunk = chunk;
        while !chunk.is_empty() {
            let line = line_for_update(pages, pool, ds, cs, chunk);
            loop {
                let was_valid = line.entry(chunk.addr).unwrap().is_valid();
                // Prune series lockers whose lockset contains the new one,
                // and note whether a parallel locker already subsumes it.
                let mut redundant = false;
                {
                    let list = line.entry_mut(chunk.addr);
                    let mut slot = &mut list.head;
                    loop {
                        let Some(cur) = slot.as_deref() else {
                            break;
                        };
                        let result = LockSet::intersect(&cur.lockset, lockset);
                        let access = cur.access;
                        if !in_parallel(ds, cs, &access) {
                            if result.has(Intersection::L_SUPERSET_OF_R) {
                                let mut removed = slot.take().unwrap();
                                removed.access.release(ds, cs);
                                *slot = removed.next.take();
                                continue;
                            }
                        } else if result.has(Intersection::L_SUBSET_OF_R) {
                            redundant = true;
                        }
                        slot = &mut slot.as_mut().unwrap().next;
                    }
                    if !redundant {
                        list.insert(Box::new(Locker {
                            access: make_access(ds),
                            lockset: lockset.clone(),
                            next: None,
                        }));
                    }
                }
                let now_valid = line.entry(chunk.addr).unwrap().is_valid();
                match (was_valid, now_valid) {
                    (false, true) => line.nonnull += 1,
                    (true, false) => line.nonnull -= 1,
                    _ => {}
                }
                chunk = chunk.next(line.lg_grain());
                if chunk.is_empty() || is_line_start(chunk.addr) {
                    break;
                }
            }
        }
    }

    /// Visit the locker lists covering `chunk`.  Positions in existing
    /// lines with no list are reported as `None`; missing pages and empty
    /// lines are skipped, as the query traversal does.
    pub fn for_each_list(&self, chunk: Chunk, mut visit: impl FnMut(u64, Option<&LockerList>)) {
        let mut chunk = chunk;
        while !chunk.is_empty() {
            let Some(page) = self.page(chunk.addr) else {
                chunk = chunk.next(LG_PAGE_COVER);
                continue;
            };
            let line = page.line(chunk.addr);
            if line.is_empty() {
                chunk = chunk.next(LG_LINE_SIZE);
                continue;
            }
            match line.entry(chunk.addr) {
                Some(list) if list.is_valid() => visit(chunk.addr, Some(list)),
                _ => visit(chunk.addr, None),
            }
            chunk = chunk.next(line.lg_grain());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessKind;
    use crate::callstack::CallStack;
    use crate::spbag::DsIndex;

    fn arenas() -> (DsArena, CallStackArena) {
        (DsArena::new(), CallStackArena::new())
    }

    fn tpl(ds: &mut DsArena, cs: &mut CallStackArena, id: i64) -> (WriteTpl, DsIndex) {
        let h = ds.new_sbag(cs, CallStack::empty());
        (
            WriteTpl {
                access: MemAccess::new(h, 0, id, AccessKind::Rw),
            },
            h,
        )
    }

    #[test]
    fn chunk_grain_respects_start_and_end() {
        // 8 bytes at an 8-aligned address within one line.
        assert_eq!(Chunk::new(0x1000, 8).lg_grainsize(), 3);
        // Start implies 4, end implies 2.
        assert_eq!(Chunk::new(0x1004, 8).lg_grainsize(), 2);
        // A full line is capped at the line grain.
        assert_eq!(Chunk::new(0x1000, 512).lg_grainsize(), 9);
        // Large but misaligned.
        assert_eq!(Chunk::new(0x1001, 600).lg_grainsize(), 0);
    }

    #[test]
    fn chunk_next_aligns_forward() {
        let c = Chunk::new(0x1004, 100);
        let n = c.next(3);
        assert_eq!(n.addr, 0x1008);
        assert_eq!(n.size, 96);
        let n = c.next(9);
        assert_eq!(n.addr, 0x1200);
        assert!(n.is_empty());
    }

    #[test]
    fn set_then_find_roundtrip() {
        let (mut ds, mut cs) = arenas();
        let mut dict = AccessDict::new();
        let (t, h) = tpl(&mut ds, &mut cs, 7);
        dict.set_range(&mut ds, &mut cs, Chunk::new(0x4000, 4), t);
        let found = dict.find(0x4002).copied().unwrap();
        assert_eq!(found.acc_id(), 7);
        assert!(dict.find(0x4004).is_none());
        dict.clear_range(&mut ds, &mut cs, Chunk::new(0x4000, 4));
        assert!(dict.find(0x4000).is_none());
        ds.dec_ref(&mut cs, h, 1);
        #[cfg(debug_assertions)]
        assert_eq!(ds.live_nodes(), 0);
    }

    #[test]
    fn refinement_replicates_and_counts() {
        let (mut ds, mut cs) = arenas();
        let mut dict = AccessDict::new();
        let (coarse, h1) = tpl(&mut ds, &mut cs, 1);
        // A full-line write lands at the coarsest grain.
        dict.set_range(&mut ds, &mut cs, Chunk::new(0x2000, 512), coarse);
        // A narrow write refines the line; the old record must still cover
        // the untouched bytes.
        let (fine, h2) = tpl(&mut ds, &mut cs, 2);
        dict.set_range(&mut ds, &mut cs, Chunk::new(0x2100, 1), fine);
        assert_eq!(dict.find(0x2100).unwrap().acc_id(), 2);
        assert_eq!(dict.find(0x20FF).unwrap().acc_id(), 1);
        assert_eq!(dict.find(0x2101).unwrap().acc_id(), 1);
        dict.clear_range(&mut ds, &mut cs, Chunk::new(0x2000, 512));
        ds.dec_ref(&mut cs, h1, 1);
        ds.dec_ref(&mut cs, h2, 1);
        #[cfg(debug_assertions)]
        assert_eq!(ds.live_nodes(), 0);
    }

    #[test]
    fn occupancy_gate_deduplicates() {
        let mut dict = AccessDict::new();
        assert!(dict.set_occupied(0x3000, 8));
        assert!(!dict.set_occupied(0x3000, 8));
        assert!(dict.set_occupied(0x3004, 8));
        dict.clear_occupied();
        assert!(dict.set_occupied(0x3000, 8));
    }

    #[test]
    fn occupancy_spans_words() {
        let mut dict = AccessDict::new();
        assert!(dict.set_occupied(0x3020, 96));
        assert!(!dict.set_occupied(0x3040, 32));
        assert!(dict.set_occupied(0x307F, 2));
    }

    #[test]
    fn for_each_distinct_skips_replicas() {
        let (mut ds, mut cs) = arenas();
        let mut dict = AccessDict::new();
        let (t, h) = tpl(&mut ds, &mut cs, 3);
        dict.set_range(&mut ds, &mut cs, Chunk::new(0x5000, 16), t);
        // Punch a hole in the middle, splitting the record into replicas.
        dict.clear_range(&mut ds, &mut cs, Chunk::new(0x5004, 4));
        let mut seen = Vec::new();
        dict.for_each_distinct(Chunk::new(0x5000, 16), |addr, e| {
            seen.push((addr, e.acc_id()));
        });
        // One visit before the hole and one after.
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|&(_, id)| id == 3));
        dict.clear_range(&mut ds, &mut cs, Chunk::new(0x5000, 16));
        ds.dec_ref(&mut cs, h, 1);
    }

    #[test]
    fn update_in_series_respects_parallel_entries(){
        let (mut ds, mut cs) = arenas();
        let mut dict = AccessDict::new();
        let (t1, h1) = tpl(&mut ds, &mut cs, 1);
        dict.set_range(&mut ds, &mut cs, Chunk::new(0x6000, 8), t1);
        let (t2, h2) = tpl(&mut ds, &mut cs, 2);
        // Treat everything as parallel: the old record must survive.
        dict.update_in_series(&mut ds, &mut cs, Chunk::new(0x6000, 8), t2, |_, _, _| true);
        assert_eq!(dict.find(0x6000).unwrap().acc_id(), 1);
        // Treat everything as series: the record is replaced.
        dict.update_in_series(&mut ds, &mut cs, Chunk::new(0x6000, 8), t2, |_, _, _| false);
        assert_eq!(dict.find(0x6000).unwrap().acc_id(), 2);
        dict.clear_range(&mut ds, &mut cs, Chunk::new(0x6000, 8));
        ds.dec_ref(&mut cs, h1, 1);
        ds.dec_ref(&mut cs, h2, 1);
    }
}
