//! The detector: the frame-stack state machine over instrumentation
//! events, and the memory hooks that drive the race-check protocol.

use std::env;
use std::path::PathBuf;

use fxhash::FxHashMap;

use crate::access::{AccessKind, InstId};
use crate::callstack::{CallId, CallKind, CallStack, CallStackArena};
use crate::errors::{self, Diagnostic};
use crate::frame::{EntryKind, FrameData, FrameKind};
use crate::lockset::{LockId, LockSet, ATOMIC_LOCK_ID};
use crate::report::{RaceInfo, Reporter};
use crate::shadow::{Ctx, CurStrand, ShadowMem};
use crate::spbag::DsArena;
use crate::trace_event;

/// May-Access-Alias-in-Parallel hint pushed by the compiler before a call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Maap(u8);

impl Maap {
    pub const NO_ACCESS: Maap = Maap(0);
    pub const MOD: Maap = Maap(1);
    pub const REF: Maap = Maap(2);
    pub const MOD_REF: Maap = Maap(3);
    pub const NO_ALIAS: Maap = Maap(4);

    pub fn from_bits(bits: u8) -> Maap {
        Maap(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has(self, flag: Maap) -> bool {
        self.0 & flag.0 != 0
    }
}

/// Detector configuration, normally read from the environment once at
/// startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// Report destination (`SPRACE_OUT`); stderr when unset.
    pub out: Option<PathBuf>,
    /// Collect and print access-size histograms at exit (`SPRACE_STATS`).
    pub collect_stats: bool,
    /// Model atomics as accesses under the designated atomic lock
    /// (`SPRACE_CHECK_ATOMICS`, default on).
    pub check_atomics: bool,
    /// ANSI color override (`SPRACE_COLOR_REPORT`); autodetect when unset.
    pub color: Option<bool>,
    /// Raise `SIGTRAP` on each new race (`SPRACE_DEBUGGER`).
    pub debugger: bool,
    /// Replay mode: terse race log lines (`SPRACE_REPLAY`).
    pub replay: bool,
    /// Capture report output in memory instead of writing it anywhere.
    pub capture: bool,
}

impl Config {
    pub fn from_env() -> Config {
        let flag = |name: &str| env::var(name).map_or(false, |v| v != "0");
        Config {
            out: env::var_os("SPRACE_OUT").map(PathBuf::from),
            collect_stats: flag("SPRACE_STATS"),
            check_atomics: env::var("SPRACE_CHECK_ATOMICS").map_or(true, |v| v != "0"),
            color: env::var("SPRACE_COLOR_REPORT")
                .ok()
                .and_then(|v| match v.as_str() {
                    "0" => Some(false),
                    "1" => Some(true),
                    _ => None,
                }),
            debugger: env::var("SPRACE_DEBUGGER").map_or(false, |v| v == "1"),
            replay: flag("SPRACE_REPLAY"),
            capture: false,
        }
    }

    /// Configuration for tests: reports are captured in memory.
    pub fn capture() -> Config {
        Config {
            out: None,
            collect_stats: false,
            check_atomics: true,
            color: Some(false),
            debugger: false,
            replay: false,
            capture: true,
        }
    }
}

/// Basic counters, kept cheap enough to maintain unconditionally where the
/// test suite depends on them (iter-bag rotations); histograms only fill
/// in when stats collection is on.
#[derive(Default)]
struct Stats {
    strand_count: u64,
    total_reads: u64,
    total_writes: u64,
    reads_by_size: FxHashMap<u64, u64>,
    writes_by_size: FxHashMap<u64, u64>,
    strand_reads_by_size: FxHashMap<u64, u64>,
    strand_writes_by_size: FxHashMap<u64, u64>,
    max_reads_by_size: FxHashMap<u64, u64>,
    max_writes_by_size: FxHashMap<u64, u64>,
    iterbag_rotations: u64,
}

impl Stats {
    fn read(&mut self, size: u64) {
        self.total_reads += 1;
        *self.reads_by_size.entry(size).or_insert(0) += 1;
        *self.strand_reads_by_size.entry(size).or_insert(0) += 1;
    }

    fn write(&mut self, size: u64) {
        self.total_writes += 1;
        *self.writes_by_size.entry(size).or_insert(0) += 1;
        *self.strand_writes_by_size.entry(size).or_insert(0) += 1;
    }

    fn strand_boundary(&mut self) {
        self.strand_count += 1;
        for (&size, &count) in &self.strand_reads_by_size {
            let max = self.max_reads_by_size.entry(size).or_insert(0);
            *max = (*max).max(count);
        }
        self.strand_reads_by_size.clear();
        for (&size, &count) in &self.strand_writes_by_size {
            let max = self.max_writes_by_size.entry(size).or_insert(0);
            *max = (*max).max(count);
        }
        self.strand_writes_by_size.clear();
    }

    fn print(&self) {
        println!(",size (bytes),count");
        for (size, count) in &self.reads_by_size {
            println!("reads,{},{}", size, count);
        }
        println!("total reads,,{}", self.total_reads);
        for (size, count) in &self.writes_by_size {
            println!("writes,{},{}", size, count);
        }
        println!("total writes,,{}", self.total_writes);
        println!("total strands,,{}", self.strand_count);
        for (size, count) in &self.max_reads_by_size {
            println!("max reads,{},{}", size, count);
        }
        for (size, count) in &self.max_writes_by_size {
            println!("max writes,{},{}", size, count);
        }
        println!("iter-bag rotations,,{}", self.iterbag_rotations);
    }
}

/// The detector.  One instance observes one serial execution; every hook
/// corresponds to an instrumentation callback.
pub struct Detector {
    ds: DsArena,
    cs: CallStackArena,
    /// The current call stack (call, spawn and loop sites).
    call_stack: CallStack,
    /// The shadow stack of active frames; index 0 is the host context.
    frames: Vec<FrameData>,
    /// Interleaved `[high, low]` stack-pointer bounds per frame.
    sp_stack: Vec<u64>,
    stack_low_addr: u64,
    stack_high_addr: u64,
    shadow: ShadowMem,
    lockset: LockSet,
    reporter: Reporter,
    stats: Stats,
    frame_id: u64,
    start_new_loop: bool,
    check_atomics: bool,
    collect_stats: bool,
    /// Two entries per frame: the entry value and an aggressively-updated
    /// copy flipped by detaches and restored by a locally-synced sync.
    parallel_execution: Vec<bool>,
    /// Whether each pushed frame skipped SP-bag bookkeeping (non-spawning
    /// call entered while locally synced).
    frame_skipped: Vec<bool>,
    maaps: Vec<(InstId, Maap)>,
    maap_counts: Vec<u32>,
    /// Live heap allocations, address to size.
    malloc_sizes: FxHashMap<u64, u64>,
    checking_disabled: u32,
    finished: bool,
}

impl Detector {
    pub fn new(config: Config) -> Detector {
        let reporter = if config.capture {
            Reporter::buffered(config.replay)
        } else {
            Reporter::new(
                config.out.as_deref(),
                config.color,
                config.debugger,
                config.replay,
            )
        };
        let mut d = Detector {
            ds: DsArena::new(),
            cs: CallStackArena::new(),
            call_stack: CallStack::empty(),
            frames: Vec::new(),
            sp_stack: Vec::new(),
            stack_low_addr: u64::MAX,
            stack_high_addr: 0,
            shadow: ShadowMem::new(),
            lockset: LockSet::new(),
            reporter,
            stats: Stats::default(),
            frame_id: 0,
            start_new_loop: false,
            check_atomics: config.check_atomics,
            collect_stats: config.collect_stats,
            parallel_execution: vec![false],
            frame_skipped: Vec::new(),
            maaps: Vec::new(),
            maap_counts: Vec::new(),
            malloc_sizes: FxHashMap::default(),
            checking_disabled: 0,
            finished: false,
        };
        // The host context executing before the first tracked function.
        let sbag = d.ds.new_sbag(&mut d.cs, d.call_stack);
        let mut root = FrameData::new(0);
        root.frame_kind = FrameKind::Full;
        root.sbag = Some(sbag);
        d.frames.push(root);
        trace_event!("detector initialized");
        d
    }

    // ---------------------------------------------------------------
    // Small state queries

    fn cur_frame(&self) -> &FrameData {
        self.frames.last().expect("empty frame stack")
    }

    fn in_loop(&self) -> bool {
        self.cur_frame().frame_kind == FrameKind::Loop
    }

    fn handle_loop(&self) -> bool {
        self.in_loop() || self.start_new_loop
    }

    fn is_execution_parallel(&self) -> bool {
        *self.parallel_execution.last().expect("empty parallel stack")
    }

    /// A frame is locally synced when it is not a loop frame and holds no
    /// live P-bag: nothing it spawned is still outstanding.
    fn is_local_synced(&self) -> bool {
        let f = self.cur_frame();
        !f.is_loop_frame() && !f.has_pbags()
    }

    pub fn locks_held(&self) -> bool {
        !self.lockset.is_empty()
    }

    /// Nestable switch the shim uses to suppress hooks inside the tool.
    pub fn disable_checking(&mut self) {
        self.checking_disabled += 1;
    }

    pub fn enable_checking(&mut self) {
        if self.checking_disabled == 0 {
            errors::fatal("unbalanced enable_checking");
        }
        self.checking_disabled -= 1;
    }

    pub fn checking_enabled(&self) -> bool {
        self.checking_disabled == 0
    }

    /// The bag the current strand records accesses under, marking it used.
    fn strand_for_access(&mut self) -> CurStrand {
        let f = self.frames.last_mut().expect("empty frame stack");
        if f.is_loop_frame() {
            f.iterbag_used = true;
            let ib = f.iterbag.expect("loop frame without an iter-bag");
            CurStrand {
                handle: ib,
                version: self.ds.version(ib),
                iter: Some(ib),
            }
        } else {
            f.sbag_used = true;
            let sb = f.sbag.expect("frame without an S-bag");
            CurStrand {
                handle: sb,
                version: self.ds.version(sb),
                iter: None,
            }
        }
    }

    // ---------------------------------------------------------------
    // Frame-stack state machine

    fn start_new_function(&mut self, num_sync_reg: u32) {
        self.frame_id += 1;
        let mut frame = FrameData::new(self.frame_id);
        frame.sbag = Some(self.ds.new_sbag(&mut self.cs, self.call_stack));
        frame.pbags = vec![None; num_sync_reg as usize];
        self.frames.push(frame);
        trace_event!("enter frame {}", self.frame_id);
    }

    fn exit_function(&mut self) {
        let Some(mut frame) = self.frames.pop() else {
            errors::fatal("function exit on an empty frame stack");
        };
        frame.reset(&mut self.ds, &mut self.cs);
    }

    fn do_enter(&mut self, num_sync_reg: u32) {
        self.strand_boundary();
        self.start_new_function(num_sync_reg);
        let f = self.frames.last_mut().unwrap();
        f.entry_kind = EntryKind::Spawner;
        f.frame_kind = FrameKind::Shadow;
    }

    fn do_enter_helper(&mut self, num_sync_reg: u32) {
        self.start_new_function(num_sync_reg);
        let f = self.frames.last_mut().unwrap();
        f.entry_kind = EntryKind::Detacher;
        f.frame_kind = FrameKind::Shadow;
    }

    /// Everything that marks the boundary between two strands: bump the
    /// strand statistics and drop the per-strand occupancy bits.
    fn strand_boundary(&mut self) {
        if self.collect_stats {
            self.stats.strand_boundary();
        }
        self.shadow.clear_occupied();
    }

    fn do_detach(&mut self) {
        self.strand_boundary();
    }

    fn do_detach_continue(&mut self) {
        self.strand_boundary();
    }

    /// A P-bag slot of `self.frames[idx]`, created lazily.
    fn ensure_pbag(&mut self, idx: usize, sync_reg: usize) -> crate::spbag::DsIndex {
        if sync_reg >= self.frames[idx].pbags.len() {
            errors::fatal("sync region out of range");
        }
        if let Some(pb) = self.frames[idx].pbags[sync_reg] {
            return pb;
        }
        let pb = self.ds.new_pbag();
        trace_event!("frame {} creates P-bag {}", self.frames[idx].frame_id, sync_reg);
        self.frames[idx].pbags[sync_reg] = Some(pb);
        pb
    }

    /// Fold a returning child's bags into its parent.
    ///
    /// Returning from a detach: child S-bag and P-bags merge into the
    /// parent's P-bag for `sync_reg` (the child ran in parallel with the
    /// continuation).  Returning from a call: the child S-bag merges into
    /// the parent S-bag, and any live child P-bags into the parent P-bag.
    fn merge_bag_from_returning_child(&mut self, returning_from_detach: bool, sync_reg: u32) {
        let n = self.frames.len();
        if n < 2 {
            errors::fatal("function exit without a matching entry");
        }
        let (child_sbag, child_sbag_used, child_pbags) = {
            let child = &mut self.frames[n - 1];
            (
                child.sbag.take(),
                child.sbag_used,
                std::mem::take(&mut child.pbags),
            )
        };
        let sr = sync_reg as usize;

        if returning_from_detach {
            let parent_pbag = self.ensure_pbag(n - 2, sr);
            if child_sbag_used {
                if let Some(sb) = child_sbag {
                    self.ds.combine(&mut self.cs, parent_pbag, sb);
                }
            }
            for pb in child_pbags.iter().flatten() {
                self.ds.combine(&mut self.cs, parent_pbag, *pb);
            }
        } else {
            let parent_sbag = self.frames[n - 2]
                .sbag
                .unwrap_or_else(|| errors::fatal("parent frame without an S-bag"));
            if child_sbag_used {
                if let Some(sb) = child_sbag {
                    self.ds.combine(&mut self.cs, parent_sbag, sb);
                    self.frames[n - 2].sbag_used = true;
                }
            }
            if child_pbags.iter().any(Option::is_some) {
                let parent_pbag = self.ensure_pbag(n - 2, sr);
                for pb in child_pbags.iter().flatten() {
                    self.ds.combine(&mut self.cs, parent_pbag, *pb);
                }
            }
        }

        // Drop the child's handles; merged sets stay alive through the
        // parent's bags and any shadow-memory references.
        if let Some(sb) = child_sbag {
            self.ds.dec_ref(&mut self.cs, sb, 1);
        }
        for pb in child_pbags.into_iter().flatten() {
            self.ds.dec_ref(&mut self.cs, pb, 1);
        }
    }

    /// Passing a sync joins the P-bag for `sync_reg` back into the frame's
    /// S-bag.
    fn complete_sync(&mut self, sync_reg: u32) {
        let n = self.frames.len();
        let (sbag, pbag) = {
            let f = &mut self.frames[n - 1];
            if sync_reg as usize >= f.pbags.len() {
                errors::fatal("sync on an unknown sync region");
            }
            (
                f.sbag.unwrap_or_else(|| errors::fatal("sync in a frame without an S-bag")),
                f.pbags[sync_reg as usize].take(),
            )
        };
        if let Some(pb) = pbag {
            trace_event!("frame {} syncs region {}", self.frames[n - 1].frame_id, sync_reg);
            self.ds.combine(&mut self.cs, sbag, pb);
            self.frames[n - 1].sbag_used = true;
            self.ds.dec_ref(&mut self.cs, pb, 1);
        }
    }

    fn do_sync(&mut self, sync_reg: u32) {
        self.strand_boundary();
        self.complete_sync(sync_reg);
    }

    fn do_leave(&mut self, sync_reg: u32) {
        if self.frames.len() <= 1 {
            errors::fatal("leave without a matching enter");
        }
        self.strand_boundary();
        let from_detach = self.cur_frame().entry_kind == EntryKind::Detacher;
        trace_event!(
            "leave frame {} ({})",
            self.cur_frame().frame_id,
            if from_detach { "detach" } else { "call" }
        );
        self.merge_bag_from_returning_child(from_detach, sync_reg);
        self.exit_function();
    }

    fn create_iterbag(&mut self) {
        let sbag = self.cur_frame().sbag.expect("loop frame without an S-bag");
        let stack = self.ds.stack_of(sbag);
        let ib = self.ds.new_sbag(&mut self.cs, stack);
        let n = self.frames.len();
        self.frames[n - 1].set_iterbag(&mut self.ds, &mut self.cs, Some(ib));
    }

    fn do_loop_iteration_begin(&mut self, num_sync_reg: u32) {
        if self.start_new_loop {
            // First iteration: build the loop frame.
            self.do_enter_helper(num_sync_reg.max(1));
            let n = self.frames.len();
            self.frames[n - 1].frame_kind = FrameKind::Loop;
            self.create_iterbag();
            self.do_detach();
            self.start_new_loop = false;
        } else {
            if !self.in_loop() {
                errors::fatal("loop iteration outside a loop frame");
            }
            self.strand_boundary();
        }
    }

    fn do_loop_iteration_end(&mut self) {
        self.strand_boundary();
        if !self.in_loop() {
            errors::fatal("loop iteration end outside a loop frame");
        }
        let n = self.frames.len();
        let pbag = self.ensure_pbag(n - 1, 0);

        // Strands of this iteration join the loop's P-bag.
        let (sbag, sbag_used) = {
            let f = &self.frames[n - 1];
            (f.sbag.expect("loop frame without an S-bag"), f.sbag_used)
        };
        if sbag_used {
            self.ds.combine(&mut self.cs, pbag, sbag);
            let fresh = self.ds.new_sbag(&mut self.cs, self.call_stack);
            self.frames[n - 1].set_sbag(&mut self.ds, &mut self.cs, Some(fresh));
        }

        // Advance the iter-bag; on version wraparound, rotate it into the
        // P-bag and start a fresh one so stale versions cannot alias.
        let iterbag = self.frames[n - 1].iterbag.expect("loop frame without an iter-bag");
        if !self.ds.inc_version(iterbag) && self.frames[n - 1].iterbag_used {
            self.ds.combine(&mut self.cs, pbag, iterbag);
            self.create_iterbag();
            self.stats.iterbag_rotations += 1;
            trace_event!("iter-bag rotated in frame {}", self.frames[n - 1].frame_id);
        }
    }

    fn do_loop_end(&mut self, sync_reg: u32) {
        if !self.in_loop() {
            errors::fatal("loop end outside a loop frame");
        }
        let n = self.frames.len();
        let pbag = self.ensure_pbag(n - 1, 0);
        let iterbag = self.frames[n - 1].iterbag.expect("loop frame without an iter-bag");
        if self.frames[n - 1].iterbag_used {
            self.ds.combine(&mut self.cs, pbag, iterbag);
        }
        self.frames[n - 1].set_iterbag(&mut self.ds, &mut self.cs, None);
        self.do_leave(sync_reg);
    }

    fn record_call(&mut self, kind: CallKind, id: InstId) {
        self.call_stack = self.cs.push(self.call_stack, CallId::new(kind, id));
    }

    fn record_call_return(&mut self, kind: CallKind, id: InstId) {
        if !self.cs.tail_matches(self.call_stack, CallId::new(kind, id)) {
            errors::fatal("mismatched hooks around a call, spawn or loop site");
        }
        self.call_stack = self.cs.pop(self.call_stack);
    }

    // ---------------------------------------------------------------
    // Control-flow hooks

    pub fn func_entry(&mut self, func_id: InstId, bp: u64, sp: u64, may_spawn: bool, num_sync_reg: u32) {
        trace_event!("func_entry({func_id})");
        if bp > self.stack_high_addr {
            self.stack_high_addr = bp;
        }
        if sp < self.stack_low_addr {
            self.stack_low_addr = sp;
        }
        // One copy for the entry state, one updated aggressively by
        // detaches.
        let pe = self.is_execution_parallel();
        self.parallel_execution.push(pe);
        self.parallel_execution.push(pe);
        self.push_stack_frame(bp, sp);

        if !may_spawn && self.is_local_synced() {
            // A call into a non-spawning function while locally synced is
            // treated as inlined.
            self.frame_skipped.push(true);
            return;
        }
        self.frame_skipped.push(false);
        self.do_enter(num_sync_reg);
    }

    pub fn func_exit(&mut self, func_exit_id: InstId, func_id: InstId) {
        trace_event!("func_exit({func_exit_id}, {func_id})");
        let skipped = self
            .frame_skipped
            .pop()
            .unwrap_or_else(|| errors::fatal("function exit without a matching entry"));
        if !skipped {
            // A frame's orphaned children rejoin through sync region 0.
            self.do_leave(0);
        }
        self.parallel_execution.pop();
        self.parallel_execution.pop();
        self.pop_stack_frame();
    }

    pub fn before_call(&mut self, call_id: InstId, maap_count: u32) {
        self.maap_counts.push(maap_count);
        self.record_call(CallKind::Call, call_id);
    }

    pub fn after_call(&mut self, call_id: InstId, maap_count: u32) {
        if self.maap_counts.pop() != Some(maap_count) {
            errors::fatal("mismatched MAAP counts around a call");
        }
        for _ in 0..maap_count {
            self.maaps.pop();
        }
        self.record_call_return(CallKind::Call, call_id);
    }

    pub fn detach(&mut self, detach_id: InstId, _sync_reg: u32) {
        trace_event!("detach({detach_id})");
        // The continuation now runs in parallel with the spawned child.
        *self.parallel_execution.last_mut().unwrap() = true;
        if !self.handle_loop() {
            self.record_call(CallKind::Spawn, detach_id);
        }
    }

    pub fn task(
        &mut self,
        task_id: InstId,
        detach_id: InstId,
        bp: u64,
        sp: u64,
        num_sync_reg: u32,
        is_loop_body: bool,
    ) {
        trace_event!("task({task_id}, {detach_id})");
        if sp < self.stack_low_addr {
            self.stack_low_addr = sp;
        }
        self.push_stack_frame(bp, sp);

        if is_loop_body && self.handle_loop() {
            self.do_loop_iteration_begin(num_sync_reg);
            return;
        }

        let pe = self.is_execution_parallel();
        self.parallel_execution.push(pe);
        self.parallel_execution.push(pe);
        self.do_enter_helper(num_sync_reg);
        self.do_detach();
    }

    pub fn task_exit(
        &mut self,
        task_exit_id: InstId,
        task_id: InstId,
        detach_id: InstId,
        sync_reg: u32,
        is_loop_body: bool,
    ) {
        trace_event!("task_exit({task_exit_id}, {task_id}, {detach_id})");
        if is_loop_body && self.handle_loop() {
            self.do_loop_iteration_end();
        } else {
            self.do_leave(sync_reg);
            self.parallel_execution.pop();
            self.parallel_execution.pop();
        }
        self.pop_stack_frame();
    }

    pub fn detach_continue(
        &mut self,
        detach_continue_id: InstId,
        detach_id: InstId,
        sync_reg: u32,
        is_unwind: bool,
    ) {
        trace_event!("detach_continue({detach_continue_id}, {detach_id})");
        // An implicit sync occurs on entering the unwind destination of a
        // detach.
        if is_unwind {
            self.do_sync(sync_reg);
        }
        if !self.handle_loop() {
            self.record_call_return(CallKind::Spawn, detach_id);
            self.do_detach_continue();
        }
    }

    pub fn sync(&mut self, sync_id: InstId, sync_reg: u32) {
        trace_event!("sync({sync_id}, {sync_reg})");
        self.do_sync(sync_reg);
        // Once locally synced, execution drops back to the parallel state
        // the frame was entered with.
        if self.is_local_synced() {
            let n = self.parallel_execution.len();
            self.parallel_execution[n - 1] = self.parallel_execution[n - 2];
        }
    }

    pub fn before_loop(&mut self, loop_id: InstId) {
        trace_event!("before_loop({loop_id})");
        self.record_call(CallKind::Loop, loop_id);
        let pe = self.is_execution_parallel();
        self.parallel_execution.push(pe);
        self.parallel_execution.push(pe);
        self.start_new_loop = true;
    }

    pub fn after_loop(&mut self, loop_id: InstId, sync_reg: u32) {
        trace_event!("after_loop({loop_id})");
        self.do_loop_end(sync_reg);
        self.parallel_execution.pop();
        self.parallel_execution.pop();
        self.record_call_return(CallKind::Loop, loop_id);
    }

    // ---------------------------------------------------------------
    // Stack-extent tracking

    fn push_stack_frame(&mut self, bp: u64, sp: u64) {
        // High bound first, then the low bound, which reads and writes to
        // stack addresses extend downwards.
        self.sp_stack.push(bp);
        self.sp_stack.push(sp);
    }

    fn pop_stack_frame(&mut self) {
        let (Some(low), Some(high)) = (self.sp_stack.pop(), self.sp_stack.pop()) else {
            errors::fatal("mismatched enter and exit hooks");
        };
        if low > high {
            errors::fatal("stack-extent tracking out of order");
        }
        if high > low {
            // Dynamically-allocated stack memory dies with its frame.
            self.clear_shadow(low, high - low);
            self.clear_alloc(low, high - low);
        }
    }

    fn is_on_stack(&self, addr: u64) -> bool {
        addr >= self.stack_low_addr && addr <= self.stack_high_addr
    }

    fn advance_stack_frame(&mut self, addr: u64) {
        if let Some(head) = self.sp_stack.last_mut() {
            if addr < *head {
                *head = addr;
            }
        }
    }

    /// Restoring the stack pointer to a higher address frees the skipped
    /// range.
    pub fn restore_stack(&mut self, call_id: InstId, addr: u64) {
        let Some(&current) = self.sp_stack.last() else {
            return;
        };
        if addr > current {
            self.record_free(current, addr - current, call_id, AccessKind::StackFree);
            *self.sp_stack.last_mut().unwrap() = addr;
        }
    }

    // ---------------------------------------------------------------
    // Memory hooks

    pub fn load(&mut self, load_id: InstId, addr: u64, size: u64, alignment: u32, is_atomic: bool) {
        if is_atomic {
            self.atomic_read(load_id, addr, size, alignment);
        } else {
            self.record_read(load_id, AccessKind::Rw, addr, size, alignment);
        }
    }

    pub fn store(&mut self, store_id: InstId, addr: u64, size: u64, alignment: u32, is_atomic: bool) {
        if is_atomic {
            self.atomic_write(store_id, addr, size, alignment);
        } else {
            self.record_write(store_id, AccessKind::Rw, addr, size, alignment);
        }
    }

    /// Large loads come from memory intrinsics; the protocol is the same.
    pub fn large_load(&mut self, load_id: InstId, addr: u64, size: u64, is_atomic: bool) {
        self.load(load_id, addr, size, 0, is_atomic);
    }

    pub fn large_store(&mut self, store_id: InstId, addr: u64, size: u64, is_atomic: bool) {
        self.store(store_id, addr, size, 0, is_atomic);
    }

    pub fn atomic_read(&mut self, load_id: InstId, addr: u64, size: u64, alignment: u32) {
        if self.check_atomics {
            self.lockset.insert(ATOMIC_LOCK_ID);
            self.record_read(load_id, AccessKind::Rw, addr, size, alignment);
            self.lockset.remove(ATOMIC_LOCK_ID);
        } else {
            self.record_read(load_id, AccessKind::Rw, addr, size, alignment);
        }
    }

    pub fn atomic_write(&mut self, store_id: InstId, addr: u64, size: u64, alignment: u32) {
        if self.check_atomics {
            self.lockset.insert(ATOMIC_LOCK_ID);
            self.record_write(store_id, AccessKind::Rw, addr, size, alignment);
            self.lockset.remove(ATOMIC_LOCK_ID);
        } else {
            self.record_write(store_id, AccessKind::Rw, addr, size, alignment);
        }
    }

    /// Record a read-type access.  `kind` distinguishes plain loads from
    /// reads performed inside modeled library routines.
    pub fn record_read(&mut self, id: InstId, kind: AccessKind, addr: u64, size: u64, alignment: u32) {
        if !self.is_execution_parallel() {
            return;
        }
        if self.collect_stats {
            self.stats.read(size);
        }
        if self.is_on_stack(addr) {
            self.advance_stack_frame(addr);
        }
        if self.locks_held() {
            self.record_locked_mem(true, id, kind, addr, size);
        } else {
            self.record_mem(true, id, kind, addr, size, alignment);
        }
    }

    /// Record a write-type access.
    pub fn record_write(&mut self, id: InstId, kind: AccessKind, addr: u64, size: u64, alignment: u32) {
        if !self.is_execution_parallel() {
            return;
        }
        if self.collect_stats {
            self.stats.write(size);
        }
        if self.is_on_stack(addr) {
            self.advance_stack_frame(addr);
        }
        if self.locks_held() {
            self.record_locked_mem(false, id, kind, addr, size);
        } else {
            self.record_mem(false, id, kind, addr, size, alignment);
        }
    }

    fn record_mem(
        &mut self,
        is_read: bool,
        id: InstId,
        kind: AccessKind,
        addr: u64,
        size: u64,
        alignment: u32,
    ) {
        if size == 0 {
            return;
        }

        // Small statically-aligned accesses take the single-slot fast
        // path.
        let fast = alignment > 0
            && size <= alignment as u64
            && size <= 16
            && size.is_power_of_two()
            && addr & (size - 1) == 0;
        if fast {
            if self.shadow.set_occupied_fast(is_read, addr, size) {
                let cur = self.strand_for_access();
                let mut ctx = Ctx {
                    ds: &mut self.ds,
                    cs: &mut self.cs,
                    reporter: &mut self.reporter,
                    call_stack: self.call_stack,
                };
                if is_read {
                    self.shadow.check_read_fast(&mut ctx, id, kind, addr, size, &cur);
                } else {
                    self.shadow.check_write_fast(&mut ctx, id, kind, addr, size, &cur);
                }
            }
            return;
        }

        // Occupancy gate: an access fully covered by this strand's
        // previous accesses is redundant.
        if !self.shadow.set_occupied(is_read, addr, size) {
            return;
        }
        let cur = self.strand_for_access();
        let mut ctx = Ctx {
            ds: &mut self.ds,
            cs: &mut self.cs,
            reporter: &mut self.reporter,
            call_stack: self.call_stack,
        };
        if is_read {
            self.shadow.update_with_read(&mut ctx, id, kind, addr, size, &cur);
            self.shadow
                .check_race_with_prev_write(&mut ctx, true, id, kind, addr, size, &cur);
        } else {
            self.shadow
                .check_and_update_write(&mut ctx, id, kind, addr, size, &cur);
            self.shadow
                .check_race_with_prev_read(&mut ctx, id, kind, addr, size, &cur);
        }
    }

    fn record_locked_mem(&mut self, is_read: bool, id: InstId, kind: AccessKind, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        if !self.shadow.set_occupied(is_read, addr, size) {
            return;
        }
        let cur = self.strand_for_access();
        let mut ctx = Ctx {
            ds: &mut self.ds,
            cs: &mut self.cs,
            reporter: &mut self.reporter,
            call_stack: self.call_stack,
        };
        if is_read {
            self.shadow.update_with_read(&mut ctx, id, kind, addr, size, &cur);
            self.shadow
                .update_lockers_with_read(&mut ctx, id, kind, addr, size, &cur, &self.lockset);
            self.shadow.check_data_race_with_prev_write(
                &mut ctx,
                true,
                id,
                kind,
                addr,
                size,
                &cur,
                &self.lockset,
            );
        } else {
            self.shadow.check_data_race_and_update_write(
                &mut ctx,
                id,
                kind,
                addr,
                size,
                &cur,
                &self.lockset,
            );
            self.shadow.check_data_race_with_prev_read(
                &mut ctx,
                id,
                kind,
                addr,
                size,
                &cur,
                &self.lockset,
            );
        }
    }

    // ---------------------------------------------------------------
    // Allocation hooks

    /// Record the allocation site covering a range of live bytes.
    pub fn record_alloc(&mut self, addr: u64, size: u64, alloca_id: InstId) {
        if size == 0 {
            return;
        }
        let cur = self.strand_for_access();
        let mut ctx = Ctx {
            ds: &mut self.ds,
            cs: &mut self.cs,
            reporter: &mut self.reporter,
            call_stack: self.call_stack,
        };
        self.shadow.record_alloc(&mut ctx, addr, size, &cur, alloca_id);
    }

    /// A free is a write to the freed bytes: later parallel accesses to
    /// them race against it, which the reporter renders as a
    /// use-after-free.
    pub fn record_free(&mut self, addr: u64, size: u64, id: InstId, kind: AccessKind) {
        if size == 0 {
            return;
        }
        {
            let mut ctx = Ctx {
                ds: &mut self.ds,
                cs: &mut self.cs,
                reporter: &mut self.reporter,
                call_stack: self.call_stack,
            };
            self.shadow.clear_alloc(&mut ctx, addr, size);
        }
        if self.locks_held() {
            self.record_locked_mem(false, id, kind, addr, size);
        } else {
            self.record_mem(false, id, kind, addr, size, 0);
        }
    }

    /// Invalidate the read/write shadow for a range.
    pub fn clear_shadow(&mut self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut ctx = Ctx {
            ds: &mut self.ds,
            cs: &mut self.cs,
            reporter: &mut self.reporter,
            call_stack: self.call_stack,
        };
        self.shadow.clear(&mut ctx, addr, size);
    }

    /// Drop allocation records for a range.
    pub fn clear_alloc(&mut self, addr: u64, size: u64) {
        if size == 0 {
            return;
        }
        let mut ctx = Ctx {
            ds: &mut self.ds,
            cs: &mut self.cs,
            reporter: &mut self.reporter,
            call_stack: self.call_stack,
        };
        self.shadow.clear_alloc(&mut ctx, addr, size);
    }

    /// Stack allocation: record the site and forget any stale shadow for
    /// the reused bytes.  Alloca ids are doubled to keep them disjoint
    /// from allocation-function ids.
    pub fn after_alloca(&mut self, alloca_id: InstId, addr: u64, size: u64) {
        if addr < self.stack_low_addr {
            self.stack_low_addr = addr;
        }
        self.record_alloc(addr, size, 2 * alloca_id);
        self.clear_shadow(addr, size);
        self.advance_stack_frame(addr);
    }

    /// Heap allocation function: malloc/calloc land here with
    /// `oldaddr == 0`; realloc passes the old block.
    pub fn after_allocfn(&mut self, allocfn_id: InstId, addr: u64, size: u64, oldaddr: u64) {
        trace_event!("allocfn({allocfn_id}, {addr:#x}, {size}, old {oldaddr:#x})");
        let alloc_id = 2 * allocfn_id + 1;

        if oldaddr != 0 {
            let old_size = self.malloc_sizes.get(&oldaddr).copied();
            if oldaddr != addr {
                // The allocation moved.
                if size > 0 {
                    self.record_alloc(addr, size, alloc_id);
                    self.clear_shadow(addr, size);
                    self.malloc_sizes.insert(addr, size);
                }
                if let Some(old_size) = old_size {
                    if !self.is_execution_parallel() {
                        self.clear_alloc(oldaddr, old_size);
                        self.clear_shadow(oldaddr, old_size);
                    } else {
                        self.record_free(oldaddr, old_size, allocfn_id, AccessKind::Realloc);
                    }
                    self.malloc_sizes.remove(&oldaddr);
                }
            } else {
                // Adjusted in place.
                if let Some(old_size) = old_size {
                    if old_size < size {
                        self.clear_shadow(addr + old_size, size - old_size);
                    } else if old_size > size {
                        // The tail of the block is gone; in parallel that
                        // is a free someone might still race with.
                        if !self.is_execution_parallel() {
                            self.clear_alloc(addr + size, old_size - size);
                            self.clear_shadow(addr + size, old_size - size);
                        } else {
                            self.record_free(
                                addr + size,
                                old_size - size,
                                allocfn_id,
                                AccessKind::Realloc,
                            );
                        }
                    }
                    self.record_alloc(addr, size, alloc_id);
                }
                self.malloc_sizes.insert(addr, size);
            }
            return;
        }

        // A zero-size allocation may return null or an unusable pointer;
        // either way there is nothing to track.
        if size == 0 {
            return;
        }
        self.malloc_sizes.insert(addr, size);
        self.record_alloc(addr, size, alloc_id);
        self.clear_shadow(addr, size);
    }

    pub fn after_free(&mut self, free_id: InstId, ptr: u64) {
        trace_event!("free({free_id}, {ptr:#x})");
        let Some(size) = self.malloc_sizes.remove(&ptr) else {
            return;
        };
        if !self.is_execution_parallel() {
            self.clear_alloc(ptr, size);
            self.clear_shadow(ptr, size);
        } else {
            self.record_free(ptr, size, free_id, AccessKind::Free);
        }
    }

    // ---------------------------------------------------------------
    // Locks and MAAP hints

    pub fn acquire_lock(&mut self, lock_id: LockId) {
        self.lockset.insert(lock_id);
    }

    pub fn release_lock(&mut self, lock_id: LockId) {
        if !self.lockset.remove(lock_id) {
            errors::warn(&Diagnostic::UnknownLock {
                op: "release",
                mutex: lock_id,
            });
        }
    }

    pub fn begin_atomic(&mut self) {
        self.acquire_lock(ATOMIC_LOCK_ID);
    }

    pub fn end_atomic(&mut self) {
        self.release_lock(ATOMIC_LOCK_ID);
    }

    pub fn set_maap(&mut self, value: Maap, id: InstId) {
        self.maaps.push((id, value));
    }

    /// The `idx`-th hint pushed for call site `id`; conservatively ModRef
    /// when the compiler supplied none.
    pub fn get_maap(&self, id: InstId, idx: u32) -> Maap {
        self.maaps
            .iter()
            .filter(|(eid, _)| *eid == id)
            .map(|(_, v)| *v)
            .nth(idx as usize)
            .unwrap_or(Maap::MOD_REF)
    }

    // ---------------------------------------------------------------
    // Results and teardown

    pub fn race_count(&self) -> usize {
        self.reporter.race_count()
    }

    pub fn duplicate_count(&self) -> u32 {
        self.reporter.duplicate_count()
    }

    pub fn races(&self) -> impl Iterator<Item = &RaceInfo> {
        self.reporter.races()
    }

    /// How many times an iter-bag wrapped its version counter and was
    /// rotated into its loop's P-bag.
    pub fn iterbag_rotations(&self) -> u64 {
        self.stats.iterbag_rotations
    }

    /// Print the report summary (and statistics, if collecting) and tear
    /// down all detector state.  Idempotent.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.reporter.print_summary();
        if self.collect_stats {
            self.stats.print();
        }

        while let Some(mut frame) = self.frames.pop() {
            frame.reset(&mut self.ds, &mut self.cs);
        }
        {
            let mut ctx = Ctx {
                ds: &mut self.ds,
                cs: &mut self.cs,
                reporter: &mut self.reporter,
                call_stack: self.call_stack,
            };
            self.shadow.clear_all(&mut ctx);
        }
        self.cs.release(self.call_stack);
        self.call_stack = CallStack::empty();

        #[cfg(debug_assertions)]
        {
            if self.ds.live_nodes() != 0 {
                eprintln!(
                    "sprace: {} disjoint-set nodes leaked at teardown",
                    self.ds.live_nodes()
                );
            }
            if self.cs.live_nodes() != 0 {
                eprintln!(
                    "sprace: {} call-stack nodes leaked at teardown",
                    self.cs.live_nodes()
                );
            }
        }
    }

    /// The captured report text of a `Config::capture()` detector.
    pub fn take_report_output(&mut self) -> String {
        self.reporter.take_output()
    }
}
