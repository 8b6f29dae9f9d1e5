//! Harness for driving the detector with hand-written instrumentation
//! traces.
//!
//! A [`Session`] wraps a capturing [`Detector`] and hands out fresh
//! instruction ids, so tests read like the event stream a compiled
//! program would emit.  Memory-access instructions that execute more than
//! once (loop bodies, repeated blocks) must reuse their ids; allocate
//! those up front with [`Session::id`] and call the detector hooks
//! directly.

use sprace::{Config, Detector, InstId};

pub struct Session {
    pub det: Detector,
    next_id: InstId,
}

/// The fixed ids of one parallel-loop construct.
pub struct LoopIds {
    pub loop_id: InstId,
    pub detach_id: InstId,
    pub task_id: InstId,
    pub task_exit_id: InstId,
    pub detach_continue_id: InstId,
}

impl Session {
    pub fn new() -> Session {
        Session::with_config(Config::capture())
    }

    pub fn with_config(config: Config) -> Session {
        Session {
            det: Detector::new(config),
            next_id: 1,
        }
    }

    /// A fresh instruction id.
    pub fn id(&mut self) -> InstId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ---------------------------------------------------------------
    // Control flow

    /// Enter a function that may spawn, with `num_sync_reg` sync regions.
    pub fn enter(&mut self, num_sync_reg: u32) {
        let id = self.id();
        self.det.func_entry(id, 0, 0, true, num_sync_reg);
    }

    pub fn leave(&mut self) {
        let id = self.id();
        self.det.func_exit(id, 0);
    }

    /// A call site around a nested function; pair with [`Session::ret`].
    pub fn call(&mut self) -> InstId {
        let id = self.id();
        self.det.before_call(id, 0);
        id
    }

    pub fn ret(&mut self, call_id: InstId) {
        self.det.after_call(call_id, 0);
    }

    /// Spawn a task: detach in the parent, then enter the task body.
    /// Everything until [`Session::spawn_end`] runs in the child.
    pub fn spawn_begin(&mut self, sync_reg: u32) -> InstId {
        let detach_id = self.id();
        self.det.detach(detach_id, sync_reg);
        let task_id = self.id();
        self.det.task(task_id, detach_id, 0, 0, 1, false);
        detach_id
    }

    /// Leave the task body and return to the parent's continuation.
    pub fn spawn_end(&mut self, detach_id: InstId, sync_reg: u32) {
        let task_exit_id = self.id();
        self.det.task_exit(task_exit_id, 0, detach_id, sync_reg, false);
        let dc_id = self.id();
        self.det.detach_continue(dc_id, detach_id, sync_reg, false);
    }

    pub fn sync(&mut self, sync_reg: u32) {
        let id = self.id();
        self.det.sync(id, sync_reg);
    }

    /// Open a parallel loop, allocating the construct's fixed ids.
    pub fn loop_begin(&mut self) -> LoopIds {
        let ids = LoopIds {
            loop_id: self.id(),
            detach_id: self.id(),
            task_id: self.id(),
            task_exit_id: self.id(),
            detach_continue_id: self.id(),
        };
        self.det.before_loop(ids.loop_id);
        ids
    }

    pub fn iter_begin(&mut self, l: &LoopIds) {
        self.det.detach(l.detach_id, 0);
        self.det.task(l.task_id, l.detach_id, 0, 0, 1, true);
    }

    pub fn iter_end(&mut self, l: &LoopIds) {
        self.det
            .task_exit(l.task_exit_id, l.task_id, l.detach_id, 0, true);
        self.det
            .detach_continue(l.detach_continue_id, l.detach_id, 0, false);
    }

    pub fn loop_end(&mut self, l: &LoopIds, sync_reg: u32) {
        self.det.after_loop(l.loop_id, sync_reg);
    }

    // ---------------------------------------------------------------
    // Memory

    /// An aligned load with a fresh instruction id.
    pub fn read(&mut self, addr: u64, size: u64) -> InstId {
        let id = self.id();
        self.det.load(id, addr, size, size as u32, false);
        id
    }

    /// An aligned store with a fresh instruction id.
    pub fn write(&mut self, addr: u64, size: u64) -> InstId {
        let id = self.id();
        self.det.store(id, addr, size, size as u32, false);
        id
    }

    // ---------------------------------------------------------------
    // Results

    pub fn race_count(&self) -> usize {
        self.det.race_count()
    }

    pub fn duplicate_count(&self) -> u32 {
        self.det.duplicate_count()
    }

    /// `(smaller id, larger id, race kind as reported)` per distinct race,
    /// sorted: the shape used to compare runs for equivalence.
    pub fn race_pairs(&self) -> Vec<(InstId, InstId)> {
        let mut pairs: Vec<_> = self
            .det
            .races()
            .map(|r| {
                let (a, b) = (r.first_id(), r.second_id());
                (a.min(b), a.max(b))
            })
            .collect();
        pairs.sort();
        pairs
    }

    /// Finish the run and return the rendered report.
    pub fn report(mut self) -> String {
        self.det.finish();
        self.det.take_report_output()
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}
