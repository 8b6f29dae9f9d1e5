//! Per-frame bookkeeping on the shadow stack.

use crate::callstack::CallStackArena;
use crate::spbag::{DsArena, DsIndex};

/// How a frame was entered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EntryKind {
    /// An ordinary function that may spawn.
    Spawner,
    /// A spawn-helper function.
    #[allow(dead_code)]
    Helper,
    /// The body of a detached task.
    Detacher,
}

/// What flavor of frame this is.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FrameKind {
    Shadow,
    Full,
    Loop,
}

/// One active function (or loop) instantiation.
///
/// A frame owns one reference on each bag handle it holds; releasing a slot
/// drops that reference.  The used flags record whether any access has been
/// recorded against the bag since it was created, letting merges skip bags
/// the shadow memory has never seen.
pub(crate) struct FrameData {
    pub entry_kind: EntryKind,
    pub frame_kind: FrameKind,
    /// Monotonic id, for event tracing only.
    pub frame_id: u64,
    pub sbag: Option<DsIndex>,
    pub pbags: Vec<Option<DsIndex>>,
    pub iterbag: Option<DsIndex>,
    pub sbag_used: bool,
    pub iterbag_used: bool,
}

impl FrameData {
    pub fn new(frame_id: u64) -> Self {
        FrameData {
            entry_kind: EntryKind::Spawner,
            frame_kind: FrameKind::Shadow,
            frame_id,
            sbag: None,
            pbags: Vec::new(),
            iterbag: None,
            sbag_used: false,
            iterbag_used: false,
        }
    }

    pub fn is_loop_frame(&self) -> bool {
        self.frame_kind == FrameKind::Loop
    }

    /// Replace the frame's S-bag, releasing the old handle.
    pub fn set_sbag(&mut self, ds: &mut DsArena, cs: &mut CallStackArena, bag: Option<DsIndex>) {
        if let Some(old) = self.sbag.take() {
            ds.dec_ref(cs, old, 1);
        }
        self.sbag = bag;
        self.sbag_used = false;
    }

    pub fn set_pbag(
        &mut self,
        ds: &mut DsArena,
        cs: &mut CallStackArena,
        idx: usize,
        bag: Option<DsIndex>,
    ) {
        if let Some(old) = self.pbags[idx].take() {
            ds.dec_ref(cs, old, 1);
        }
        self.pbags[idx] = bag;
    }

    pub fn set_iterbag(&mut self, ds: &mut DsArena, cs: &mut CallStackArena, bag: Option<DsIndex>) {
        if let Some(old) = self.iterbag.take() {
            ds.dec_ref(cs, old, 1);
        }
        self.iterbag = bag;
        self.iterbag_used = false;
    }

    pub fn clear_pbags(&mut self, ds: &mut DsArena, cs: &mut CallStackArena) {
        for idx in 0..self.pbags.len() {
            self.set_pbag(ds, cs, idx, None);
        }
        self.pbags.clear();
    }

    pub fn has_pbags(&self) -> bool {
        self.pbags.iter().any(|p| p.is_some())
    }

    /// Release every bag handle the frame holds.
    pub fn reset(&mut self, ds: &mut DsArena, cs: &mut CallStackArena) {
        self.set_sbag(ds, cs, None);
        self.clear_pbags(ds, cs);
        self.set_iterbag(ds, cs, None);
    }
}
