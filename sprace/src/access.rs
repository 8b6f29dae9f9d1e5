//! Memory-access records stored in shadow memory.

use static_assertions::const_assert;

use crate::spbag::{DsIndex, Version};

/// Identifier of an instrumented instruction.  The instrumentation assigns
/// these densely per compilation unit; `-1` marks an unknown site.
pub type InstId = i64;

/// The id of an instruction the instrumentation could not identify.
pub const UNKNOWN_INST_ID: InstId = -1;

/// What kind of operation a memory access was.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum AccessKind {
    /// An ordinary load or store.
    Rw = 0,
    /// A load or store performed inside a modeled library routine.
    FnRw,
    /// An allocation touching the accessed bytes.
    Alloc,
    /// A heap free, modeled as a write to the freed bytes.
    Free,
    /// The bytes discarded by a shrinking or moving realloc.
    Realloc,
    /// Stack memory reclaimed by restoring the stack pointer.
    StackFree,
    Unknown = 15,
}

impl AccessKind {
    fn from_bits(bits: u64) -> AccessKind {
        match bits {
            0 => AccessKind::Rw,
            1 => AccessKind::FnRw,
            2 => AccessKind::Alloc,
            3 => AccessKind::Free,
            4 => AccessKind::Realloc,
            5 => AccessKind::StackFree,
            _ => AccessKind::Unknown,
        }
    }
}

const VERSION_SHIFT: u32 = 48;
const KIND_SHIFT: u32 = 44;
const ID_MASK: u64 = (1 << KIND_SHIFT) - 1;
const KIND_MASK: u64 = ((1 << VERSION_SHIFT) - 1) & !ID_MASK;
const UNKNOWN_ACC_ID: u64 = UNKNOWN_INST_ID as u64 & ID_MASK;

// The packed payload must leave exactly 16 bits for the version.
const_assert!(VERSION_SHIFT + (Version::BITS) == 64);
const_assert!(KIND_SHIFT + 4 == VERSION_SHIFT);

/// One previous access to a byte range: the disjoint-set handle of the
/// S-bag it ran under, plus a packed `version | kind | instruction id`
/// word.  Sixteen bytes, copied freely; the handle's reference count is
/// maintained by the shadow-memory code at every insert and invalidate.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MemAccess {
    func: Option<DsIndex>,
    payload: u64,
}

const_assert!(std::mem::size_of::<MemAccess>() == 16);

impl Default for MemAccess {
    fn default() -> Self {
        MemAccess {
            func: None,
            payload: UNKNOWN_ACC_ID,
        }
    }
}

impl MemAccess {
    pub fn new(func: DsIndex, version: Version, id: InstId, kind: AccessKind) -> Self {
        MemAccess {
            func: Some(func),
            payload: (id as u64 & ID_MASK)
                | ((kind as u64) << KIND_SHIFT)
                | ((version as u64) << VERSION_SHIFT),
        }
    }

    pub fn invalid() -> Self {
        MemAccess::default()
    }

    pub fn is_valid(&self) -> bool {
        self.func.is_some()
    }

    pub fn func(&self) -> Option<DsIndex> {
        self.func
    }

    pub fn take_func(&mut self) -> Option<DsIndex> {
        let f = self.func.take();
        self.payload = UNKNOWN_ACC_ID;
        f
    }

    pub fn acc_id(&self) -> InstId {
        let id = self.payload & ID_MASK;
        if id == UNKNOWN_ACC_ID {
            UNKNOWN_INST_ID
        } else {
            id as InstId
        }
    }

    pub fn kind(&self) -> AccessKind {
        if (self.payload & ID_MASK) == UNKNOWN_ACC_ID {
            AccessKind::Unknown
        } else {
            AccessKind::from_bits((self.payload & KIND_MASK) >> KIND_SHIFT)
        }
    }

    pub fn version(&self) -> Version {
        (self.payload >> VERSION_SHIFT) as Version
    }

    /// Do two records describe accesses from the same set handle?  Entry
    /// runs replicated by refinement compare equal under this, which is
    /// what the traversal dedup wants.
    pub fn same_source(&self, other: &MemAccess) -> bool {
        self.func == other.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::{CallStack, CallStackArena};
    use crate::spbag::DsArena;

    #[test]
    fn payload_packing_roundtrip() {
        let mut ds = DsArena::new();
        let mut cs = CallStackArena::new();
        let h = ds.new_sbag(&mut cs, CallStack::empty());
        let ma = MemAccess::new(h, 0xBEEF, 0x0123_4567_89A, AccessKind::Realloc);
        assert!(ma.is_valid());
        assert_eq!(ma.version(), 0xBEEF);
        assert_eq!(ma.kind(), AccessKind::Realloc);
        assert_eq!(ma.acc_id(), 0x0123_4567_89A);
        ds.dec_ref(&mut cs, h, 1);
    }

    #[test]
    fn invalid_access_reports_unknown() {
        let ma = MemAccess::invalid();
        assert!(!ma.is_valid());
        assert_eq!(ma.acc_id(), UNKNOWN_INST_ID);
        assert_eq!(ma.kind(), AccessKind::Unknown);
    }
}
