//! Core of the Sprace determinacy-race detector for fork-join programs.
//!
//! An instrumented program reports its control flow (function entries, task
//! spawns, syncs, parallel-loop iterations) and memory operations to a
//! [`Detector`], which replays the serial execution against the SP-bags
//! algorithm and a byte-granular shadow memory, reporting every pair of
//! accesses that could race under some parallel schedule of the same
//! program.
//!
//! The C-ABI hooks that the compiler's instrumentation pass calls live in
//! the `sprace_shim` crate; this crate is the pure state machine behind
//! them.

use std::sync::LazyLock;

static TRACE_EVENTS: LazyLock<bool> = LazyLock::new(|| std::env::var("SPRACE_LOG").is_ok());

/// Whether `SPRACE_LOG` event tracing is enabled.
#[doc(hidden)]
pub fn trace_enabled() -> bool {
    *TRACE_EVENTS
}

/// Print a detector event to stderr when `SPRACE_LOG` is set.
macro_rules! trace_event {
    ($($arg:tt)*) => {
        if $crate::trace_enabled() {
            eprintln!("sprace: {}", format_args!($($arg)*));
        }
    };
}
pub(crate) use trace_event;

mod access;
mod callstack;
mod driver;
pub mod errors;
mod frame;
mod lockset;
mod report;
mod shadow;
mod spbag;

pub use access::{AccessKind, InstId, UNKNOWN_INST_ID};
pub use callstack::CallKind;
pub use driver::{Config, Detector, Maap};
pub use lockset::{LockId, ATOMIC_LOCK_ID};
pub use report::{RaceInfo, RaceKind};
