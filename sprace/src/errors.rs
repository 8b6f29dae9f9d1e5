//! Diagnostics and the fatal-error path.
//!
//! Recoverable problems (an unknown lock, an unmodeled library routine) are
//! printed to stderr and otherwise ignored.  Everything else is an
//! instrumentation-invariant violation: the detector's state can no longer
//! be trusted, so we print a banner, raise `SIGTRAP` so an attached debugger
//! can inspect the process, and abort.

use thiserror::Error;

use crate::access::InstId;

/// Recoverable diagnostics surfaced to the user on stderr.
#[derive(Debug, Error)]
pub enum Diagnostic {
    /// Acquire or release of a mutex the detector has never seen.
    #[error("cannot model lock-{op} of unknown lock at {mutex:#x}")]
    UnknownLock { op: &'static str, mutex: u64 },
    /// A library routine the shim does not model; reported once per site.
    #[error("unmodeled library call at site {site}")]
    UnknownLibraryCall { site: InstId },
}

/// Emit a recoverable diagnostic.
pub fn warn(diag: &Diagnostic) {
    eprintln!("sprace warning: {diag}");
}

/// Report a fatal internal error and terminate the process.
///
/// Never returns: after printing a framed banner this raises `SIGTRAP`,
/// giving an attached debugger a chance to stop, then aborts.
pub fn fatal(msg: &str) -> ! {
    eprintln!("=================================================================");
    eprintln!("sprace: fatal internal error");
    eprintln!("  {msg}");
    eprintln!("=================================================================");
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
    std::process::abort();
}
