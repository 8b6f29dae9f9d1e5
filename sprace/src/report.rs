//! Race recording, deduplication and rendering.

use std::fs::File;
use std::io::{self, IsTerminal, Write};
use std::path::Path;

use fxhash::FxHashMap;

use crate::access::{AccessKind, InstId};
use crate::callstack::CallId;

/// The ordering of the two endpoints of a race in the serial execution.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum RaceKind {
    /// A read followed by a logically-parallel write.
    #[strum(serialize = "RW")]
    Rw,
    /// Two logically-parallel writes.
    #[strum(serialize = "WW")]
    Ww,
    /// A write followed by a logically-parallel read.
    #[strum(serialize = "WR")]
    Wr,
}

impl RaceKind {
    /// The kind of the mirror-image race (endpoints swapped).
    fn flip(self) -> RaceKind {
        match self {
            RaceKind::Rw => RaceKind::Wr,
            RaceKind::Ww => RaceKind::Ww,
            RaceKind::Wr => RaceKind::Rw,
        }
    }
}

const TYPE_SHIFT: u32 = 48;
const TYPED_ID_MASK: u64 = (1 << TYPE_SHIFT) - 1;

/// An instruction id tagged with its access kind, for race equivalence.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct TypedId(u64);

impl TypedId {
    fn new(kind: AccessKind, id: InstId) -> Self {
        TypedId(((kind as u64) << TYPE_SHIFT) | (id as u64 & TYPED_ID_MASK))
    }
}

/// One endpoint of a race: the access id and kind plus a snapshot of the
/// call stack it ran under, outermost frame first.
#[derive(Clone, Debug)]
pub(crate) struct AccessLoc {
    pub id: InstId,
    pub kind: AccessKind,
    pub frames: Vec<CallId>,
}

/// A recorded race.  Only the typed endpoint ids, the allocation site and
/// the address are kept; the call stacks are rendered when the race is
/// first reported.
#[derive(Clone, Debug)]
pub struct RaceInfo {
    first: TypedId,
    second: TypedId,
    first_id: InstId,
    second_id: InstId,
    first_kind: AccessKind,
    second_kind: AccessKind,
    alloc_id: InstId,
    addr: u64,
    kind: RaceKind,
}

impl RaceInfo {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn kind(&self) -> RaceKind {
        self.kind
    }

    pub fn first_id(&self) -> InstId {
        self.first_id
    }

    pub fn second_id(&self) -> InstId {
        self.second_id
    }

    pub fn first_kind(&self) -> AccessKind {
        self.first_kind
    }

    pub fn second_kind(&self) -> AccessKind {
        self.second_kind
    }

    pub fn alloc_id(&self) -> InstId {
        self.alloc_id
    }

    /// A race equals another if the typed endpoints match (directly, or
    /// swapped with the race kind flipped) and the allocation site agrees.
    /// The raced-on address does not participate: the same instruction
    /// pair racing on another byte is a duplicate.
    fn is_equivalent(&self, other: &RaceInfo) -> bool {
        let direct =
            self.first == other.first && self.second == other.second && self.kind == other.kind;
        let mirrored = self.first == other.second
            && self.second == other.first
            && self.kind == other.kind.flip();
        (direct || mirrored) && self.alloc_id == other.alloc_id
    }
}

/// Where rendered reports go.
pub(crate) enum Sink {
    Stderr,
    File(io::BufWriter<File>),
    /// In-memory capture for the test suite.
    Buffer(Vec<u8>),
}

impl Sink {
    fn write_fmt(&mut self, args: std::fmt::Arguments<'_>) {
        let res = match self {
            Sink::Stderr => io::stderr().write_fmt(args),
            Sink::File(f) => f.write_fmt(args),
            Sink::Buffer(b) => b.write_fmt(args),
        };
        // Reporting failures must not take the tool down mid-run.
        let _ = res;
    }
}

/// ANSI styling for human reports.
struct Decorator {
    ansi: bool,
}

impl Decorator {
    fn bold(&self) -> &'static str {
        if self.ansi {
            "\x1b[1m"
        } else {
            ""
        }
    }

    fn error(&self) -> &'static str {
        if self.ansi {
            "\x1b[31m"
        } else {
            ""
        }
    }

    fn default(&self) -> &'static str {
        if self.ansi {
            "\x1b[0m"
        } else {
            ""
        }
    }
}

/// Collects, deduplicates and renders races.
pub(crate) struct Reporter {
    /// Races keyed by the larger of the two endpoint instruction ids.
    races: FxHashMap<InstId, Vec<RaceInfo>>,
    distinct: usize,
    duplicates: u32,
    sink: Sink,
    color: bool,
    /// Raise `SIGTRAP` on each newly recorded race.
    debugger: bool,
    /// Terse `race <addr> <id1> <id2>` lines instead of full reports.
    replay: bool,
}

impl Reporter {
    pub fn new(
        out: Option<&Path>,
        color: Option<bool>,
        debugger: bool,
        replay: bool,
    ) -> Reporter {
        let sink = match out {
            Some(path) => match File::create(path) {
                Ok(f) => Sink::File(io::BufWriter::new(f)),
                Err(e) => {
                    eprintln!("sprace: cannot open {}: {e}", path.display());
                    Sink::Stderr
                }
            },
            None if replay => match File::create("sprace_races.out") {
                Ok(f) => Sink::File(io::BufWriter::new(f)),
                Err(_) => Sink::Stderr,
            },
            None => Sink::Stderr,
        };
        let color = color.unwrap_or_else(|| {
            matches!(sink, Sink::Stderr) && io::stderr().is_terminal()
        });
        Reporter {
            races: FxHashMap::default(),
            distinct: 0,
            duplicates: 0,
            sink,
            color,
            debugger,
            replay,
        }
    }

    /// In-memory reporter for tests.
    pub fn buffered(replay: bool) -> Reporter {
        Reporter {
            races: FxHashMap::default(),
            distinct: 0,
            duplicates: 0,
            sink: Sink::Buffer(Vec::new()),
            color: false,
            debugger: false,
            replay,
        }
    }

    pub fn race_count(&self) -> usize {
        self.distinct
    }

    pub fn duplicate_count(&self) -> u32 {
        self.duplicates
    }

    pub fn races(&self) -> impl Iterator<Item = &RaceInfo> {
        self.races.values().flatten()
    }

    /// Record a race between `first` and `second` on `addr`.  A race
    /// equivalent to one already recorded only bumps the duplicate
    /// counter; a new race is rendered immediately.
    pub fn report_race(
        &mut self,
        first: &AccessLoc,
        second: &AccessLoc,
        alloc: Option<&AccessLoc>,
        addr: u64,
        kind: RaceKind,
    ) {
        let race = RaceInfo {
            first: TypedId::new(first.kind, first.id),
            second: TypedId::new(second.kind, second.id),
            first_id: first.id,
            second_id: second.id,
            first_kind: first.kind,
            second_kind: second.kind,
            alloc_id: alloc.map_or(crate::UNKNOWN_INST_ID, |a| a.id),
            addr,
            kind,
        };

        let key = first.id.max(second.id);
        let bucket = self.races.entry(key).or_default();
        if bucket.iter().any(|r| r.is_equivalent(&race)) {
            self.duplicates += 1;
            return;
        }
        bucket.push(race.clone());
        self.distinct += 1;

        if self.replay {
            self.sink.write_fmt(format_args!(
                "race {:x} {} {}\n",
                addr, first.id, second.id
            ));
        } else {
            self.render(&race, first, second, alloc);
        }

        if self.debugger {
            // Let an attached debugger stop at the point of detection.
            unsafe {
                libc::raise(libc::SIGTRAP);
            }
        }
    }

    /// Verb describing the write-side endpoint of a race.
    fn store_verb(kind: AccessKind) -> &'static str {
        match kind {
            AccessKind::FnRw => "Call Write",
            AccessKind::Alloc => "Alloc Write",
            AccessKind::Free => "Free",
            AccessKind::Realloc => "Realloc",
            AccessKind::StackFree => "Stack free",
            _ => "Write",
        }
    }

    /// Verb describing the read-side endpoint of a race.
    fn load_verb(kind: AccessKind) -> &'static str {
        match kind {
            AccessKind::FnRw => "Call Read",
            AccessKind::Alloc => "Alloc Read",
            _ => "Read",
        }
    }

    fn render(
        &mut self,
        race: &RaceInfo,
        first: &AccessLoc,
        second: &AccessLoc,
        alloc: Option<&AccessLoc>,
    ) {
        let d = Decorator { ansi: self.color };
        let (first_verb, second_verb) = match race.kind {
            RaceKind::Rw => (Self::load_verb(first.kind), Self::store_verb(second.kind)),
            RaceKind::Ww => (Self::store_verb(first.kind), Self::store_verb(second.kind)),
            RaceKind::Wr => (Self::store_verb(first.kind), Self::load_verb(second.kind)),
        };

        // The two call stacks share a prefix; report it once.
        let divergence = first
            .frames
            .iter()
            .zip(second.frames.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let out = &mut self.sink;
        out.write_fmt(format_args!(
            "{}{}Race detected on location {:x}{}\n",
            d.bold(),
            d.error(),
            race.addr,
            d.default()
        ));
        out.write_fmt(format_args!(
            "{}*  {}{} {}\n",
            d.bold(),
            d.default(),
            first_verb,
            first.id
        ));
        for frame in first.frames[divergence..].iter().rev() {
            out.write_fmt(format_args!("+   {} {}\n", frame.kind(), frame.id()));
        }
        out.write_fmt(format_args!(
            "|{}* {}{} {}\n",
            d.bold(),
            d.default(),
            second_verb,
            second.id
        ));
        for frame in second.frames[divergence..].iter().rev() {
            out.write_fmt(format_args!("|+  {} {}\n", frame.kind(), frame.id()));
        }
        if divergence > 0 {
            out.write_fmt(format_args!("\\| Common calling context\n"));
            for frame in first.frames[..divergence].iter().rev() {
                out.write_fmt(format_args!(" +  {} {}\n", frame.kind(), frame.id()));
            }
        }
        if let Some(alloc) = alloc {
            out.write_fmt(format_args!("   Allocation context\n"));
            out.write_fmt(format_args!("    Alloc {}\n", alloc.id));
            for frame in alloc.frames.iter().rev() {
                out.write_fmt(format_args!("    {} {}\n", frame.kind(), frame.id()));
            }
        }
        out.write_fmt(format_args!("\n"));
    }

    /// Emit the closing summary lines.
    pub fn print_summary(&mut self) {
        let distinct = self.distinct;
        let duplicates = self.duplicates;
        self.sink
            .write_fmt(format_args!("\nSprace detected {} distinct races.\n", distinct));
        if !self.replay {
            self.sink.write_fmt(format_args!(
                "Sprace suppressed {} duplicate race reports.\n\n",
                duplicates
            ));
        }
        if let Sink::File(f) = &mut self.sink {
            let _ = f.flush();
        }
    }

    /// Take the captured output of a buffered reporter.
    pub fn take_output(&mut self) -> String {
        match &mut self.sink {
            Sink::Buffer(b) => String::from_utf8_lossy(&std::mem::take(b)).into_owned(),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(kind: AccessKind, id: InstId) -> AccessLoc {
        AccessLoc {
            id,
            kind,
            frames: Vec::new(),
        }
    }

    #[test]
    fn mirror_image_races_are_duplicates() {
        let mut r = Reporter::buffered(false);
        r.report_race(
            &loc(AccessKind::Rw, 10),
            &loc(AccessKind::Rw, 20),
            None,
            0x100,
            RaceKind::Wr,
        );
        r.report_race(
            &loc(AccessKind::Rw, 20),
            &loc(AccessKind::Rw, 10),
            None,
            0x100,
            RaceKind::Rw,
        );
        assert_eq!(r.race_count(), 1);
        assert_eq!(r.duplicate_count(), 1);
    }

    #[test]
    fn same_pair_on_other_byte_is_a_duplicate() {
        let mut r = Reporter::buffered(false);
        r.report_race(
            &loc(AccessKind::Rw, 10),
            &loc(AccessKind::Rw, 20),
            None,
            0x100,
            RaceKind::Ww,
        );
        r.report_race(
            &loc(AccessKind::Rw, 10),
            &loc(AccessKind::Rw, 20),
            None,
            0x101,
            RaceKind::Ww,
        );
        assert_eq!(r.race_count(), 1);
        assert_eq!(r.duplicate_count(), 1);
    }

    #[test]
    fn different_alloc_sites_are_distinct() {
        let mut r = Reporter::buffered(false);
        let a1 = loc(AccessKind::Alloc, 5);
        r.report_race(
            &loc(AccessKind::Rw, 10),
            &loc(AccessKind::Rw, 20),
            Some(&a1),
            0x100,
            RaceKind::Ww,
        );
        r.report_race(
            &loc(AccessKind::Rw, 10),
            &loc(AccessKind::Rw, 20),
            None,
            0x100,
            RaceKind::Ww,
        );
        assert_eq!(r.race_count(), 2);
    }

    #[test]
    fn summary_counts_render() {
        let mut r = Reporter::buffered(false);
        r.report_race(
            &loc(AccessKind::Rw, 1),
            &loc(AccessKind::Free, 2),
            None,
            0xAB,
            RaceKind::Ww,
        );
        r.print_summary();
        let text = r.take_output();
        assert!(text.contains("Race detected on location ab"));
        assert!(text.contains("Free 2"));
        assert!(text.contains("Sprace detected 1 distinct races."));
        assert!(text.contains("Sprace suppressed 0 duplicate race reports."));
    }
}
