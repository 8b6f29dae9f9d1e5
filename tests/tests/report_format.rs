//! Checks on the rendered race report and the replay log.

use fm::FMatcher;
use regex::Regex;
use sprace::Config;
use tests::Session;

/// Drive one spawn race nested under a call site so the report shows both
/// endpoints, the common calling context and the allocation context.
fn racy_session(s: &mut Session) -> u64 {
    let heap = 0x60_0000;
    s.enter(1);
    let call_id = s.call();
    s.enter(1);
    s.det.after_allocfn(900, heap, 4, 0);
    let d = s.spawn_begin(0);
    s.det.store(901, heap, 4, 4, false);
    s.spawn_end(d, 0);
    s.det.store(902, heap, 4, 4, false);
    s.sync(0);
    s.leave();
    s.ret(call_id);
    s.leave();
    heap
}

#[test]
fn human_report_shape() {
    let mut s = Session::new();
    let addr = racy_session(&mut s);
    assert_eq!(s.race_count(), 1);
    let text = s.report();

    let pattern = "\
Race detected on location 600000
*  Write 901
+   Spawn ...
|* Write 902
\\| Common calling context
 +  Call ...
   Allocation context
    Alloc 1801
    Call ...
...
Sprace detected 1 distinct races.
Sprace suppressed 0 duplicate race reports.
...";
    FMatcher::new(pattern)
        .unwrap()
        .matches(&text)
        .unwrap_or_else(|e| panic!("report did not match:\n{e}\n--- report ---\n{text}"));

    // The reported location is the raced-on address.
    let re = Regex::new(r"Race detected on location ([0-9a-f]+)").unwrap();
    let hex = &re.captures(&text).unwrap()[1];
    assert_eq!(u64::from_str_radix(hex, 16).unwrap(), addr);
}

#[test]
fn summary_counts_match_accessors() {
    let mut s = Session::new();
    racy_session(&mut s);
    let distinct = s.race_count();
    let dups = s.duplicate_count();
    let text = s.report();
    assert!(text.contains(&format!("Sprace detected {distinct} distinct races.")));
    assert!(text.contains(&format!(
        "Sprace suppressed {dups} duplicate race reports."
    )));
}

#[test]
fn replay_log_is_terse() {
    let mut config = Config::capture();
    config.replay = true;
    let mut s = Session::with_config(config);
    racy_session(&mut s);
    let text = s.report();

    let re = Regex::new(r"(?m)^race 600000 901 902$").unwrap();
    assert!(re.is_match(&text), "unexpected replay log:\n{text}");
    // Replay mode still prints the detected count, but no suppression
    // line.
    assert!(text.contains("Sprace detected 1 distinct races."));
    assert!(!text.contains("suppressed"));
}
