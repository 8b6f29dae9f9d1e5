//! C-ABI hooks the compiler's instrumentation pass calls.
//!
//! The detector core is a plain Rust state machine; this crate owns the
//! process-global instance and translates the instrumentation ABI onto it.
//! Everything is single-threaded by construction (the runtime is pinned to
//! one worker at init), so the global mutex is uncontended.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use fxhash::FxHashMap;
use parking_lot::Mutex;
use sprace::{Config, Detector, InstId, LockId, Maap};

/// The process-wide detector, created on the first function entry.
static DETECTOR: LazyLock<Mutex<Option<Detector>>> = LazyLock::new(|| Mutex::new(None));

/// Global instrumentation switch; hooks are ignored until `__sprace_init`.
static INSTRUMENTATION: AtomicBool = AtomicBool::new(false);

/// Lock registry: mutex address to lock id.  Id 0 is reserved for atomics.
struct LockIds {
    ids: FxHashMap<u64, LockId>,
    next: LockId,
}

static LOCK_IDS: LazyLock<Mutex<LockIds>> = LazyLock::new(|| {
    Mutex::new(LockIds {
        ids: FxHashMap::default(),
        next: 1,
    })
});

fn with_detector(f: impl FnOnce(&mut Detector)) {
    if !INSTRUMENTATION.load(Ordering::Relaxed) {
        return;
    }
    let mut guard = DETECTOR.lock();
    let det = guard.get_or_insert_with(|| Detector::new(Config::from_env()));
    if det.checking_enabled() {
        f(det);
    }
}

/// Force the runtime to a single worker with eager reductions; the SP-bags
/// algorithm is only correct for a deterministic serial execution.
fn pin_runtime() {
    for (key, value) in [("CILK_NWORKERS", "1"), ("CILK_FORCE_REDUCE", "1")] {
        if std::env::var(key).map_or(true, |v| v != value) {
            std::env::set_var(key, value);
        }
    }
}

/// Properties of a function entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FuncProp {
    pub num_sync_reg: u32,
    pub may_spawn: u8,
}

/// Properties of a task entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TaskProp {
    pub num_sync_reg: u32,
    pub is_tapir_loop_body: u8,
}

/// Properties of a load or store.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AccessProp {
    pub alignment: u32,
    pub is_atomic: u8,
}

/// Per-compilation-unit instrumentation counts.  The id spaces are dense
/// per kind; units report their counts so the id space can grow.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct UnitCounts {
    pub num_call: i64,
    pub num_detach: i64,
    pub num_loop: i64,
    pub num_load: i64,
    pub num_store: i64,
    pub num_alloca: i64,
    pub num_allocfn: i64,
    pub num_free: i64,
}

/// Totals across all loaded units.  The source-location tables that map
/// these ids back to code are owned by the table-parsing layer; the shim
/// only tracks the extents.
static UNIT_TOTALS: Mutex<UnitCounts> = Mutex::new(UnitCounts {
    num_call: 0,
    num_detach: 0,
    num_loop: 0,
    num_load: 0,
    num_store: 0,
    num_alloca: 0,
    num_allocfn: 0,
    num_free: 0,
});

/// One-shot tool initialization.
#[no_mangle]
pub extern "C" fn __sprace_init() {
    pin_runtime();
    INSTRUMENTATION.store(true, Ordering::Relaxed);
}

/// Grow the per-kind id spaces for a newly loaded compilation unit.
#[no_mangle]
pub extern "C" fn __sprace_unit_init(counts: UnitCounts) {
    let mut totals = UNIT_TOTALS.lock();
    totals.num_call += counts.num_call;
    totals.num_detach += counts.num_detach;
    totals.num_loop += counts.num_loop;
    totals.num_load += counts.num_load;
    totals.num_store += counts.num_store;
    totals.num_alloca += counts.num_alloca;
    totals.num_allocfn += counts.num_allocfn;
    totals.num_free += counts.num_free;
}

/// Tear down the detector and emit the race report.  Wired to run at
/// process exit by the link-time support code.
#[no_mangle]
pub extern "C" fn __sprace_destroy() {
    INSTRUMENTATION.store(false, Ordering::Relaxed);
    if let Some(det) = DETECTOR.lock().as_mut() {
        det.finish();
    }
}

#[no_mangle]
pub extern "C" fn __sprace_disable_checking() {
    if let Some(det) = DETECTOR.lock().as_mut() {
        det.disable_checking();
    }
}

#[no_mangle]
pub extern "C" fn __sprace_enable_checking() {
    if let Some(det) = DETECTOR.lock().as_mut() {
        det.enable_checking();
    }
}

#[no_mangle]
pub extern "C" fn __sprace_func_entry(
    func_id: InstId,
    bp: *const c_void,
    sp: *const c_void,
    prop: FuncProp,
) {
    with_detector(|det| {
        det.func_entry(
            func_id,
            bp as u64,
            sp as u64,
            prop.may_spawn != 0,
            prop.num_sync_reg,
        )
    });
}

#[no_mangle]
pub extern "C" fn __sprace_func_exit(func_exit_id: InstId, func_id: InstId) {
    with_detector(|det| det.func_exit(func_exit_id, func_id));
}

#[no_mangle]
pub extern "C" fn __sprace_before_call(call_id: InstId, func_id: InstId, maap_count: u32) {
    let _ = func_id;
    with_detector(|det| det.before_call(call_id, maap_count));
}

#[no_mangle]
pub extern "C" fn __sprace_after_call(call_id: InstId, func_id: InstId, maap_count: u32) {
    let _ = func_id;
    with_detector(|det| det.after_call(call_id, maap_count));
}

#[no_mangle]
pub extern "C" fn __sprace_detach(detach_id: InstId, sync_reg: u32) {
    with_detector(|det| det.detach(detach_id, sync_reg));
}

#[no_mangle]
pub extern "C" fn __sprace_task(
    task_id: InstId,
    detach_id: InstId,
    bp: *const c_void,
    sp: *const c_void,
    prop: TaskProp,
) {
    with_detector(|det| {
        det.task(
            task_id,
            detach_id,
            bp as u64,
            sp as u64,
            prop.num_sync_reg,
            prop.is_tapir_loop_body != 0,
        )
    });
}

#[no_mangle]
pub extern "C" fn __sprace_task_exit(
    task_exit_id: InstId,
    task_id: InstId,
    detach_id: InstId,
    sync_reg: u32,
    is_tapir_loop_body: u8,
) {
    with_detector(|det| {
        det.task_exit(
            task_exit_id,
            task_id,
            detach_id,
            sync_reg,
            is_tapir_loop_body != 0,
        )
    });
}

#[no_mangle]
pub extern "C" fn __sprace_detach_continue(
    detach_continue_id: InstId,
    detach_id: InstId,
    sync_reg: u32,
    is_unwind: u8,
) {
    with_detector(|det| det.detach_continue(detach_continue_id, detach_id, sync_reg, is_unwind != 0));
}

#[no_mangle]
pub extern "C" fn __sprace_sync(sync_id: InstId, sync_reg: u32) {
    with_detector(|det| det.sync(sync_id, sync_reg));
}

#[no_mangle]
pub extern "C" fn __sprace_before_loop(loop_id: InstId, trip_count: i64, is_tapir_loop: u8) {
    let _ = trip_count;
    if is_tapir_loop == 0 {
        return;
    }
    with_detector(|det| det.before_loop(loop_id));
}

#[no_mangle]
pub extern "C" fn __sprace_after_loop(loop_id: InstId, sync_reg: u32, is_tapir_loop: u8) {
    if is_tapir_loop == 0 {
        return;
    }
    with_detector(|det| det.after_loop(loop_id, sync_reg));
}

#[no_mangle]
pub extern "C" fn __sprace_load(load_id: InstId, addr: *const c_void, size: i32, prop: AccessProp) {
    with_detector(|det| {
        det.load(
            load_id,
            addr as u64,
            size as u64,
            prop.alignment,
            prop.is_atomic != 0,
        )
    });
}

#[no_mangle]
pub extern "C" fn __sprace_store(store_id: InstId, addr: *const c_void, size: i32, prop: AccessProp) {
    with_detector(|det| {
        det.store(
            store_id,
            addr as u64,
            size as u64,
            prop.alignment,
            prop.is_atomic != 0,
        )
    });
}

#[no_mangle]
pub extern "C" fn __sprace_large_load(
    load_id: InstId,
    addr: *const c_void,
    size: usize,
    prop: AccessProp,
) {
    with_detector(|det| det.large_load(load_id, addr as u64, size as u64, prop.is_atomic != 0));
}

#[no_mangle]
pub extern "C" fn __sprace_large_store(
    store_id: InstId,
    addr: *const c_void,
    size: usize,
    prop: AccessProp,
) {
    with_detector(|det| det.large_store(store_id, addr as u64, size as u64, prop.is_atomic != 0));
}

#[no_mangle]
pub extern "C" fn __sprace_after_alloca(alloca_id: InstId, addr: *const c_void, size: usize) {
    with_detector(|det| det.after_alloca(alloca_id, addr as u64, size as u64));
}

#[no_mangle]
pub extern "C" fn __sprace_after_allocfn(
    allocfn_id: InstId,
    addr: *const c_void,
    size: usize,
    num: usize,
    oldaddr: *const c_void,
) {
    let total = size.saturating_mul(num.max(1));
    with_detector(|det| det.after_allocfn(allocfn_id, addr as u64, total as u64, oldaddr as u64));
}

#[no_mangle]
pub extern "C" fn __sprace_after_free(free_id: InstId, ptr: *const c_void) {
    with_detector(|det| det.after_free(free_id, ptr as u64));
}

#[no_mangle]
pub extern "C" fn __sprace_restore_stack(call_id: InstId, sp: *const c_void) {
    with_detector(|det| det.restore_stack(call_id, sp as u64));
}

#[no_mangle]
pub extern "C" fn __sprace_set_maap(value: u8, id: InstId) {
    with_detector(|det| det.set_maap(Maap::from_bits(value), id));
}

#[no_mangle]
pub extern "C" fn __sprace_get_maap(out: *mut u8, id: InstId, idx: u32) {
    with_detector(|det| {
        let value = det.get_maap(id, idx);
        if !out.is_null() {
            unsafe { *out = value.bits() };
        }
    });
}

/// The lock id for a mutex address, registering it on first sight.  Some
/// lock implementations never call an init routine, so locking hooks
/// register implicitly.
fn lock_id_for(mutex: u64) -> LockId {
    let mut ids = LOCK_IDS.lock();
    if let Some(&id) = ids.ids.get(&mutex) {
        return id;
    }
    let id = ids.next;
    ids.next += 1;
    ids.ids.insert(mutex, id);
    id
}

/// Register a mutex address, assigning it a fresh lock id.
#[no_mangle]
pub extern "C" fn __sprace_register_lock(mutex: *const c_void) {
    let _ = lock_id_for(mutex as u64);
}

#[no_mangle]
pub extern "C" fn __sprace_unregister_lock(mutex: *const c_void) {
    LOCK_IDS.lock().ids.remove(&(mutex as u64));
}

#[no_mangle]
pub extern "C" fn __sprace_acquire_lock(mutex: *const c_void) {
    let id = lock_id_for(mutex as u64);
    with_detector(|det| det.acquire_lock(id));
}

#[no_mangle]
pub extern "C" fn __sprace_release_lock(mutex: *const c_void) {
    let id = LOCK_IDS.lock().ids.get(&(mutex as u64)).copied();
    match id {
        Some(id) => with_detector(|det| det.release_lock(id)),
        None => sprace::errors::warn(&sprace::errors::Diagnostic::UnknownLock {
            op: "release",
            mutex: mutex as u64,
        }),
    }
}

#[no_mangle]
pub extern "C" fn __sprace_begin_atomic() {
    with_detector(|det| det.begin_atomic());
}

#[no_mangle]
pub extern "C" fn __sprace_end_atomic() {
    with_detector(|det| det.end_atomic());
}
