// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! # labhub C FFI bindings
//!
//! Stable `datablock_*` ABI over the labhub core, for scripting hosts that
//! load the bus as a shared library.
//!
//! # Safety
//!
//! All public functions are `unsafe` and require the caller to uphold the
//! invariants documented per function: handles must come from the matching
//! constructor and must not be used after being closed, strings must be
//! valid NUL-terminated UTF-8, and a single handle must not be used from
//! two threads at once.

use labhub::{
    Consumer, DataBlockConfig, Producer, RawReadOutcome, Recovery, RecoveryOutcome,
    ReserveOutcome, SlotHandle,
};
use std::ffi::CStr;
use std::os::raw::c_char;
use std::time::Duration;

/// Opaque handle to a producer endpoint.
#[repr(C)]
pub struct DatablockProducer {
    _private: [u8; 0],
}

/// Opaque handle to a consumer endpoint.
#[repr(C)]
pub struct DatablockConsumer {
    _private: [u8; 0],
}

/// Result of `datablock_reserve`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatablockReserveStatus {
    DatablockReserveOk = 0,
    DatablockReserveBusy = 1,
    DatablockReserveStopped = 2,
    DatablockReserveError = 3,
}

/// Result of `datablock_read`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatablockReadStatus {
    DatablockReadOk = 0,
    DatablockReadTimedOut = 1,
    DatablockReadStopped = 2,
    DatablockReadError = 3,
}

/// Outcome taxonomy of the recovery entry points.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatablockRecoveryResult {
    RecoverySuccess = 0,
    RecoveryFailed = 1,
    RecoveryUnsafe = 2,
    RecoveryNotStuck = 3,
    RecoveryInvalidSlot = 4,
}

impl From<RecoveryOutcome> for DatablockRecoveryResult {
    fn from(outcome: RecoveryOutcome) -> Self {
        match outcome {
            RecoveryOutcome::Success => Self::RecoverySuccess,
            RecoveryOutcome::Failed => Self::RecoveryFailed,
            RecoveryOutcome::Unsafe => Self::RecoveryUnsafe,
            RecoveryOutcome::NotStuck => Self::RecoveryNotStuck,
            RecoveryOutcome::InvalidSlot => Self::RecoveryInvalidSlot,
        }
    }
}

/// A reserved slot, as seen across the ABI.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DatablockSlotRef {
    pub slot_index: u32,
    pub generation: u64,
    pub payload: *mut u8,
    pub payload_len: usize,
}

/// A delivered sample, as seen across the ABI.
///
/// `payload` stays valid until the next `datablock_read` or
/// `datablock_read_release` on the same consumer.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DatablockSample {
    pub generation: u64,
    pub skipped: u64,
    pub payload: *const u8,
    pub payload_len: usize,
    pub valid: bool,
}

/// Per-slot diagnostic record.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DatablockSlotDiagnostic {
    pub slot_id: u64,
    pub slot_index: u32,
    pub slot_state: u8,
    pub write_lock: u64,
    pub reader_count: u32,
    pub write_generation: u64,
    pub writer_waiting: u8,
    pub is_stuck: bool,
    pub stuck_duration_ms: u64,
}

impl From<labhub::SlotDiagnostic> for DatablockSlotDiagnostic {
    fn from(d: labhub::SlotDiagnostic) -> Self {
        Self {
            slot_id: d.slot_id,
            slot_index: d.slot_index,
            slot_state: d.slot_state,
            write_lock: d.write_lock,
            reader_count: d.reader_count,
            write_generation: d.write_generation,
            writer_waiting: u8::from(d.writer_waiting),
            is_stuck: d.is_stuck,
            stuck_duration_ms: d.stuck_duration_ms,
        }
    }
}

/// Initialize the logging backend (env_logger, honoring `RUST_LOG`).
/// Safe to call more than once.
#[no_mangle]
pub extern "C" fn datablock_init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

unsafe fn name_from(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(str::to_string)
}

unsafe fn producer_mut<'a>(handle: *mut DatablockProducer) -> Option<&'a mut Producer> {
    (handle as *mut Producer).as_mut()
}

unsafe fn consumer_mut<'a>(handle: *mut DatablockConsumer) -> Option<&'a mut Consumer> {
    (handle as *mut Consumer).as_mut()
}

// --- producer ---

/// Create a region and return its producer handle, or NULL on error.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_create(
    name: *const c_char,
    slot_count: u32,
    slot_bytes: u32,
    flex_bytes: u64,
) -> *mut DatablockProducer {
    let Some(name) = name_from(name) else {
        return std::ptr::null_mut();
    };
    let config = DataBlockConfig::with_geometry(slot_count, slot_bytes, flex_bytes);
    match Producer::create(&name, config) {
        Ok(producer) => Box::into_raw(Box::new(producer)) as *mut DatablockProducer,
        Err(e) => {
            log::error!("[DATABLOCK] create '{name}' failed: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Take over an existing region whose producer died. NULL while the
/// recorded producer is alive or on error.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_producer_open(
    name: *const c_char,
) -> *mut DatablockProducer {
    let Some(name) = name_from(name) else {
        return std::ptr::null_mut();
    };
    match Producer::open(&name) {
        Ok(producer) => Box::into_raw(Box::new(producer)) as *mut DatablockProducer,
        Err(e) => {
            log::error!("[DATABLOCK] producer open '{name}' failed: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Reserve the next slot, blocking up to `timeout_ms`.
///
/// # Safety
///
/// `handle` must be a live producer handle; `out_slot` must point to
/// writable memory for one `DatablockSlotRef`.
#[no_mangle]
pub unsafe extern "C" fn datablock_reserve(
    handle: *mut DatablockProducer,
    timeout_ms: u64,
    out_slot: *mut DatablockSlotRef,
) -> DatablockReserveStatus {
    let Some(producer) = producer_mut(handle) else {
        return DatablockReserveStatus::DatablockReserveError;
    };
    if out_slot.is_null() {
        return DatablockReserveStatus::DatablockReserveError;
    }
    match producer.reserve(Duration::from_millis(timeout_ms)) {
        Ok(ReserveOutcome::Slot(slot)) => {
            let payload = producer.payload_mut(&slot);
            out_slot.write(DatablockSlotRef {
                slot_index: slot.index(),
                generation: slot.generation(),
                payload: payload.as_mut_ptr(),
                payload_len: payload.len(),
            });
            DatablockReserveStatus::DatablockReserveOk
        }
        Ok(ReserveOutcome::Busy) => DatablockReserveStatus::DatablockReserveBusy,
        Ok(ReserveOutcome::Stopped) => DatablockReserveStatus::DatablockReserveStopped,
        Err(e) => {
            log::error!("[DATABLOCK] reserve failed: {e}");
            DatablockReserveStatus::DatablockReserveError
        }
    }
}

/// Commit a reserved slot. Returns 0 on success, -1 on error.
///
/// # Safety
///
/// `handle` must be a live producer handle; `slot` must be the record
/// filled by the matching `datablock_reserve`.
#[no_mangle]
pub unsafe extern "C" fn datablock_commit(
    handle: *mut DatablockProducer,
    slot: *const DatablockSlotRef,
    valid: bool,
) -> i32 {
    let Some(producer) = producer_mut(handle) else {
        return -1;
    };
    let Some(slot) = slot.as_ref() else {
        return -1;
    };
    let rebuilt = SlotHandle::from_raw(slot.slot_index, slot.generation);
    match producer.commit(rebuilt, valid) {
        Ok(_) => 0,
        Err(e) => {
            log::error!("[DATABLOCK] commit failed: {e}");
            -1
        }
    }
}

/// Discard a reserved slot without committing. Returns 0 on success.
///
/// # Safety
///
/// Same contract as [`datablock_commit`].
#[no_mangle]
pub unsafe extern "C" fn datablock_discard(
    handle: *mut DatablockProducer,
    slot: *const DatablockSlotRef,
) -> i32 {
    let Some(producer) = producer_mut(handle) else {
        return -1;
    };
    let Some(slot) = slot.as_ref() else {
        return -1;
    };
    let rebuilt = SlotHandle::from_raw(slot.slot_index, slot.generation);
    match producer.discard(rebuilt) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("[DATABLOCK] discard failed: {e}");
            -1
        }
    }
}

/// Producer view of the flex zone. Returns 0 and fills `out_ptr`/`out_len`.
///
/// # Safety
///
/// `handle` must be a live producer handle; out-pointers must be writable.
#[no_mangle]
pub unsafe extern "C" fn datablock_flex_ptr(
    handle: *mut DatablockProducer,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    let Some(producer) = producer_mut(handle) else {
        return -1;
    };
    if out_ptr.is_null() || out_len.is_null() {
        return -1;
    }
    let flex = producer.flexzone_mut();
    out_ptr.write(flex.as_mut_ptr());
    out_len.write(flex.len());
    0
}

/// Restamp the flex-zone checksum after mutating it.
///
/// # Safety
///
/// `handle` must be a live producer handle.
#[no_mangle]
pub unsafe extern "C" fn datablock_flex_checksum_update(
    handle: *mut DatablockProducer,
) -> i32 {
    let Some(producer) = producer_mut(handle) else {
        return -1;
    };
    producer.flexzone_checksum_update();
    0
}

/// Set the region shutdown flag and wake all waiters.
///
/// # Safety
///
/// `handle` must be a live producer handle.
#[no_mangle]
pub unsafe extern "C" fn datablock_shutdown(handle: *mut DatablockProducer) -> i32 {
    let Some(producer) = producer_mut(handle) else {
        return -1;
    };
    producer.shutdown();
    0
}

/// Close a producer handle. The region stays mapped for other processes.
///
/// # Safety
///
/// `handle` must come from `datablock_create`/`datablock_producer_open`
/// and must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn datablock_close(handle: *mut DatablockProducer) {
    if !handle.is_null() {
        drop(Box::from_raw(handle as *mut Producer));
    }
}

// --- consumer ---

/// Attach to a region and return a consumer handle, or NULL on error.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_open(name: *const c_char) -> *mut DatablockConsumer {
    let Some(name) = name_from(name) else {
        return std::ptr::null_mut();
    };
    match Consumer::attach(&name) {
        Ok(consumer) => Box::into_raw(Box::new(consumer)) as *mut DatablockConsumer,
        Err(e) => {
            log::error!("[DATABLOCK] open '{name}' failed: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Read the next sample, blocking up to `timeout_ms`.
///
/// Any previously delivered sample is released first. A delivered
/// payload pointer stays valid until the next `datablock_read` or
/// `datablock_read_release` call.
///
/// # Safety
///
/// `handle` must be a live consumer handle; `out_sample` must point to
/// writable memory for one `DatablockSample`.
#[no_mangle]
pub unsafe extern "C" fn datablock_read(
    handle: *mut DatablockConsumer,
    timeout_ms: u64,
    out_sample: *mut DatablockSample,
) -> DatablockReadStatus {
    let Some(consumer) = consumer_mut(handle) else {
        return DatablockReadStatus::DatablockReadError;
    };
    if out_sample.is_null() {
        return DatablockReadStatus::DatablockReadError;
    }
    match consumer.read_raw(Duration::from_millis(timeout_ms)) {
        Ok(RawReadOutcome::Sample(sample)) => {
            out_sample.write(DatablockSample {
                generation: sample.generation,
                skipped: sample.skipped,
                payload: sample.payload_ptr,
                payload_len: sample.payload_len,
                valid: sample.valid,
            });
            DatablockReadStatus::DatablockReadOk
        }
        Ok(RawReadOutcome::TimedOut) => DatablockReadStatus::DatablockReadTimedOut,
        Ok(RawReadOutcome::Stopped) => DatablockReadStatus::DatablockReadStopped,
        Err(e) => {
            log::error!("[DATABLOCK] read failed: {e}");
            DatablockReadStatus::DatablockReadError
        }
    }
}

/// Release the sample delivered by the last `datablock_read`.
///
/// # Safety
///
/// `handle` must be a live consumer handle.
#[no_mangle]
pub unsafe extern "C" fn datablock_read_release(handle: *mut DatablockConsumer) -> i32 {
    let Some(consumer) = consumer_mut(handle) else {
        return -1;
    };
    consumer.release_current();
    0
}

/// Consumer (read-only) view of the flex zone.
///
/// # Safety
///
/// `handle` must be a live consumer handle; out-pointers must be writable.
#[no_mangle]
pub unsafe extern "C" fn datablock_consumer_flex_ptr(
    handle: *mut DatablockConsumer,
    out_ptr: *mut *const u8,
    out_len: *mut usize,
) -> i32 {
    let Some(consumer) = consumer_mut(handle) else {
        return -1;
    };
    if out_ptr.is_null() || out_len.is_null() {
        return -1;
    }
    let flex = consumer.flexzone();
    out_ptr.write(flex.as_ptr());
    out_len.write(flex.len());
    0
}

/// Verify the flex-zone checksum on demand.
///
/// # Safety
///
/// `handle` must be a live consumer handle.
#[no_mangle]
pub unsafe extern "C" fn datablock_flex_verify(handle: *mut DatablockConsumer) -> bool {
    match consumer_mut(handle) {
        Some(consumer) => consumer.verify_flexzone(),
        None => false,
    }
}

/// Detach and free a consumer handle.
///
/// # Safety
///
/// `handle` must come from `datablock_open` and must not be used
/// afterwards.
#[no_mangle]
pub unsafe extern "C" fn datablock_detach(handle: *mut DatablockConsumer) {
    if !handle.is_null() {
        drop(Box::from_raw(handle as *mut Consumer));
    }
}

// --- region maintenance ---

/// Remove a region name. Returns 0 on success.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_unlink(name: *const c_char) -> i32 {
    let Some(name) = name_from(name) else {
        return -1;
    };
    match labhub::unlink_region(&name) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("[DATABLOCK] unlink '{name}' failed: {e}");
            -1
        }
    }
}

/// OS-level liveness probe for a PID.
#[no_mangle]
pub extern "C" fn datablock_is_process_alive(pid: u64) -> bool {
    labhub::datablock::liveness::is_process_alive(pid)
}

// --- recovery (parameterized by region name) ---

fn with_recovery<T>(
    name: *const c_char,
    fallback: T,
    f: impl FnOnce(&Recovery) -> T,
) -> T {
    // SAFETY: delegated to the callers, which require a valid string.
    let Some(name) = (unsafe { name_from(name) }) else {
        return fallback;
    };
    match Recovery::open(&name) {
        Ok(recovery) => f(&recovery),
        Err(e) => {
            log::error!("[DATABLOCK] recovery open '{name}' failed: {e}");
            fallback
        }
    }
}

/// Diagnose one slot. Returns 0 and fills `out` on success, -1 otherwise.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string; `out` must point to
/// writable memory for one `DatablockSlotDiagnostic`.
#[no_mangle]
pub unsafe extern "C" fn datablock_diagnose_slot(
    name: *const c_char,
    slot_index: u32,
    out: *mut DatablockSlotDiagnostic,
) -> i32 {
    if out.is_null() {
        return -1;
    }
    with_recovery(name, -1, |recovery| match recovery.diagnose_slot(slot_index) {
        Ok(diag) => {
            // SAFETY: `out` checked non-null above; caller guarantees it
            // is writable.
            unsafe { out.write(diag.into()) };
            0
        }
        Err(_) => -1,
    })
}

/// Diagnose every slot into a caller-provided array.
///
/// Fills at most `max_slots` records, stores the region's slot count in
/// `out_count`. Returns 0 on success, -1 otherwise.
///
/// # Safety
///
/// `out` must point to at least `max_slots` writable records; `out_count`
/// must be writable.
#[no_mangle]
pub unsafe extern "C" fn datablock_diagnose_all_slots(
    name: *const c_char,
    out: *mut DatablockSlotDiagnostic,
    max_slots: usize,
    out_count: *mut usize,
) -> i32 {
    if out.is_null() || out_count.is_null() {
        return -1;
    }
    with_recovery(name, -1, |recovery| {
        let diags = recovery.diagnose_all_slots();
        let n = diags.len().min(max_slots);
        for (i, diag) in diags.into_iter().take(n).enumerate() {
            // SAFETY: i < n <= max_slots, within the caller's array.
            unsafe { out.add(i).write(diag.into()) };
        }
        // SAFETY: checked non-null above.
        unsafe { out_count.write(n) };
        0
    })
}

/// Move a slot to FREE (see the library documentation for refusal rules).
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_force_reset_slot(
    name: *const c_char,
    slot_index: u32,
    force: bool,
) -> DatablockRecoveryResult {
    with_recovery(name, DatablockRecoveryResult::RecoveryFailed, |r| {
        r.force_reset_slot(slot_index, force).into()
    })
}

/// Apply `datablock_force_reset_slot` to every slot.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_force_reset_all_slots(
    name: *const c_char,
    force: bool,
) -> DatablockRecoveryResult {
    with_recovery(name, DatablockRecoveryResult::RecoveryFailed, |r| {
        r.force_reset_all_slots(force).into()
    })
}

/// Reconcile a slot's reader count with the heartbeat table.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_release_zombie_readers(
    name: *const c_char,
    slot_index: u32,
    force: bool,
) -> DatablockRecoveryResult {
    with_recovery(name, DatablockRecoveryResult::RecoveryFailed, |r| {
        r.release_zombie_readers(slot_index, force).into()
    })
}

/// Free a slot held by a dead writer.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_release_zombie_writer(
    name: *const c_char,
    slot_index: u32,
) -> DatablockRecoveryResult {
    with_recovery(name, DatablockRecoveryResult::RecoveryFailed, |r| {
        r.release_zombie_writer(slot_index).into()
    })
}

/// Sweep dead consumers out of the heartbeat table.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_cleanup_dead_consumers(
    name: *const c_char,
) -> DatablockRecoveryResult {
    with_recovery(name, DatablockRecoveryResult::RecoveryFailed, |r| {
        r.cleanup_dead_consumers();
        DatablockRecoveryResult::RecoverySuccess
    })
}

/// Verify region integrity; with `repair`, restore what can be restored.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn datablock_validate_integrity(
    name: *const c_char,
    repair: bool,
) -> DatablockRecoveryResult {
    with_recovery(name, DatablockRecoveryResult::RecoveryFailed, |r| {
        r.validate_integrity(repair).into()
    })
}
