// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Diagnostics and forced recovery.
//!
//! Everything here is off the hot path. Producers and consumers are never
//! excluded; a spin word in the header serializes recovery calls against
//! each other only. The one hard rule: a slot in WRITING or DRAINING whose
//! writer PID is alive is never progressed to FREE without an explicit
//! `force`.
//!
//! PID liveness comes from `kill(pid, 0)`, which can report a recycled PID
//! as alive. That false positive is the safe direction - recovery answers
//! `Unsafe` and leaves the slot alone; the operator verifies and re-runs
//! with `force`.

use super::heartbeat;
use super::liveness;
use super::region::RegionMap;
use super::slot::{SlotState, SlotStateKind};
use super::{futex, segment_name, DataBlockError, Result};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Outcome taxonomy shared by every recovery operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The operation changed the region as requested
    Success,
    /// The region could not be brought back to a valid state
    Failed,
    /// Refused: the affected writer PID is alive (use `force` after
    /// verifying the process yourself)
    Unsafe,
    /// Nothing to do: the slot is not in a recoverable condition
    NotStuck,
    /// Slot index out of range
    InvalidSlot,
}

impl RecoveryOutcome {
    /// Process exit code used by the recovery CLI.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::Unsafe => 2,
            Self::NotStuck => 3,
            Self::InvalidSlot => 4,
        }
    }
}

impl std::fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Unsafe => "UNSAFE",
            Self::NotStuck => "NOT_STUCK",
            Self::InvalidSlot => "INVALID_SLOT",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one slot.
#[derive(Clone, Copy, Debug)]
pub struct SlotDiagnostic {
    /// Stable slot identity (the index widened to 64 bits)
    pub slot_id: u64,
    pub slot_index: u32,
    /// Raw state word (0 FREE, 1 WRITING, 2 COMMITTED, 3 DRAINING)
    pub slot_state: u8,
    pub write_lock: u64,
    pub reader_count: u32,
    pub write_generation: u64,
    pub writer_waiting: bool,
    /// In WRITING or DRAINING longer than the stuck threshold
    pub is_stuck: bool,
    pub stuck_duration_ms: u64,
}

/// Point-in-time view of one heartbeat entry.
#[derive(Clone, Copy, Debug)]
pub struct ConsumerDiagnostic {
    pub entry_index: u32,
    pub uid: (u64, u64),
    pub pid: u64,
    pub last_seen_ns: u64,
    pub reading_slot: Option<u32>,
    pub alive: bool,
    pub stale: bool,
}

/// Recovery handle over a named region.
///
/// Opens the region leniently: a damaged header checksum does not prevent
/// diagnosis (it is itself one of the things `validate_integrity` repairs).
pub struct Recovery {
    region: RegionMap,
    name: String,
    stuck_threshold: Duration,
    stale_threshold: Duration,
}

impl Recovery {
    /// Open a region for diagnosis and repair.
    pub fn open(name: &str) -> Result<Self> {
        let shm_name = segment_name(name)?;
        let region = RegionMap::open_relaxed(&shm_name)?;
        Ok(Self {
            region,
            name: name.to_string(),
            stuck_threshold: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(5),
        })
    }

    /// Override the stuck threshold (default 5 s).
    #[must_use]
    pub fn stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    /// Override the stale threshold (default 5 s).
    #[must_use]
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Region name as given at open.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of payload slots.
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.region.geometry().slot_count
    }

    /// Recorded producer PID (0 when none).
    #[must_use]
    pub fn producer_pid(&self) -> u64 {
        self.region.header().producer_pid()
    }

    /// Whether the recorded producer is alive.
    #[must_use]
    pub fn producer_alive(&self) -> bool {
        let pid = self.producer_pid();
        pid != 0 && liveness::is_process_alive(pid)
    }

    // --- diagnosis (lock-free, read-only) ---

    /// Diagnose one slot.
    pub fn diagnose_slot(&self, index: u32) -> Result<SlotDiagnostic> {
        if index >= self.slot_count() {
            return Err(DataBlockError::InvalidConfig(format!(
                "slot index {index} out of range (slot count {})",
                self.slot_count()
            )));
        }
        Ok(self.diagnose_unchecked(index))
    }

    /// Diagnose every slot.
    #[must_use]
    pub fn diagnose_all_slots(&self) -> Vec<SlotDiagnostic> {
        (0..self.slot_count())
            .map(|i| self.diagnose_unchecked(i))
            .collect()
    }

    fn diagnose_unchecked(&self, index: u32) -> SlotDiagnostic {
        let slot = self.region.slot(index);
        let raw = slot.state_raw();
        let busy = matches!(
            SlotStateKind::from_u32(raw),
            Some(SlotStateKind::Writing | SlotStateKind::Draining)
        );
        let stuck_duration = if busy {
            let since = match slot.state_since_ns() {
                0 => self.region.header().creation_monotonic_ns(),
                ns => ns,
            };
            liveness::ns_since(since)
        } else {
            Duration::ZERO
        };

        SlotDiagnostic {
            slot_id: u64::from(index),
            slot_index: index,
            slot_state: raw as u8,
            write_lock: slot.write_lock(),
            reader_count: slot.reader_count(),
            write_generation: slot.generation(),
            writer_waiting: slot.writer_waiting(),
            is_stuck: busy && stuck_duration > self.stuck_threshold,
            stuck_duration_ms: stuck_duration.as_millis() as u64,
        }
    }

    /// Diagnose every occupied heartbeat entry.
    #[must_use]
    pub fn diagnose_consumers(&self) -> Vec<ConsumerDiagnostic> {
        let now = liveness::monotonic_ns();
        self.region
            .heartbeats()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_occupied())
            .map(|(i, e)| ConsumerDiagnostic {
                entry_index: i as u32,
                uid: e.uid(),
                pid: e.pid(),
                last_seen_ns: e.last_seen_ns(),
                reading_slot: e.reading_slot(),
                alive: liveness::is_process_alive(e.pid()),
                stale: heartbeat::is_stale(e, now, self.stale_threshold),
            })
            .collect()
    }

    // --- forced recovery (serialized against other recovery calls) ---

    /// Move a slot to FREE.
    ///
    /// Refuses `Unsafe` when the write lock names a live process and
    /// `force` is not set; `NotStuck` when the slot is FREE, or COMMITTED
    /// with no readers.
    pub fn force_reset_slot(&self, index: u32, force: bool) -> RecoveryOutcome {
        let _guard = self.lock();
        self.force_reset_slot_locked(index, force)
    }

    fn force_reset_slot_locked(&self, index: u32, force: bool) -> RecoveryOutcome {
        if index >= self.slot_count() {
            return RecoveryOutcome::InvalidSlot;
        }
        let slot = self.region.slot(index);

        match slot.kind() {
            Some(SlotStateKind::Free) => return RecoveryOutcome::NotStuck,
            Some(SlotStateKind::Committed) if slot.reader_count() == 0 => {
                return RecoveryOutcome::NotStuck;
            }
            Some(_) => {}
            None => {
                if !force {
                    log::warn!(
                        "[DATABLOCK] {}: slot {index} has corrupt state word {}; reset requires force",
                        self.name,
                        slot.state_raw()
                    );
                    return RecoveryOutcome::Failed;
                }
            }
        }

        let writer = slot.write_lock();
        if writer != 0 && liveness::is_process_alive(writer) && !force {
            log::warn!(
                "[DATABLOCK] {}: slot {index} is held by live pid {writer}; verify the process before forcing",
                self.name
            );
            return RecoveryOutcome::Unsafe;
        }

        self.reset_and_wake(slot);
        log::info!("[DATABLOCK] {}: slot {index} reset to FREE", self.name);
        RecoveryOutcome::Success
    }

    /// Apply [`Recovery::force_reset_slot`] to every slot.
    ///
    /// `NotStuck` slots are skipped; the aggregate is `Success` only when
    /// no slot reported `Unsafe` or `Failed` (the most severe of those two
    /// wins otherwise).
    pub fn force_reset_all_slots(&self, force: bool) -> RecoveryOutcome {
        let _guard = self.lock();
        let mut worst = RecoveryOutcome::Success;
        for index in 0..self.slot_count() {
            match self.force_reset_slot_locked(index, force) {
                RecoveryOutcome::Unsafe => worst = RecoveryOutcome::Unsafe,
                RecoveryOutcome::Failed if worst != RecoveryOutcome::Unsafe => {
                    worst = RecoveryOutcome::Failed;
                }
                _ => {}
            }
        }
        worst
    }

    /// Reconcile a slot's reader count with the heartbeat table.
    ///
    /// Dead registered readers are subtracted; the count becomes the number
    /// of live registered readers (zero with `force`, which evicts live
    /// readers as well).
    pub fn release_zombie_readers(&self, index: u32, force: bool) -> RecoveryOutcome {
        let _guard = self.lock();
        self.release_zombie_readers_locked(index, force)
    }

    fn release_zombie_readers_locked(&self, index: u32, force: bool) -> RecoveryOutcome {
        if index >= self.slot_count() {
            return RecoveryOutcome::InvalidSlot;
        }
        let slot = self.region.slot(index);
        let current = slot.reader_count();
        if current == 0 {
            return RecoveryOutcome::NotStuck;
        }

        let live = self
            .region
            .heartbeats()
            .iter()
            .filter(|e| e.is_occupied() && e.reading_slot() == Some(index))
            .filter(|e| liveness::is_process_alive(e.pid()))
            .count() as u32;

        let target = if force { 0 } else { live };
        if target == current {
            return RecoveryOutcome::NotStuck;
        }

        slot.set_reader_count(target);
        log::info!(
            "[DATABLOCK] {}: slot {index} readers {current} -> {target} (released {})",
            self.name,
            current.saturating_sub(target)
        );
        if target == 0 {
            self.wake_drain();
        }
        RecoveryOutcome::Success
    }

    /// Free a slot whose writer died mid-write.
    ///
    /// `Unsafe` while the write lock names a live process; `NotStuck` when
    /// the slot is not held for writing at all.
    pub fn release_zombie_writer(&self, index: u32) -> RecoveryOutcome {
        let _guard = self.lock();
        self.release_zombie_writer_locked(index)
    }

    fn release_zombie_writer_locked(&self, index: u32) -> RecoveryOutcome {
        if index >= self.slot_count() {
            return RecoveryOutcome::InvalidSlot;
        }
        let slot = self.region.slot(index);
        if !matches!(
            slot.kind(),
            Some(SlotStateKind::Writing | SlotStateKind::Draining)
        ) {
            return RecoveryOutcome::NotStuck;
        }
        let writer = slot.write_lock();
        if writer == 0 {
            return RecoveryOutcome::NotStuck;
        }
        if liveness::is_process_alive(writer) {
            log::warn!(
                "[DATABLOCK] {}: writer pid {writer} of slot {index} is alive; refusing",
                self.name
            );
            return RecoveryOutcome::Unsafe;
        }

        self.reset_and_wake(slot);
        log::info!(
            "[DATABLOCK] {}: released dead writer pid {writer} from slot {index}",
            self.name
        );
        RecoveryOutcome::Success
    }

    /// Sweep the heartbeat table.
    ///
    /// Every entry that is stale and whose PID is dead is zeroed, and its
    /// registration on whatever slot it was reading is subtracted. Returns
    /// the number of entries swept; running twice back-to-back sweeps
    /// nothing the second time.
    pub fn cleanup_dead_consumers(&self) -> usize {
        let _guard = self.lock();
        self.cleanup_dead_consumers_locked()
    }

    fn cleanup_dead_consumers_locked(&self) -> usize {
        let now = liveness::monotonic_ns();
        let mut swept = 0;
        for (i, entry) in self.region.heartbeats().iter().enumerate() {
            if !heartbeat::is_dead(entry, now, self.stale_threshold) {
                continue;
            }
            let pid = entry.pid();
            if let Some(slot_index) = entry.reading_slot() {
                if slot_index < self.slot_count() {
                    let slot = self.region.slot(slot_index);
                    if slot.release_reader() && slot.writer_waiting() {
                        self.wake_drain();
                    }
                }
            }
            entry.clear();
            swept += 1;
            log::info!(
                "[DATABLOCK] {}: swept dead consumer pid {pid} (entry {i})",
                self.name
            );
        }
        swept
    }

    /// Verify header, slot invariants, heartbeat consistency and the
    /// flex-zone checksum; with `repair`, restore what can be restored
    /// without touching a live writer's slot.
    ///
    /// Without `repair` the call is read-only and idempotent.
    pub fn validate_integrity(&self, repair: bool) -> RecoveryOutcome {
        let _guard = self.lock();

        let issues = self.collect_issues();
        if issues.is_empty() {
            return RecoveryOutcome::Success;
        }
        for issue in &issues {
            log::warn!("[DATABLOCK] {}: integrity: {issue}", self.name);
        }
        if !repair {
            return RecoveryOutcome::Failed;
        }

        self.cleanup_dead_consumers_locked();

        // Dead writers first: their slots block everything else.
        for index in 0..self.slot_count() {
            let slot = self.region.slot(index);
            if matches!(
                slot.kind(),
                Some(SlotStateKind::Writing | SlotStateKind::Draining)
            ) {
                let writer = slot.write_lock();
                if writer == 0 || !liveness::is_process_alive(writer) {
                    self.reset_and_wake(slot);
                }
            }
        }

        // Reconcile reader counts with the (now swept) registrations.
        for index in 0..self.slot_count() {
            let slot = self.region.slot(index);
            if matches!(
                slot.kind(),
                Some(SlotStateKind::Writing | SlotStateKind::Draining)
            ) {
                continue; // live writer holds this slot
            }
            let registered = self.registered_readers(index);
            if slot.reader_count() != registered {
                slot.set_reader_count(registered);
                if registered == 0 {
                    self.wake_drain();
                }
            }
        }

        let producer_gone = !self.producer_alive();
        if producer_gone {
            if !self.region.header().verify_checksum() {
                self.region.header().stamp_checksum();
            }
            if !self.region.verify_flex() {
                log::warn!(
                    "[DATABLOCK] {}: restamping flex-zone checksum over current contents",
                    self.name
                );
                self.region.stamp_flex_checksum();
            }
        }

        let remaining = self.collect_issues();
        if remaining.is_empty() {
            RecoveryOutcome::Success
        } else {
            for issue in &remaining {
                log::warn!("[DATABLOCK] {}: unrepaired: {issue}", self.name);
            }
            RecoveryOutcome::Failed
        }
    }

    fn collect_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !self.region.header().verify_checksum() {
            issues.push("header checksum mismatch".to_string());
        }

        let mut held_for_writing = 0u32;
        for index in 0..self.slot_count() {
            let slot = self.region.slot(index);
            if let Err(e) = slot.check_invariants() {
                issues.push(format!("slot {index}: {e}"));
            }
            if matches!(
                slot.kind(),
                Some(SlotStateKind::Writing | SlotStateKind::Draining)
            ) {
                held_for_writing += 1;
            }
        }
        if held_for_writing > 1 {
            issues.push(format!(
                "{held_for_writing} slots held for writing (single-writer region)"
            ));
        }

        for (i, entry) in self.region.heartbeats().iter().enumerate() {
            if !entry.is_occupied() {
                continue;
            }
            if let Some(slot_index) = entry.reading_slot() {
                if slot_index >= self.slot_count() {
                    issues.push(format!(
                        "heartbeat entry {i} reads out-of-range slot {slot_index}"
                    ));
                }
            }
        }

        for index in 0..self.slot_count() {
            let slot = self.region.slot(index);
            if matches!(
                slot.kind(),
                Some(SlotStateKind::Writing | SlotStateKind::Draining)
            ) {
                continue;
            }
            let registered = self.registered_readers(index);
            let count = slot.reader_count();
            if count != registered {
                issues.push(format!(
                    "slot {index}: reader_count {count} != {registered} registered readers"
                ));
            }
        }

        if !self.region.verify_flex() {
            issues.push("flex-zone checksum mismatch".to_string());
        }

        issues
    }

    fn registered_readers(&self, index: u32) -> u32 {
        self.region
            .heartbeats()
            .iter()
            .filter(|e| e.is_occupied() && e.reading_slot() == Some(index))
            .count() as u32
    }

    fn reset_and_wake(&self, slot: &SlotState) {
        slot.reset(liveness::monotonic_ns());
        self.wake_drain();
    }

    fn wake_drain(&self) {
        let notify = self.region.header().drain_notify();
        notify.fetch_add(1, Ordering::Release);
        futex::wake_all(notify);
    }

    fn lock(&self) -> RecoveryLockGuard<'_> {
        RecoveryLockGuard::take(&self.region, &self.name)
    }

    pub(crate) fn region(&self) -> &RegionMap {
        &self.region
    }

    #[cfg(test)]
    fn heartbeats(&self) -> &[heartbeat::HeartbeatEntry] {
        self.region.heartbeats()
    }
}

/// Spin-lock guard over the header's recovery word.
///
/// Excludes concurrent recovery calls only; producers and consumers never
/// take it. A holder that died is detected by timeout and the lock is
/// stolen.
struct RecoveryLockGuard<'a> {
    region: &'a RegionMap,
}

impl<'a> RecoveryLockGuard<'a> {
    fn take(region: &'a RegionMap, name: &str) -> Self {
        let word = region.header().recovery_lock();
        let start = std::time::Instant::now();
        loop {
            if word
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Self { region };
            }
            if start.elapsed() > Duration::from_secs(1) {
                log::warn!(
                    "[DATABLOCK] {name}: recovery lock held too long; assuming a dead holder and stealing it"
                );
                word.store(1, Ordering::Release);
                return Self { region };
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

impl Drop for RecoveryLockGuard<'_> {
    fn drop(&mut self) {
        self.region.header().recovery_lock().store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataBlockConfig;
    use crate::datablock::consumer::Consumer;
    use crate::datablock::producer::{Producer, ReserveOutcome};
    use std::time::Duration;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("rectest-{ts}")
    }

    fn small_config() -> DataBlockConfig {
        DataBlockConfig::with_geometry(4, 64, 32).drain_timeout(Duration::from_millis(20))
    }

    struct Cleanup(String);
    impl Drop for Cleanup {
        fn drop(&mut self) {
            crate::datablock::unlink_region(&self.0).ok();
        }
    }

    fn dead_pid() -> u64 {
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let pid = u64::from(child.id());
        child.wait().expect("wait");
        pid
    }

    fn commit_one(producer: &mut Producer) -> u64 {
        let ReserveOutcome::Slot(h) = producer
            .reserve(Duration::from_millis(100))
            .expect("reserve")
        else {
            panic!("expected slot");
        };
        producer.commit(h, true).expect("commit")
    }

    #[test]
    fn test_diagnose_fresh_region() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let _producer = Producer::create(&name, small_config()).expect("create");

        let recovery = Recovery::open(&name).expect("open");
        let diags = recovery.diagnose_all_slots();
        assert_eq!(diags.len(), 4);
        for d in &diags {
            assert_eq!(d.slot_state, SlotStateKind::Free as u8);
            assert_eq!(d.write_lock, 0);
            assert_eq!(d.reader_count, 0);
            assert!(!d.is_stuck);
            assert_eq!(d.stuck_duration_ms, 0);
        }
        assert!(recovery.producer_alive());
    }

    #[test]
    fn test_diagnose_slot_out_of_range() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let _producer = Producer::create(&name, small_config()).expect("create");
        let recovery = Recovery::open(&name).expect("open");
        assert!(recovery.diagnose_slot(4).is_err());
        assert!(recovery.diagnose_slot(0).is_ok());
    }

    #[test]
    fn test_dead_writer_diagnosed_stuck_and_released() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let producer = Producer::create(&name, small_config()).expect("create");

        // A producer that died mid-write: slot 2 in WRITING under a PID
        // that no longer exists.
        let pid = dead_pid();
        producer
            .region()
            .slot(2)
            .try_begin_write(pid, liveness::monotonic_ns());

        let recovery = Recovery::open(&name)
            .expect("open")
            .stuck_threshold(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        let diag = recovery.diagnose_slot(2).expect("diagnose");
        assert_eq!(diag.slot_state, SlotStateKind::Writing as u8);
        assert_eq!(diag.write_lock, pid);
        assert!(diag.is_stuck);
        assert!(diag.stuck_duration_ms >= 1);

        assert_eq!(recovery.release_zombie_writer(2), RecoveryOutcome::Success);
        assert_eq!(
            producer.region().slot(2).kind(),
            Some(SlotStateKind::Free)
        );
        assert_eq!(recovery.release_zombie_writer(2), RecoveryOutcome::NotStuck);
    }

    #[test]
    fn test_release_zombie_writer_refuses_live_writer() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");

        let ReserveOutcome::Slot(handle) = producer
            .reserve(Duration::from_millis(100))
            .expect("reserve")
        else {
            panic!("expected slot");
        };

        let recovery = Recovery::open(&name).expect("open");
        assert_eq!(
            recovery.release_zombie_writer(handle.index()),
            RecoveryOutcome::Unsafe
        );
        producer.discard(handle).expect("discard");
    }

    #[test]
    fn test_force_reset_overrides_live_writer() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");

        let ReserveOutcome::Slot(handle) = producer
            .reserve(Duration::from_millis(100))
            .expect("reserve")
        else {
            panic!("expected slot");
        };
        let index = handle.index();

        let recovery = Recovery::open(&name).expect("open");
        assert_eq!(
            recovery.force_reset_slot(index, false),
            RecoveryOutcome::Unsafe
        );
        assert_eq!(
            recovery.force_reset_slot(index, true),
            RecoveryOutcome::Success
        );

        // The producer's reservation is gone; its commit reports the loss.
        assert!(matches!(
            producer.commit(handle, true),
            Err(DataBlockError::InvariantViolated(_))
        ));
    }

    #[test]
    fn test_force_reset_not_stuck_cases() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");

        let recovery = Recovery::open(&name).expect("open");
        assert_eq!(recovery.force_reset_slot(0, false), RecoveryOutcome::NotStuck);

        commit_one(&mut producer);
        assert_eq!(recovery.force_reset_slot(1, false), RecoveryOutcome::NotStuck);
        assert_eq!(recovery.force_reset_slot(9, false), RecoveryOutcome::InvalidSlot);
    }

    #[test]
    fn test_force_reset_all_aggregates() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");

        let recovery = Recovery::open(&name).expect("open");
        // Nothing stuck anywhere: success.
        assert_eq!(recovery.force_reset_all_slots(false), RecoveryOutcome::Success);

        // A live writer makes the aggregate unsafe without force.
        let ReserveOutcome::Slot(handle) = producer
            .reserve(Duration::from_millis(100))
            .expect("reserve")
        else {
            panic!("expected slot");
        };
        assert_eq!(recovery.force_reset_all_slots(false), RecoveryOutcome::Unsafe);
        assert_eq!(recovery.force_reset_all_slots(true), RecoveryOutcome::Success);
        drop(handle);
    }

    #[test]
    fn test_release_zombie_readers_subtracts_dead() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");
        commit_one(&mut producer); // generation 1 in slot 1

        // One live reader (this process) and one dead reader both
        // registered on slot 1.
        let region = producer.region();
        let slot = region.slot(1);
        assert!(slot.acquire_reader(1));
        assert!(slot.acquire_reader(1));
        let live = u64::from(std::process::id());
        let dead = dead_pid();
        let hb = region.heartbeats();
        let live_idx = heartbeat::claim(hb, (1, 1), live, liveness::monotonic_ns()).unwrap();
        let dead_idx = heartbeat::claim(hb, (2, 2), dead, 0).unwrap();
        hb[live_idx].set_reading(Some(1));
        hb[dead_idx].set_reading(Some(1));

        let recovery = Recovery::open(&name).expect("open");
        assert_eq!(
            recovery.release_zombie_readers(1, false),
            RecoveryOutcome::Success
        );
        assert_eq!(slot.reader_count(), 1);

        // Force clears the live reader as well.
        assert_eq!(
            recovery.release_zombie_readers(1, true),
            RecoveryOutcome::Success
        );
        assert_eq!(slot.reader_count(), 0);
        assert_eq!(
            recovery.release_zombie_readers(1, false),
            RecoveryOutcome::NotStuck
        );
    }

    #[test]
    fn test_cleanup_dead_consumers_sweeps_and_decrements() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");
        commit_one(&mut producer);

        // A consumer that died while reading slot 1.
        let region = producer.region();
        let slot = region.slot(1);
        assert!(slot.acquire_reader(1));
        let dead = dead_pid();
        let hb = region.heartbeats();
        let idx = heartbeat::claim(hb, (7, 7), dead, 0).unwrap();
        hb[idx].set_reading(Some(1));

        let recovery = Recovery::open(&name)
            .expect("open")
            .stale_threshold(Duration::ZERO);
        assert_eq!(recovery.cleanup_dead_consumers(), 1);
        assert!(!recovery.heartbeats()[idx].is_occupied());
        assert_eq!(slot.reader_count(), 0);

        // Idempotent: the second sweep finds nothing.
        assert_eq!(recovery.cleanup_dead_consumers(), 0);
        assert_eq!(slot.reader_count(), 0);
    }

    #[test]
    fn test_cleanup_spares_live_consumer() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let _producer = Producer::create(&name, small_config()).expect("create");
        let consumer = Consumer::attach(&name).expect("attach");

        let recovery = Recovery::open(&name)
            .expect("open")
            .stale_threshold(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        // Stale (threshold zero) but alive: not swept.
        assert_eq!(recovery.cleanup_dead_consumers(), 0);
        drop(consumer);
    }

    #[test]
    fn test_validate_clean_region() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");
        commit_one(&mut producer);

        let recovery = Recovery::open(&name).expect("open");
        assert_eq!(recovery.validate_integrity(false), RecoveryOutcome::Success);
        // Idempotent and pure.
        assert_eq!(recovery.validate_integrity(false), RecoveryOutcome::Success);
    }

    #[test]
    fn test_validate_detects_and_repairs_dead_writer() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let producer = Producer::create(&name, small_config()).expect("create");

        let pid = dead_pid();
        producer
            .region()
            .slot(3)
            .try_begin_write(pid, liveness::monotonic_ns());
        // Make takeover legal for the repair of producer-owned checksums.
        producer.region().header().set_producer_pid(pid);
        producer.region().header().stamp_checksum();

        let recovery = Recovery::open(&name).expect("open");
        // A WRITING slot is not by itself an invariant violation; damage
        // the flex zone so validation has something to flag.
        producer.region().flex_mut()[0] ^= 0xFF;
        assert_eq!(recovery.validate_integrity(false), RecoveryOutcome::Failed);

        assert_eq!(recovery.validate_integrity(true), RecoveryOutcome::Success);
        assert!(producer.region().verify_flex());
        assert_eq!(recovery.validate_integrity(false), RecoveryOutcome::Success);
        assert_eq!(
            producer.region().slot(3).kind(),
            Some(SlotStateKind::Free)
        );
    }

    #[test]
    fn test_validate_repairs_reader_accounting() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");
        commit_one(&mut producer);

        // A reader count with no registered readers behind it.
        producer.region().slot(1).set_reader_count(3);

        let recovery = Recovery::open(&name).expect("open");
        assert_eq!(recovery.validate_integrity(false), RecoveryOutcome::Failed);
        assert_eq!(recovery.validate_integrity(true), RecoveryOutcome::Success);
        assert_eq!(producer.region().slot(1).reader_count(), 0);
    }

    #[test]
    fn test_validate_leaves_live_writer_alone() {
        let name = unique_name();
        let _cleanup = Cleanup(name.clone());
        let mut producer = Producer::create(&name, small_config()).expect("create");

        let ReserveOutcome::Slot(handle) = producer
            .reserve(Duration::from_millis(100))
            .expect("reserve")
        else {
            panic!("expected slot");
        };

        // Corrupt reader accounting elsewhere so repair has work to do.
        producer.region().slot(3).set_reader_count(2);

        let recovery = Recovery::open(&name).expect("open");
        assert_eq!(recovery.validate_integrity(true), RecoveryOutcome::Success);

        // The held slot is untouched and the producer can commit.
        assert_eq!(
            producer.region().slot(handle.index()).kind(),
            Some(SlotStateKind::Writing)
        );
        producer.commit(handle, true).expect("commit");
    }
}
