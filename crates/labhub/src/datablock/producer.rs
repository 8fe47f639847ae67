// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Producer path: reserve -> write -> commit -> notify.
//!
//! One producer owns a region. `reserve` claims the slot the next
//! generation maps to, waiting for stragglers to drain when the ring has
//! lapped them; `commit` stamps the payload checksum and publishes the new
//! generation with a single release-store, then wakes blocked consumers
//! through the region's commit futex word.

use super::layout::RegionGeometry;
use super::liveness;
use super::region::RegionMap;
use super::slot::SlotStateKind;
use super::{checksum, futex, segment_name, DataBlockError, Result};
use crate::config::{DataBlockConfig, DropPolicy};
use crate::metrics::DataBusMetrics;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Result of a reservation attempt.
#[derive(Debug)]
pub enum ReserveOutcome {
    /// A slot is held in WRITING for this producer
    Slot(SlotHandle),
    /// Drop policy is drop-newest and the target slot did not drain in time
    Busy,
    /// The region's shutdown flag is set
    Stopped,
}

/// A reserved slot, redeemable by exactly one `commit` or `discard`.
#[derive(Debug)]
#[must_use = "a reserved slot must be committed or discarded"]
pub struct SlotHandle {
    index: u32,
    generation: u64,
}

impl SlotHandle {
    /// Slot index this reservation holds.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation this reservation will commit as.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Rebuild a handle from its raw parts.
    ///
    /// For bindings that cannot keep the handle alive across a language
    /// boundary. A handle that does not match the producer's outstanding
    /// reservation is rejected by `commit`/`discard`.
    #[must_use]
    pub fn from_raw(index: u32, generation: u64) -> Self {
        Self { index, generation }
    }
}

/// The writing side of a DataBlock.
pub struct Producer {
    region: RegionMap,
    name: String,
    drop_policy: DropPolicy,
    drain_timeout: Duration,
    next_generation: u64,
    pid: u64,
    reserved: Option<u32>,
    /// Endpoint counters (commits, drops, futex traffic)
    pub metrics: DataBusMetrics,
}

impl Producer {
    /// Create a new region and become its producer.
    ///
    /// Fails with [`DataBlockError::NameConflict`] if the name is taken;
    /// see [`Producer::open`] for taking over a crashed producer's region.
    pub fn create(name: &str, config: DataBlockConfig) -> Result<Self> {
        let shm_name = segment_name(name)?;
        let geometry =
            RegionGeometry::from_parts(config.slot_count, config.slot_bytes, config.flex_bytes)?;
        let pid = u64::from(std::process::id());
        let region = RegionMap::create(
            &shm_name,
            geometry,
            config.flags(),
            liveness::monotonic_ns(),
            pid,
        )?;

        log::debug!(
            "[DATABLOCK] created region {shm_name}: {} slots x {} bytes, flex {}",
            config.slot_count,
            config.slot_bytes,
            config.flex_bytes
        );

        Ok(Self {
            region,
            name: name.to_string(),
            drop_policy: config.drop_policy,
            drain_timeout: config.drain_timeout,
            next_generation: 1,
            pid,
            reserved: None,
            metrics: DataBusMetrics::new(),
        })
    }

    /// Take over an existing region whose producer is gone.
    ///
    /// Fails with [`DataBlockError::NameConflict`] while the recorded
    /// producer PID still names a live process. On success the header is
    /// restamped with this process's PID, the shutdown flag is cleared, and
    /// generation numbering resumes where the previous producer stopped.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, DataBlockConfig::default())
    }

    /// [`Producer::open`] with explicit local timing knobs. Region-level
    /// policies always come from the header, not from `config`.
    pub fn open_with(name: &str, config: DataBlockConfig) -> Result<Self> {
        let shm_name = segment_name(name)?;
        let region = RegionMap::open(&shm_name)?;

        let recorded = region.header().producer_pid();
        let pid = u64::from(std::process::id());
        if recorded != 0 && recorded != pid && liveness::is_process_alive(recorded) {
            return Err(DataBlockError::NameConflict(format!(
                "{name}: producer pid {recorded} is alive"
            )));
        }

        region.header().set_producer_pid(pid);
        region.header().stamp_checksum();
        region.header().clear_shutdown();

        let head = region.header().head_generation();
        let max_slot_gen = region
            .slots()
            .iter()
            .map(super::slot::SlotState::generation)
            .max()
            .unwrap_or(0);
        let next_generation = head.max(max_slot_gen) + 1;

        let (drop_policy, _) =
            DataBlockConfig::policies_from_flags(region.header().flags());

        log::debug!(
            "[DATABLOCK] producer takeover of {shm_name} (previous pid {recorded}), resuming at generation {next_generation}"
        );

        Ok(Self {
            region,
            name: name.to_string(),
            drop_policy,
            drain_timeout: config.drain_timeout,
            next_generation,
            pid,
            reserved: None,
            metrics: DataBusMetrics::new(),
        })
    }

    /// Region name as given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generation the next commit will carry.
    #[must_use]
    pub fn next_generation(&self) -> u64 {
        self.next_generation
    }

    /// Number of payload slots.
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.region.geometry().slot_count
    }

    /// Payload bytes per slot.
    #[must_use]
    pub fn slot_bytes(&self) -> u32 {
        self.region.geometry().slot_bytes
    }

    /// Reserve the slot for the next generation.
    ///
    /// Blocks while the slot drains, bounded by the smaller of `timeout`
    /// and the configured drain timeout. A slot left in WRITING or DRAINING
    /// by a previous (crashed) producer is never stolen here; that is
    /// recovery's job.
    pub fn reserve(&mut self, timeout: Duration) -> Result<ReserveOutcome> {
        if let Some(held) = self.reserved {
            return Err(DataBlockError::InvariantViolated(format!(
                "reservation for slot {held} still outstanding"
            )));
        }

        let generation = self.next_generation;
        let index = self.region.geometry().slot_for_generation(generation);
        let deadline = Instant::now() + timeout.min(self.drain_timeout);

        loop {
            if self.region.header().shutdown_requested() {
                return Ok(ReserveOutcome::Stopped);
            }

            let slot = self.region.slot(index);
            let now = liveness::monotonic_ns();
            match slot.kind() {
                Some(SlotStateKind::Free) => {
                    if slot.try_begin_write(self.pid, now) {
                        self.reserved = Some(index);
                        return Ok(ReserveOutcome::Slot(SlotHandle { index, generation }));
                    }
                }
                Some(SlotStateKind::Committed) => {
                    if slot.reader_count() == 0 {
                        if slot.try_recycle(self.pid, now) {
                            self.reserved = Some(index);
                            return Ok(ReserveOutcome::Slot(SlotHandle { index, generation }));
                        }
                    } else {
                        match self.drain(index, deadline)? {
                            DrainResult::Acquired => {
                                self.reserved = Some(index);
                                return Ok(ReserveOutcome::Slot(SlotHandle {
                                    index,
                                    generation,
                                }));
                            }
                            DrainResult::GaveUp => {
                                DataBusMetrics::inc(&self.metrics.drops);
                                return Ok(ReserveOutcome::Busy);
                            }
                            DrainResult::Stopped => return Ok(ReserveOutcome::Stopped),
                            DrainResult::Retry => {}
                        }
                    }
                }
                Some(SlotStateKind::Writing | SlotStateKind::Draining) => {
                    let lock = slot.write_lock();
                    if lock == self.pid {
                        return Err(DataBlockError::InvariantViolated(format!(
                            "slot {index} already held by this producer"
                        )));
                    }
                    return Err(DataBlockError::InvariantViolated(format!(
                        "slot {index} held in {} by pid {lock}; run recovery",
                        slot.kind().map_or_else(String::new, |k| k.to_string())
                    )));
                }
                None => {
                    return Err(DataBlockError::InvariantViolated(format!(
                        "slot {index} has corrupt state word {}",
                        slot.state_raw()
                    )));
                }
            }
        }
    }

    fn drain(&self, index: u32, deadline: Instant) -> Result<DrainResult> {
        let slot = self.region.slot(index);
        let now = liveness::monotonic_ns();
        if !slot.begin_drain(self.pid, now) {
            // State moved under us (recovery or a racing release); let the
            // caller re-inspect.
            return Ok(DrainResult::Retry);
        }

        loop {
            if slot.reader_count() == 0 {
                let now = liveness::monotonic_ns();
                if slot.finish_drain(now) {
                    return Ok(DrainResult::Acquired);
                }
                // Recovery reset the slot while we drained.
                return Ok(DrainResult::Retry);
            }

            if self.region.header().shutdown_requested() {
                slot.cancel_drain(liveness::monotonic_ns());
                return Ok(DrainResult::Stopped);
            }

            let now = Instant::now();
            if now >= deadline {
                let tick = liveness::monotonic_ns();
                return match self.drop_policy {
                    DropPolicy::DropNewest => {
                        slot.cancel_drain(tick);
                        Ok(DrainResult::GaveUp)
                    }
                    DropPolicy::Overwrite => {
                        log::warn!(
                            "[DATABLOCK] {}: overwriting slot {index} with {} reader(s) still attached",
                            self.name,
                            slot.reader_count()
                        );
                        slot.force_clear_readers();
                        if slot.finish_drain(tick) {
                            Ok(DrainResult::Acquired)
                        } else {
                            Ok(DrainResult::Retry)
                        }
                    }
                };
            }

            let notify = self.region.header().drain_notify();
            let snapshot = notify.load(Ordering::Acquire);
            if slot.reader_count() == 0 {
                continue;
            }
            DataBusMetrics::inc(&self.metrics.futex_waits);
            futex::wait(notify, snapshot, Some(deadline - now));
        }
    }

    /// Payload bytes of a reserved slot.
    pub fn payload_mut(&mut self, handle: &SlotHandle) -> &mut [u8] {
        debug_assert_eq!(self.reserved, Some(handle.index));
        self.region.payload_mut(handle.index)
    }

    /// Publish a reserved slot.
    ///
    /// Stamps the payload checksum and the `valid` flag, advances the
    /// generation, release-stores COMMITTED and wakes blocked consumers.
    /// Returns the committed generation.
    pub fn commit(&mut self, handle: SlotHandle, valid: bool) -> Result<u64> {
        let slot = self.region.slot(handle.index);
        if self.reserved != Some(handle.index)
            || slot.kind() != Some(SlotStateKind::Writing)
            || slot.write_lock() != self.pid
        {
            // A forced recovery reset can pull a live producer's slot away;
            // the reservation is gone and the sample is lost.
            self.reserved = None;
            return Err(DataBlockError::InvariantViolated(format!(
                "slot {} is no longer held by this producer",
                handle.index
            )));
        }

        let digest = checksum::digest(self.region.payload(handle.index));
        slot.commit(handle.generation, digest, valid, liveness::monotonic_ns());
        self.region.header().publish_head(handle.generation);

        let notify = self.region.header().commit_notify();
        notify.fetch_add(1, Ordering::Release);
        futex::wake_all(notify);

        DataBusMetrics::inc(&self.metrics.commits);
        DataBusMetrics::inc(&self.metrics.futex_wakes);
        self.reserved = None;
        self.next_generation = handle.generation + 1;
        Ok(handle.generation)
    }

    /// Return a reserved slot to FREE without advancing the generation.
    pub fn discard(&mut self, handle: SlotHandle) -> Result<()> {
        let slot = self.region.slot(handle.index);
        if self.reserved != Some(handle.index)
            || slot.kind() != Some(SlotStateKind::Writing)
            || slot.write_lock() != self.pid
        {
            self.reserved = None;
            return Err(DataBlockError::InvariantViolated(format!(
                "slot {} is no longer held by this producer",
                handle.index
            )));
        }
        slot.discard(liveness::monotonic_ns());
        self.reserved = None;
        Ok(())
    }

    /// Producer-writable view of the flex zone.
    ///
    /// Call [`Producer::flexzone_checksum_update`] after mutating.
    pub fn flexzone_mut(&mut self) -> &mut [u8] {
        self.region.flex_mut()
    }

    /// Read-only view of the flex zone.
    #[must_use]
    pub fn flexzone(&self) -> &[u8] {
        self.region.flex()
    }

    /// Restamp the flex-zone checksum after a mutation.
    pub fn flexzone_checksum_update(&self) {
        self.region.stamp_flex_checksum();
    }

    /// Set the region's shutdown flag and wake every waiter.
    ///
    /// Blocked consumers return `Stopped`; the region itself stays mapped
    /// and attachable.
    pub fn shutdown(&self) {
        self.region.header().request_shutdown();
        let header = self.region.header();
        header.commit_notify().fetch_add(1, Ordering::Release);
        header.drain_notify().fetch_add(1, Ordering::Release);
        futex::wake_all(header.commit_notify());
        futex::wake_all(header.drain_notify());
    }

    /// Shut down and remove the region name.
    ///
    /// Attached consumers keep their mappings until they detach; new
    /// attaches fail with `NotFound`.
    pub fn destroy(self) -> Result<()> {
        self.shutdown();
        super::segment::ShmSegment::unlink(self.region.shm_name())
    }

    pub(crate) fn region(&self) -> &RegionMap {
        &self.region
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        // Leaving consumers blocked on a producer that will never commit
        // again helps nobody; the region itself stays available for
        // takeover.
        self.shutdown();
    }
}

enum DrainResult {
    Acquired,
    GaveUp,
    Stopped,
    Retry,
}
