// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Consumer path: attach -> acquire -> verify -> release.
//!
//! A consumer maps an existing region, registers a heartbeat entry and
//! reads the most recently committed generation newer than the one it last
//! delivered. Payload access is zero-copy: [`SlotRead`] borrows the mapped
//! bytes and holds the slot's reader registration until dropped.
//!
//! Falling behind is not an error: the consumer always jumps to the newest
//! committed generation and reports how many it skipped. Blocking reads
//! wait on the region's commit futex word with the snapshot / re-check /
//! wait discipline, so a commit between poll and sleep can never be lost.

use super::heartbeat;
use super::liveness;
use super::region::RegionMap;
use super::slot::SlotStateKind;
use super::{checksum, futex, segment_name, DataBlockError, Result};
use crate::config::{ChecksumFailPolicy, DataBlockConfig};
use crate::metrics::DataBusMetrics;
use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Result of a read attempt.
#[derive(Debug)]
pub enum ReadOutcome<'a> {
    /// A newly committed sample, held until the guard drops
    Slot(SlotRead<'a>),
    /// No new generation appeared within the deadline
    TimedOut,
    /// The region's shutdown flag is set
    Stopped,
}

/// Unguarded read result for bindings that cannot hold a borrow.
///
/// The slot's reader registration stays active until
/// [`Consumer::release_current`] is called; `payload_ptr` is valid exactly
/// that long.
#[derive(Debug)]
pub enum RawReadOutcome {
    Sample(RawSample),
    TimedOut,
    Stopped,
}

/// Borrowless view of a delivered sample.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub index: u32,
    pub generation: u64,
    pub skipped: u64,
    pub valid: bool,
    pub payload_ptr: *const u8,
    pub payload_len: usize,
}

/// A delivered sample. Releases its slot registration on drop.
pub struct SlotRead<'a> {
    consumer: &'a Consumer,
    index: u32,
    generation: u64,
    skipped: u64,
    valid: bool,
}

impl std::fmt::Debug for SlotRead<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRead")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("skipped", &self.skipped)
            .field("valid", &self.valid)
            .finish()
    }
}

impl SlotRead<'_> {
    /// Committed generation of this sample.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Generations skipped since the previous delivery.
    #[inline]
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// False when the producer flagged the commit invalid, or when the
    /// checksum failed under the pass policy.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Slot index holding this sample.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The payload bytes, in place in shared memory.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.consumer.region.payload(self.index)
    }
}

impl Drop for SlotRead<'_> {
    fn drop(&mut self) {
        self.consumer.release_current();
    }
}

/// The reading side of a DataBlock.
pub struct Consumer {
    region: RegionMap,
    name: String,
    hb_index: usize,
    uid: (u64, u64),
    policy: ChecksumFailPolicy,
    last_delivered: u64,
    held: Cell<Option<u32>>,
    /// Endpoint counters (deliveries, skips, checksum failures)
    pub metrics: DataBusMetrics,
}

impl Consumer {
    /// Map an existing region read-side and register a heartbeat entry.
    ///
    /// Delivery starts from the region's current head: only generations
    /// committed after the attach are seen.
    pub fn attach(name: &str) -> Result<Self> {
        let shm_name = segment_name(name)?;
        let region = RegionMap::open(&shm_name)?;

        let uid = heartbeat::fresh_uid();
        let pid = u64::from(std::process::id());
        let now = liveness::monotonic_ns();
        let hb_index = heartbeat::claim(region.heartbeats(), uid, pid, now)
            .ok_or(DataBlockError::HeartbeatFull)?;

        let (_, policy) = DataBlockConfig::policies_from_flags(region.header().flags());
        let last_delivered = region.header().head_generation();

        log::debug!(
            "[DATABLOCK] consumer {uid:x?} attached to {shm_name} at generation {last_delivered}"
        );

        Ok(Self {
            region,
            name: name.to_string(),
            hb_index,
            uid,
            policy,
            last_delivered,
            held: Cell::new(None),
            metrics: DataBusMetrics::new(),
        })
    }

    /// Region name as given at attach.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This consumer's 128-bit UID as (hi, lo).
    #[must_use]
    pub fn uid(&self) -> (u64, u64) {
        self.uid
    }

    /// Generation of the last delivered (or suppressed) sample.
    #[must_use]
    pub fn last_delivered_generation(&self) -> u64 {
        self.last_delivered
    }

    /// Latest generation the producer has published.
    #[must_use]
    pub fn head_generation(&self) -> u64 {
        self.region.header().head_generation()
    }

    /// Payload bytes per slot.
    #[must_use]
    pub fn slot_bytes(&self) -> u32 {
        self.region.geometry().slot_bytes
    }

    /// Read the next sample, blocking up to `timeout`.
    ///
    /// `Duration::ZERO` polls without blocking.
    pub fn read(&mut self, timeout: Duration) -> Result<ReadOutcome<'_>> {
        match self.read_raw(timeout)? {
            RawReadOutcome::Sample(raw) => Ok(ReadOutcome::Slot(SlotRead {
                consumer: &*self,
                index: raw.index,
                generation: raw.generation,
                skipped: raw.skipped,
                valid: raw.valid,
            })),
            RawReadOutcome::TimedOut => Ok(ReadOutcome::TimedOut),
            RawReadOutcome::Stopped => Ok(ReadOutcome::Stopped),
        }
    }

    /// [`Consumer::read`] without the guard, for FFI bindings.
    ///
    /// A delivered sample keeps its slot registration until
    /// [`Consumer::release_current`]; calling `read_raw` again releases the
    /// previous sample first.
    pub fn read_raw(&mut self, timeout: Duration) -> Result<RawReadOutcome> {
        self.release_current();
        let deadline = Instant::now() + timeout;

        loop {
            if self.region.header().shutdown_requested() {
                return Ok(RawReadOutcome::Stopped);
            }

            let head = self.region.header().head_generation();
            if head > self.last_delivered {
                match self.try_deliver(head)? {
                    Attempt::Delivered(raw) => return Ok(RawReadOutcome::Sample(raw)),
                    Attempt::Retry => continue,
                }
            }

            let now = Instant::now();
            if now >= deadline {
                DataBusMetrics::inc(&self.metrics.timeouts);
                return Ok(RawReadOutcome::TimedOut);
            }

            let notify = self.region.header().commit_notify();
            let snapshot = notify.load(Ordering::Acquire);
            if self.region.header().head_generation() != head
                || self.region.header().shutdown_requested()
            {
                continue;
            }
            DataBusMetrics::inc(&self.metrics.futex_waits);
            futex::wait(notify, snapshot, Some(deadline - now));
        }
    }

    /// Attempt to acquire, verify and account generation `target`.
    fn try_deliver(&mut self, target: u64) -> Result<Attempt> {
        let index = self.region.geometry().slot_for_generation(target);
        let slot = self.region.slot(index);

        if !slot.acquire_reader(target) {
            // The generation moved past us between the head load and the
            // acquire; re-read the head and chase the new one.
            return Ok(Attempt::Retry);
        }

        let entry = &self.region.heartbeats()[self.hb_index];
        entry.refresh(liveness::monotonic_ns());
        entry.set_reading(Some(index));
        self.held.set(Some(index));

        let payload = self.region.payload(index);
        let checksum_ok = checksum::verify(payload, &slot.checksum());
        let producer_valid = slot.valid();

        // Re-check after touching the payload: a forced overwrite may have
        // recycled the slot mid-read, making everything just computed
        // meaningless.
        if slot.generation() != target || slot.state_raw() == SlotStateKind::Writing as u32 {
            self.release_current();
            return Ok(Attempt::Retry);
        }

        let skipped = target - self.last_delivered - 1;

        if !checksum_ok {
            DataBusMetrics::inc(&self.metrics.checksum_failures);
            match self.policy {
                ChecksumFailPolicy::Strict => {
                    log::error!(
                        "[DATABLOCK] {}: {}",
                        self.name,
                        DataBlockError::ChecksumMismatch { generation: target }
                    );
                    // Step over the corrupt generation so the read does not
                    // spin on it; the caller sees a timeout if nothing newer
                    // arrives.
                    self.last_delivered = target;
                    self.release_current();
                    return Ok(Attempt::Retry);
                }
                ChecksumFailPolicy::Pass => {
                    log::warn!(
                        "[DATABLOCK] {}: delivering generation {target} with failed checksum",
                        self.name
                    );
                }
            }
        }

        self.last_delivered = target;
        DataBusMetrics::inc(&self.metrics.deliveries);
        DataBusMetrics::add(&self.metrics.skips, skipped);

        Ok(Attempt::Delivered(RawSample {
            index,
            generation: target,
            skipped,
            valid: producer_valid && checksum_ok,
            payload_ptr: payload.as_ptr(),
            payload_len: payload.len(),
        }))
    }

    /// Release the outstanding sample, if any.
    ///
    /// Wakes a draining producer when this was the slot's last reader.
    pub fn release_current(&self) {
        let Some(index) = self.held.take() else {
            return;
        };
        self.region.heartbeats()[self.hb_index].set_reading(None);

        let slot = self.region.slot(index);
        if slot.release_reader() && slot.writer_waiting() {
            let notify = self.region.header().drain_notify();
            notify.fetch_add(1, Ordering::Release);
            futex::wake_all(notify);
            DataBusMetrics::inc(&self.metrics.futex_wakes);
        }
    }

    /// Read-only view of the flex zone.
    #[must_use]
    pub fn flexzone(&self) -> &[u8] {
        self.region.flex()
    }

    /// Verify the flex-zone checksum on demand.
    #[must_use]
    pub fn verify_flexzone(&self) -> bool {
        self.region.verify_flex()
    }

    /// Release the heartbeat entry. Also performed on drop.
    pub fn detach(&mut self) {
        self.release_current();
        let entry = &self.region.heartbeats()[self.hb_index];
        if entry.pid() == u64::from(std::process::id()) {
            entry.clear();
        }
    }

    pub(crate) fn region(&self) -> &RegionMap {
        &self.region
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.detach();
    }
}

enum Attempt {
    Delivered(RawSample),
    Retry,
}
