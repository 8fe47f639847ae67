// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Consumer heartbeat table.
//!
//! A flat, cache-line-aligned array of [`HEARTBEAT_CAPACITY`] entries inside
//! the region, one per attached consumer. An entry binds a 128-bit consumer
//! UID to its PID, the monotonic tick of its last successful acquire, and
//! the slot it is currently reading (so recovery can subtract a dead
//! reader's hold from exactly the right slot).
//!
//! Entries are claimed with a CAS on the PID word, refreshed on every
//! acquire, and cleared on detach. The table is searched linearly; at 64
//! entries the scan is noise next to a slot read.

use super::liveness;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Number of heartbeat entries per region.
pub const HEARTBEAT_CAPACITY: usize = 64;

/// One heartbeat entry (64 bytes, cache-line-aligned).
#[repr(C, align(64))]
pub struct HeartbeatEntry {
    uid_hi: AtomicU64,
    uid_lo: AtomicU64,
    /// 0 = entry free; claimed with a CAS on this word
    pid: AtomicU64,
    last_seen_ns: AtomicU64,
    /// Slot index + 1 while a read is in flight; 0 when idle
    reading_slot: AtomicU32,
    _pad: [u8; 28],
}

impl HeartbeatEntry {
    /// Whether the entry is claimed by some consumer.
    #[inline]
    pub fn is_occupied(&self) -> bool {
        self.pid.load(Ordering::Acquire) != 0
    }

    /// PID of the owning consumer (0 when free).
    #[inline]
    pub fn pid(&self) -> u64 {
        self.pid.load(Ordering::Acquire)
    }

    /// 128-bit consumer UID as (hi, lo).
    #[inline]
    pub fn uid(&self) -> (u64, u64) {
        (
            self.uid_hi.load(Ordering::Acquire),
            self.uid_lo.load(Ordering::Acquire),
        )
    }

    /// Monotonic tick of the last successful acquire (or the attach).
    #[inline]
    pub fn last_seen_ns(&self) -> u64 {
        self.last_seen_ns.load(Ordering::Acquire)
    }

    /// Slot currently held by this consumer, if any.
    #[inline]
    pub fn reading_slot(&self) -> Option<u32> {
        match self.reading_slot.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// Refresh the liveness tick.
    #[inline]
    pub fn refresh(&self, now_ns: u64) {
        self.last_seen_ns.store(now_ns, Ordering::Release);
    }

    /// Record (or clear) the slot a read is in flight on.
    #[inline]
    pub fn set_reading(&self, slot: Option<u32>) {
        let encoded = slot.map_or(0, |s| s + 1);
        self.reading_slot.store(encoded, Ordering::Release);
    }

    /// Release the entry. The PID word is cleared last so a concurrent
    /// scanner never sees a claimed entry with half-cleared fields.
    pub fn clear(&self) {
        self.reading_slot.store(0, Ordering::Release);
        self.uid_hi.store(0, Ordering::Release);
        self.uid_lo.store(0, Ordering::Release);
        self.last_seen_ns.store(0, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }

    fn try_claim_from(&self, expected_pid: u64, uid: (u64, u64), pid: u64, now_ns: u64) -> bool {
        if self
            .pid
            .compare_exchange(expected_pid, pid, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.uid_hi.store(uid.0, Ordering::Release);
        self.uid_lo.store(uid.1, Ordering::Release);
        self.reading_slot.store(0, Ordering::Release);
        self.last_seen_ns.store(now_ns, Ordering::Release);
        true
    }
}

/// Classify an entry as stale: occupied and silent longer than `threshold`.
#[inline]
pub fn is_stale(entry: &HeartbeatEntry, now_ns: u64, threshold: Duration) -> bool {
    entry.is_occupied()
        && now_ns.saturating_sub(entry.last_seen_ns()) > threshold.as_nanos() as u64
}

/// Classify an entry as dead: stale and its PID no longer names a live
/// process.
#[inline]
pub fn is_dead(entry: &HeartbeatEntry, now_ns: u64, threshold: Duration) -> bool {
    is_stale(entry, now_ns, threshold) && !liveness::is_process_alive(entry.pid())
}

/// Claim an entry for a new consumer.
///
/// First pass takes a free entry. If the table is full, a second pass
/// reclaims an entry whose owner is provably dead (crashed consumers must
/// not be able to exhaust the table permanently). Returns the entry index.
pub fn claim(
    entries: &[HeartbeatEntry],
    uid: (u64, u64),
    pid: u64,
    now_ns: u64,
) -> Option<usize> {
    for (i, entry) in entries.iter().enumerate() {
        if entry.try_claim_from(0, uid, pid, now_ns) {
            return Some(i);
        }
    }
    for (i, entry) in entries.iter().enumerate() {
        let owner = entry.pid();
        if owner != 0
            && !liveness::is_process_alive(owner)
            && entry.try_claim_from(owner, uid, pid, now_ns)
        {
            log::debug!("[DATABLOCK] heartbeat entry {i} reclaimed from dead pid {owner}");
            return Some(i);
        }
    }
    None
}

/// Generate a fresh 128-bit consumer UID.
///
/// Mixes the monotonic clock, the PID and an in-process counter; collision
/// would need two consumers in the same process at the same nanosecond with
/// the same counter value.
#[must_use]
pub fn fresh_uid() -> (u64, u64) {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let hi = liveness::monotonic_ns().rotate_left(17) ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let lo = (u64::from(std::process::id()) << 32) | (seq & 0xFFFF_FFFF);
    (hi, lo)
}
