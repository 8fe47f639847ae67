// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Binary layout of a DataBlock region.
//!
//! ```text
//! offset            contents
//! 0                 RegionHeader (128 bytes)
//! 128               slot-state array   (slot_count x 64 bytes)
//! 128 + N*64        payload array      (slot_count x stride bytes)
//! ...               flex zone          (flex_bytes + 16-byte checksum)
//! ...               heartbeat table    (64 x 64 bytes)
//! ```
//!
//! All sub-regions start on a cache-line boundary. The payload stride is
//! `slot_bytes` rounded up to the cache line so every payload slot is
//! cache-line-aligned regardless of the configured slot size. Everything is
//! little-endian; the region is only ever shared within one host.
//!
//! # Header layout (fixed, version 1)
//!
//! ```text
//! offset  size  field
//! 0       4     magic = 0x4C424831 ("LBH1")
//! 4       2     version
//! 6       2     flags (policy bits)
//! 8       4     slot_count
//! 12      4     slot_bytes
//! 16      8     flex_zone_bytes
//! 24      8     creation_monotonic_ns
//! 32      8     producer_pid
//! 40      16    header_checksum (BLAKE2b-128 of bytes [0..40))
//! 56      8     shutdown_flag
//! 64      4     commit_notify   (futex word, bumped per commit)
//! 68      4     drain_notify    (futex word, bumped by last releasing reader)
//! 72      4     recovery_lock   (spin word, recovery-vs-recovery only)
//! 80      8     head_generation (latest committed generation)
//! 88..128       reserved
//! ```

use super::checksum::{self, CHECKSUM_LEN};
use super::heartbeat::{HeartbeatEntry, HEARTBEAT_CAPACITY};
use super::{DataBlockError, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Region magic: "LBH1", little-endian.
pub const MAGIC: u32 = 0x4C42_4831;

/// Layout version implemented by this build.
pub const VERSION: u16 = 1;

/// Host cache-line size every sub-region is aligned to.
pub const CACHE_LINE: usize = 64;

/// Fixed header length.
pub const HEADER_LEN: usize = 128;

/// Byte span covered by the header checksum.
pub const HEADER_CHECKSUM_SPAN: usize = 40;

/// Flag bit: deliver checksum-failed payloads with `valid = false` instead
/// of suppressing them.
pub const FLAG_CHECKSUM_PASS: u16 = 1 << 0;

/// Flag bit: on drain timeout, overwrite the slot instead of yielding.
pub const FLAG_DROP_OVERWRITE: u16 = 1 << 1;

#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The fixed region header.
///
/// Immutable after creation except for `producer_pid` + `header_checksum`
/// (producer takeover), `shutdown_flag`, the futex words and
/// `head_generation`.
#[repr(C, align(128))]
pub struct RegionHeader {
    magic: u32,
    version: u16,
    flags: u16,
    slot_count: u32,
    slot_bytes: u32,
    flex_zone_bytes: u64,
    creation_monotonic_ns: u64,
    producer_pid: AtomicU64,
    header_checksum: UnsafeCell<[u8; CHECKSUM_LEN]>,
    shutdown_flag: AtomicU64,
    commit_notify: AtomicU32,
    drain_notify: AtomicU32,
    recovery_lock: AtomicU32,
    _pad0: u32,
    head_generation: AtomicU64,
    _reserved: [u8; 40],
}

// SAFETY: the only non-atomic mutable field is the header checksum, which is
// rewritten solely by creation and producer takeover; every other shared
// field is an atomic.
unsafe impl Sync for RegionHeader {}

const _: () = assert!(std::mem::size_of::<RegionHeader>() == HEADER_LEN);
const _: () = assert!(std::mem::align_of::<RegionHeader>() == HEADER_LEN);

impl RegionHeader {
    pub(crate) fn new(geometry: &RegionGeometry, flags: u16, now_ns: u64, pid: u64) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            slot_count: geometry.slot_count,
            slot_bytes: geometry.slot_bytes,
            flex_zone_bytes: geometry.flex_bytes as u64,
            creation_monotonic_ns: now_ns,
            producer_pid: AtomicU64::new(pid),
            header_checksum: UnsafeCell::new([0u8; CHECKSUM_LEN]),
            shutdown_flag: AtomicU64::new(0),
            commit_notify: AtomicU32::new(0),
            drain_notify: AtomicU32::new(0),
            recovery_lock: AtomicU32::new(0),
            _pad0: 0,
            head_generation: AtomicU64::new(0),
            _reserved: [0u8; 40],
        }
    }

    fn checksum_span(&self) -> &[u8] {
        // SAFETY: the header is a repr(C) struct of at least
        // HEADER_CHECKSUM_SPAN bytes; reading them as raw bytes is valid for
        // hashing (the span contains no uninitialized padding: fields are
        // packed back-to-back through offset 40).
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, HEADER_CHECKSUM_SPAN)
        }
    }

    /// Recompute and store the header checksum. Called at creation and by
    /// producer takeover after restamping the PID.
    pub(crate) fn stamp_checksum(&self) {
        let digest = checksum::digest(self.checksum_span());
        // SAFETY: creation runs before the region is published; takeover
        // runs only when no live producer exists. Concurrent validators may
        // observe a torn digest and report a transient mismatch, never read
        // invalid memory.
        unsafe {
            *self.header_checksum.get() = digest;
        }
    }

    /// Verify the stored header checksum.
    pub fn verify_checksum(&self) -> bool {
        // SAFETY: see `stamp_checksum`; plain 16-byte read.
        let stored = unsafe { *self.header_checksum.get() };
        checksum::verify(self.checksum_span(), &stored)
    }

    /// Validate magic and version only. Without these the rest of the
    /// header cannot be interpreted at all.
    pub fn validate_identity(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(DataBlockError::MagicMismatch { found: self.magic });
        }
        if self.version != VERSION {
            return Err(DataBlockError::VersionMismatch {
                found: self.version,
            });
        }
        Ok(())
    }

    /// Validate magic, version and header checksum.
    pub fn validate(&self) -> Result<()> {
        self.validate_identity()?;
        if !self.verify_checksum() {
            return Err(DataBlockError::InvariantViolated(
                "header checksum mismatch".to_string(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    #[inline]
    pub fn slot_bytes(&self) -> u32 {
        self.slot_bytes
    }

    #[inline]
    pub fn flex_zone_bytes(&self) -> u64 {
        self.flex_zone_bytes
    }

    #[inline]
    pub fn creation_monotonic_ns(&self) -> u64 {
        self.creation_monotonic_ns
    }

    #[inline]
    pub fn producer_pid(&self) -> u64 {
        self.producer_pid.load(Ordering::Acquire)
    }

    pub(crate) fn set_producer_pid(&self, pid: u64) {
        self.producer_pid.store(pid, Ordering::Release);
    }

    /// Latest committed generation (0 before the first commit).
    #[inline]
    pub fn head_generation(&self) -> u64 {
        self.head_generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn publish_head(&self, generation: u64) {
        self.head_generation.store(generation, Ordering::Release);
    }

    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire) != 0
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown_flag.store(1, Ordering::Release);
    }

    pub(crate) fn clear_shutdown(&self) {
        self.shutdown_flag.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn commit_notify(&self) -> &AtomicU32 {
        &self.commit_notify
    }

    #[inline]
    pub(crate) fn drain_notify(&self) -> &AtomicU32 {
        &self.drain_notify
    }

    #[inline]
    pub(crate) fn recovery_lock(&self) -> &AtomicU32 {
        &self.recovery_lock
    }
}

/// Resolved offsets and sizes of every sub-region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionGeometry {
    pub slot_count: u32,
    pub slot_bytes: u32,
    /// Distance between consecutive payload slots (`slot_bytes` rounded up
    /// to the cache line).
    pub payload_stride: usize,
    pub flex_bytes: usize,
    pub slots_offset: usize,
    pub payload_offset: usize,
    pub flex_offset: usize,
    pub heartbeat_offset: usize,
    pub total_size: usize,
}

/// Upper bounds keeping a region mappable on ordinary hosts.
const MAX_SLOT_COUNT: u32 = 1 << 16;
const MAX_SLOT_BYTES: u32 = 1 << 26;
const MAX_FLEX_BYTES: u64 = 1 << 28;

impl RegionGeometry {
    /// Compute the layout for the given shape, validating it.
    pub fn from_parts(slot_count: u32, slot_bytes: u32, flex_bytes: u64) -> Result<Self> {
        if slot_count == 0 || !slot_count.is_power_of_two() {
            return Err(DataBlockError::InvalidConfig(format!(
                "slot count must be a power of two, got {slot_count}"
            )));
        }
        if slot_count > MAX_SLOT_COUNT {
            return Err(DataBlockError::InvalidConfig(format!(
                "slot count {slot_count} exceeds {MAX_SLOT_COUNT}"
            )));
        }
        if slot_bytes == 0 || slot_bytes % 8 != 0 {
            return Err(DataBlockError::InvalidConfig(format!(
                "slot bytes must be a positive multiple of 8, got {slot_bytes}"
            )));
        }
        if slot_bytes > MAX_SLOT_BYTES {
            return Err(DataBlockError::InvalidConfig(format!(
                "slot bytes {slot_bytes} exceeds {MAX_SLOT_BYTES}"
            )));
        }
        if flex_bytes > MAX_FLEX_BYTES {
            return Err(DataBlockError::InvalidConfig(format!(
                "flex bytes {flex_bytes} exceeds {MAX_FLEX_BYTES}"
            )));
        }

        let n = slot_count as usize;
        let payload_stride = align_up(slot_bytes as usize, CACHE_LINE);
        let slots_offset = HEADER_LEN;
        let payload_offset = slots_offset + n * std::mem::size_of::<super::slot::SlotState>();
        let flex_offset = payload_offset + n * payload_stride;
        let flex_end = flex_offset + flex_bytes as usize + CHECKSUM_LEN;
        let heartbeat_offset = align_up(flex_end, CACHE_LINE);
        let total_size =
            heartbeat_offset + HEARTBEAT_CAPACITY * std::mem::size_of::<HeartbeatEntry>();

        Ok(Self {
            slot_count,
            slot_bytes,
            payload_stride,
            flex_bytes: flex_bytes as usize,
            slots_offset,
            payload_offset,
            flex_offset,
            heartbeat_offset,
            total_size,
        })
    }

    /// Recompute the layout from a validated header.
    pub fn from_header(header: &RegionHeader) -> Result<Self> {
        Self::from_parts(
            header.slot_count(),
            header.slot_bytes(),
            header.flex_zone_bytes(),
        )
    }

    /// Offset of the checksum trailing the flex zone.
    #[inline]
    pub fn flex_checksum_offset(&self) -> usize {
        self.flex_offset + self.flex_bytes
    }

    /// Map a generation to its slot index.
    #[inline]
    pub fn slot_for_generation(&self, generation: u64) -> u32 {
        (generation % u64::from(self.slot_count)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_header_field_offsets() {
        assert_eq!(offset_of!(RegionHeader, magic), 0);
        assert_eq!(offset_of!(RegionHeader, version), 4);
        assert_eq!(offset_of!(RegionHeader, flags), 6);
        assert_eq!(offset_of!(RegionHeader, slot_count), 8);
        assert_eq!(offset_of!(RegionHeader, slot_bytes), 12);
        assert_eq!(offset_of!(RegionHeader, flex_zone_bytes), 16);
        assert_eq!(offset_of!(RegionHeader, creation_monotonic_ns), 24);
        assert_eq!(offset_of!(RegionHeader, producer_pid), 32);
        assert_eq!(offset_of!(RegionHeader, header_checksum), 40);
        assert_eq!(offset_of!(RegionHeader, shutdown_flag), 56);
        assert_eq!(offset_of!(RegionHeader, commit_notify), 64);
        assert_eq!(offset_of!(RegionHeader, drain_notify), 68);
        assert_eq!(offset_of!(RegionHeader, recovery_lock), 72);
        assert_eq!(offset_of!(RegionHeader, head_generation), 80);
    }

    fn test_header(n: u32, s: u32, f: u64) -> RegionHeader {
        let geo = RegionGeometry::from_parts(n, s, f).unwrap();
        let header = RegionHeader::new(&geo, 0, 123, 456);
        header.stamp_checksum();
        header
    }

    #[test]
    fn test_header_validate_roundtrip() {
        let header = test_header(8, 64, 32);
        assert!(header.validate().is_ok());
        assert_eq!(header.slot_count(), 8);
        assert_eq!(header.slot_bytes(), 64);
        assert_eq!(header.flex_zone_bytes(), 32);
        assert_eq!(header.creation_monotonic_ns(), 123);
        assert_eq!(header.producer_pid(), 456);
    }

    #[test]
    fn test_header_checksum_covers_pid() {
        let header = test_header(8, 64, 0);
        assert!(header.verify_checksum());
        header.set_producer_pid(789);
        assert!(!header.verify_checksum());
        header.stamp_checksum();
        assert!(header.verify_checksum());
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let geo = RegionGeometry::from_parts(4, 64, 0).unwrap();
        let mut header = RegionHeader::new(&geo, 0, 0, 0);
        header.magic = 0x1234_5678;
        assert!(matches!(
            header.validate(),
            Err(DataBlockError::MagicMismatch { found: 0x1234_5678 })
        ));
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let geo = RegionGeometry::from_parts(4, 64, 0).unwrap();
        let mut header = RegionHeader::new(&geo, 0, 0, 0);
        header.version = 99;
        assert!(matches!(
            header.validate(),
            Err(DataBlockError::VersionMismatch { found: 99 })
        ));
    }

    #[test]
    fn test_geometry_offsets() {
        let geo = RegionGeometry::from_parts(4, 64, 32).unwrap();
        assert_eq!(geo.slots_offset, 128);
        assert_eq!(geo.payload_offset, 128 + 4 * 64);
        assert_eq!(geo.payload_stride, 64);
        assert_eq!(geo.flex_offset, 128 + 4 * 64 + 4 * 64);
        // 32 flex bytes + 16 checksum = 48, aligned to the next cache line.
        assert_eq!(geo.heartbeat_offset, align_up(geo.flex_offset + 48, 64));
        assert_eq!(
            geo.total_size,
            geo.heartbeat_offset + HEARTBEAT_CAPACITY * 64
        );
    }

    #[test]
    fn test_geometry_strides_odd_slot_size() {
        // 8-byte payloads still get a full cache line each.
        let geo = RegionGeometry::from_parts(8, 8, 0).unwrap();
        assert_eq!(geo.payload_stride, 64);
        assert_eq!(geo.flex_offset, 128 + 8 * 64 + 8 * 64);
    }

    #[test]
    fn test_geometry_rejects_non_power_of_two() {
        assert!(RegionGeometry::from_parts(3, 64, 0).is_err());
        assert!(RegionGeometry::from_parts(0, 64, 0).is_err());
    }

    #[test]
    fn test_geometry_rejects_bad_slot_bytes() {
        assert!(RegionGeometry::from_parts(4, 0, 0).is_err());
        assert!(RegionGeometry::from_parts(4, 12, 0).is_err());
    }

    #[test]
    fn test_geometry_rejects_oversize() {
        assert!(RegionGeometry::from_parts(1 << 17, 64, 0).is_err());
        assert!(RegionGeometry::from_parts(4, 1 << 27, 0).is_err());
        assert!(RegionGeometry::from_parts(4, 64, 1 << 29).is_err());
    }

    #[test]
    fn test_slot_for_generation() {
        let geo = RegionGeometry::from_parts(4, 64, 0).unwrap();
        assert_eq!(geo.slot_for_generation(1), 1);
        assert_eq!(geo.slot_for_generation(4), 0);
        assert_eq!(geo.slot_for_generation(7), 3);
    }
}
