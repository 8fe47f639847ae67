// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Typed view over a mapped DataBlock region.
//!
//! `RegionMap` owns the segment mapping and hands out references to the
//! header, the slot-state entries, the payload slots, the flex zone and the
//! heartbeat table, each computed from the validated geometry. Producer,
//! consumer and recovery all operate through this one view.

use super::checksum::{self, CHECKSUM_LEN};
use super::heartbeat::{HeartbeatEntry, HEARTBEAT_CAPACITY};
use super::layout::{RegionGeometry, RegionHeader};
use super::segment::ShmSegment;
use super::slot::SlotState;
use super::{DataBlockError, Result};

pub(crate) struct RegionMap {
    segment: ShmSegment,
    geometry: RegionGeometry,
}

impl RegionMap {
    /// Create and initialize a fresh region.
    pub(crate) fn create(
        shm_name: &str,
        geometry: RegionGeometry,
        flags: u16,
        now_ns: u64,
        pid: u64,
    ) -> Result<Self> {
        let segment = ShmSegment::create(shm_name, geometry.total_size)?;

        // SAFETY: the mapping is exclusive (O_EXCL creation), large enough
        // for the header by construction, and page-aligned, which satisfies
        // RegionHeader's alignment.
        unsafe {
            let header_ptr = segment.as_ptr() as *mut RegionHeader;
            header_ptr.write(RegionHeader::new(&geometry, flags, now_ns, pid));
            (*header_ptr).stamp_checksum();
        }

        let map = Self { segment, geometry };
        map.stamp_flex_checksum();
        Ok(map)
    }

    /// Map and validate an existing region.
    pub(crate) fn open(shm_name: &str) -> Result<Self> {
        Self::open_impl(shm_name, true)
    }

    /// Map an existing region, tolerating a damaged header checksum.
    ///
    /// Recovery uses this: a region whose checksum was torn by a crashed
    /// takeover must still be diagnosable and repairable. Magic, version
    /// and geometry are always enforced.
    pub(crate) fn open_relaxed(shm_name: &str) -> Result<Self> {
        Self::open_impl(shm_name, false)
    }

    fn open_impl(shm_name: &str, verify_checksum: bool) -> Result<Self> {
        let segment = ShmSegment::open(shm_name)?;
        if segment.size() < std::mem::size_of::<RegionHeader>() {
            return Err(DataBlockError::InvariantViolated(format!(
                "region {shm_name} smaller than its header"
            )));
        }

        // SAFETY: at least a header's worth of bytes is mapped (checked
        // above) and the mapping is page-aligned.
        let header = unsafe { &*(segment.as_ptr() as *const RegionHeader) };
        if verify_checksum {
            header.validate()?;
        } else {
            header.validate_identity()?;
        }

        let geometry = RegionGeometry::from_header(header)?;
        if segment.size() < geometry.total_size {
            return Err(DataBlockError::InvariantViolated(format!(
                "region {shm_name} truncated: {} < {}",
                segment.size(),
                geometry.total_size
            )));
        }

        Ok(Self { segment, geometry })
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &RegionGeometry {
        &self.geometry
    }

    #[inline]
    pub(crate) fn shm_name(&self) -> &str {
        self.segment.name()
    }

    #[inline]
    pub(crate) fn header(&self) -> &RegionHeader {
        // SAFETY: validated at open/creation; alignment from the page-
        // aligned mapping; all shared mutation goes through atomics.
        unsafe { &*(self.segment.as_ptr() as *const RegionHeader) }
    }

    #[inline]
    pub(crate) fn slots(&self) -> &[SlotState] {
        // SAFETY: the geometry places slot_count 64-byte entries at
        // slots_offset, inside the mapping (total_size was checked); the
        // offset is cache-line-aligned by construction.
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(self.geometry.slots_offset) as *const SlotState,
                self.geometry.slot_count as usize,
            )
        }
    }

    #[inline]
    pub(crate) fn slot(&self, index: u32) -> &SlotState {
        &self.slots()[index as usize]
    }

    /// Payload bytes of a slot (exactly `slot_bytes` long).
    ///
    /// Shared-memory read: the protocol guarantees the producer is not
    /// writing this slot while a registered reader looks at it, except under
    /// a forced drain override, where the reader's generation re-check
    /// discards whatever was seen.
    #[inline]
    pub(crate) fn payload(&self, index: u32) -> &[u8] {
        debug_assert!(index < self.geometry.slot_count);
        let offset = self.geometry.payload_offset
            + index as usize * self.geometry.payload_stride;
        // SAFETY: offset + slot_bytes lies inside the mapping for every
        // valid index (geometry invariant).
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(offset),
                self.geometry.slot_bytes as usize,
            )
        }
    }

    /// Mutable payload bytes. Caller must hold the slot in WRITING.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn payload_mut(&self, index: u32) -> &mut [u8] {
        debug_assert!(index < self.geometry.slot_count);
        let offset = self.geometry.payload_offset
            + index as usize * self.geometry.payload_stride;
        // SAFETY: bounds as in `payload`; exclusivity comes from the slot
        // state machine (a WRITING slot has one writer and no registered
        // readers).
        unsafe {
            std::slice::from_raw_parts_mut(
                self.segment.as_ptr().add(offset),
                self.geometry.slot_bytes as usize,
            )
        }
    }

    /// Flex-zone bytes (may be empty).
    #[inline]
    pub(crate) fn flex(&self) -> &[u8] {
        // SAFETY: flex_offset + flex_bytes lies inside the mapping.
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(self.geometry.flex_offset),
                self.geometry.flex_bytes,
            )
        }
    }

    /// Mutable flex-zone bytes. Producer only.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn flex_mut(&self) -> &mut [u8] {
        // SAFETY: bounds as in `flex`; the producer is the only writer of
        // the flex zone for the region's lifetime.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.segment.as_ptr().add(self.geometry.flex_offset),
                self.geometry.flex_bytes,
            )
        }
    }

    /// Stored flex-zone checksum.
    pub(crate) fn flex_checksum(&self) -> [u8; CHECKSUM_LEN] {
        let mut stored = [0u8; CHECKSUM_LEN];
        // SAFETY: the 16 checksum bytes trail the flex zone inside the
        // mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.segment.as_ptr().add(self.geometry.flex_checksum_offset()),
                stored.as_mut_ptr(),
                CHECKSUM_LEN,
            );
        }
        stored
    }

    /// Recompute and store the flex-zone checksum.
    pub(crate) fn stamp_flex_checksum(&self) {
        let digest = checksum::digest(self.flex());
        // SAFETY: bounds as in `flex_checksum`; only the producer (or
        // recovery, with the producer dead) stamps.
        unsafe {
            std::ptr::copy_nonoverlapping(
                digest.as_ptr(),
                self.segment.as_ptr().add(self.geometry.flex_checksum_offset()),
                CHECKSUM_LEN,
            );
        }
    }

    /// Verify the flex-zone checksum.
    pub(crate) fn verify_flex(&self) -> bool {
        checksum::verify(self.flex(), &self.flex_checksum())
    }

    #[inline]
    pub(crate) fn heartbeats(&self) -> &[HeartbeatEntry] {
        // SAFETY: the geometry places HEARTBEAT_CAPACITY 64-byte entries at
        // heartbeat_offset, inside the mapping and cache-line-aligned.
        unsafe {
            std::slice::from_raw_parts(
                self.segment.as_ptr().add(self.geometry.heartbeat_offset)
                    as *const HeartbeatEntry,
                HEARTBEAT_CAPACITY,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datablock::layout;
    use crate::datablock::slot::SlotStateKind;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/labhub_regiontest_{ts}")
    }

    fn geometry() -> RegionGeometry {
        RegionGeometry::from_parts(4, 64, 32).unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let name = unique_name();
        let map = RegionMap::create(&name, geometry(), 0, 42, 777).expect("create");
        assert!(map.header().validate().is_ok());
        assert_eq!(map.header().producer_pid(), 777);
        assert_eq!(map.header().creation_monotonic_ns(), 42);

        let reopened = RegionMap::open(&name).expect("open");
        assert_eq!(reopened.geometry(), map.geometry());
        assert_eq!(reopened.header().producer_pid(), 777);

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_fresh_region_slots_are_free() {
        let name = unique_name();
        let map = RegionMap::create(&name, geometry(), 0, 0, 1).expect("create");
        for slot in map.slots() {
            assert_eq!(slot.kind(), Some(SlotStateKind::Free));
            assert!(slot.check_invariants().is_ok());
        }
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_fresh_region_flex_checksum_verifies() {
        let name = unique_name();
        let map = RegionMap::create(&name, geometry(), 0, 0, 1).expect("create");
        assert!(map.verify_flex());
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_flex_stamp_after_mutation() {
        let name = unique_name();
        let map = RegionMap::create(&name, geometry(), 0, 0, 1).expect("create");

        map.flex_mut()[0] = 0xEE;
        assert!(!map.verify_flex());
        map.stamp_flex_checksum();
        assert!(map.verify_flex());

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_payloads_are_disjoint_and_sized() {
        let name = unique_name();
        let map = RegionMap::create(&name, geometry(), 0, 0, 1).expect("create");

        map.payload_mut(0).fill(0x11);
        map.payload_mut(3).fill(0x33);
        assert_eq!(map.payload(0).len(), 64);
        assert!(map.payload(0).iter().all(|&b| b == 0x11));
        assert!(map.payload(1).iter().all(|&b| b == 0));
        assert!(map.payload(3).iter().all(|&b| b == 0x33));

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_open_rejects_foreign_segment() {
        let name = unique_name();
        let _seg = ShmSegment::create(&name, 4096).expect("create");
        let result = RegionMap::open(&name);
        assert!(matches!(
            result,
            Err(DataBlockError::MagicMismatch { .. })
        ));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_visibility_across_mappings() {
        let name = unique_name();
        let writer = RegionMap::create(&name, geometry(), 0, 0, 1).expect("create");
        let reader = RegionMap::open(&name).expect("open");

        writer.payload_mut(2).fill(0x7A);
        assert!(reader.payload(2).iter().all(|&b| b == 0x7A));

        writer.header().publish_head(9);
        assert_eq!(reader.header().head_generation(), 9);

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_heartbeat_table_is_clear_on_creation() {
        let name = unique_name();
        let map = RegionMap::create(&name, geometry(), layout::FLAG_CHECKSUM_PASS, 0, 1)
            .expect("create");
        assert_eq!(map.header().flags(), layout::FLAG_CHECKSUM_PASS);
        assert!(map.heartbeats().iter().all(|e| !e.is_occupied()));
        ShmSegment::unlink(&name).ok();
    }
}
