// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Region configuration and policies.

use crate::datablock::layout::{FLAG_CHECKSUM_PASS, FLAG_DROP_OVERWRITE};
use std::time::Duration;

/// What the producer does when a slot fails to drain within the timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Yield the iteration: `reserve` returns `Busy`, the sample is dropped
    /// at the source (default)
    #[default]
    DropNewest,

    /// Evict the remaining readers and overwrite. Evicted readers detect
    /// the overwrite through the generation re-check and discard their read
    Overwrite,
}

/// What a consumer does when a committed payload fails checksum
/// verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChecksumFailPolicy {
    /// Suppress the delivery; the read continues until a newer generation
    /// or the deadline (default, recommended)
    #[default]
    Strict,

    /// Deliver the payload with `valid = false` and let the host decide
    Pass,
}

/// Shape and policy of a DataBlock region.
///
/// Geometry (`slot_count`, `slot_bytes`, `flex_bytes`) and policies are
/// fixed at creation and advertised to consumers through the region header;
/// the timing knobs are local to the process that holds this config.
#[derive(Clone, Debug)]
pub struct DataBlockConfig {
    /// Number of payload slots; must be a power of two
    pub slot_count: u32,
    /// Payload bytes per slot; must be a positive multiple of 8
    pub slot_bytes: u32,
    /// Producer-writable metadata bytes (may be zero)
    pub flex_bytes: u64,
    /// Drain behavior when readers hold the slot being reused
    pub drop_policy: DropPolicy,
    /// Consumer behavior on checksum mismatch
    pub checksum_fail: ChecksumFailPolicy,
    /// How long the producer waits for readers to drain before applying the
    /// drop policy
    pub drain_timeout: Duration,
    /// Silence beyond which a heartbeat entry counts as stale
    pub stale_threshold: Duration,
    /// Residence in WRITING/DRAINING beyond which a slot counts as stuck
    pub stuck_threshold: Duration,
}

impl Default for DataBlockConfig {
    fn default() -> Self {
        Self {
            slot_count: 64,
            slot_bytes: 4096,
            flex_bytes: 0,
            drop_policy: DropPolicy::default(),
            checksum_fail: ChecksumFailPolicy::default(),
            drain_timeout: Duration::from_millis(100),
            stale_threshold: Duration::from_secs(5),
            stuck_threshold: Duration::from_secs(5),
        }
    }
}

impl DataBlockConfig {
    /// Config with explicit geometry and default policies.
    #[must_use]
    pub fn with_geometry(slot_count: u32, slot_bytes: u32, flex_bytes: u64) -> Self {
        Self {
            slot_count,
            slot_bytes,
            flex_bytes,
            ..Self::default()
        }
    }

    /// Set the drop policy.
    #[must_use]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Set the checksum-failure policy.
    #[must_use]
    pub fn checksum_fail(mut self, policy: ChecksumFailPolicy) -> Self {
        self.checksum_fail = policy;
        self
    }

    /// Set the drain timeout.
    #[must_use]
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the stale threshold.
    #[must_use]
    pub fn stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set the stuck threshold.
    #[must_use]
    pub fn stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    /// Encode the policies into header flag bits.
    #[must_use]
    pub(crate) fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.checksum_fail == ChecksumFailPolicy::Pass {
            flags |= FLAG_CHECKSUM_PASS;
        }
        if self.drop_policy == DropPolicy::Overwrite {
            flags |= FLAG_DROP_OVERWRITE;
        }
        flags
    }

    /// Decode policies from header flag bits.
    #[must_use]
    pub(crate) fn policies_from_flags(flags: u16) -> (DropPolicy, ChecksumFailPolicy) {
        let drop = if flags & FLAG_DROP_OVERWRITE != 0 {
            DropPolicy::Overwrite
        } else {
            DropPolicy::DropNewest
        };
        let fail = if flags & FLAG_CHECKSUM_PASS != 0 {
            ChecksumFailPolicy::Pass
        } else {
            ChecksumFailPolicy::Strict
        };
        (drop, fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DataBlockConfig::default();
        assert_eq!(config.drop_policy, DropPolicy::DropNewest);
        assert_eq!(config.checksum_fail, ChecksumFailPolicy::Strict);
        assert_eq!(config.stuck_threshold, Duration::from_secs(5));
        assert!(config.slot_count.is_power_of_two());
        assert_eq!(config.slot_bytes % 8, 0);
    }

    #[test]
    fn test_flags_roundtrip() {
        let config = DataBlockConfig::default()
            .drop_policy(DropPolicy::Overwrite)
            .checksum_fail(ChecksumFailPolicy::Pass);
        let flags = config.flags();
        let (drop, fail) = DataBlockConfig::policies_from_flags(flags);
        assert_eq!(drop, DropPolicy::Overwrite);
        assert_eq!(fail, ChecksumFailPolicy::Pass);
    }

    #[test]
    fn test_default_flags_are_zero() {
        assert_eq!(DataBlockConfig::default().flags(), 0);
        let (drop, fail) = DataBlockConfig::policies_from_flags(0);
        assert_eq!(drop, DropPolicy::DropNewest);
        assert_eq!(fail, ChecksumFailPolicy::Strict);
    }

    #[test]
    fn test_builder_setters() {
        let config = DataBlockConfig::with_geometry(8, 256, 64)
            .drain_timeout(Duration::from_millis(5))
            .stale_threshold(Duration::from_millis(50))
            .stuck_threshold(Duration::from_millis(500));
        assert_eq!(config.slot_count, 8);
        assert_eq!(config.slot_bytes, 256);
        assert_eq!(config.flex_bytes, 64);
        assert_eq!(config.drain_timeout, Duration::from_millis(5));
        assert_eq!(config.stale_threshold, Duration::from_millis(50));
        assert_eq!(config.stuck_threshold, Duration::from_millis(500));
    }
}
