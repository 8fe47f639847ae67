// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Per-endpoint counters.
//!
//! Every producer and consumer carries a `DataBusMetrics`; counters use
//! `Relaxed` ordering and are eventually consistent across threads.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one producer or consumer endpoint.
#[derive(Debug, Default)]
pub struct DataBusMetrics {
    /// Generations committed (producer)
    pub commits: AtomicU64,
    /// Reservations abandoned by the drop policy (producer)
    pub drops: AtomicU64,
    /// Samples delivered (consumer)
    pub deliveries: AtomicU64,
    /// Generations skipped past (consumer)
    pub skips: AtomicU64,
    /// Payload checksum verification failures (consumer)
    pub checksum_failures: AtomicU64,
    /// Reads that returned without a sample (consumer)
    pub timeouts: AtomicU64,
    /// Futex waits entered
    pub futex_waits: AtomicU64,
    /// Futex wakes issued
    pub futex_wakes: AtomicU64,
}

impl DataBusMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            commits: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            skips: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            futex_waits: AtomicU64::new(0),
            futex_wakes: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy out a coherent-enough snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            futex_waits: self.futex_waits.load(Ordering::Relaxed),
            futex_wakes: self.futex_wakes.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`DataBusMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub commits: u64,
    pub drops: u64,
    pub deliveries: u64,
    pub skips: u64,
    pub checksum_failures: u64,
    pub timeouts: u64,
    pub futex_waits: u64,
    pub futex_wakes: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bus[commits={}, drops={}, deliveries={}, skips={}, cksum_fail={}, timeouts={}, waits={}, wakes={}]",
            self.commits,
            self.drops,
            self.deliveries,
            self.skips,
            self.checksum_failures,
            self.timeouts,
            self.futex_waits,
            self.futex_wakes
        )
    }
}
