// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! # labhub - shared-memory slot ring for a lab-instrumentation data bus
//!
//! One producer process publishes fixed-layout samples into a named
//! shared-memory region (a **DataBlock**); any number of consumer processes
//! map the same region and read them zero-copy. Either side may crash at
//! any moment: checksums catch corruption, the heartbeat table tracks
//! readers, and the recovery API restores the ring afterwards.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use labhub::{Consumer, DataBlockConfig, Producer, ReadOutcome, ReserveOutcome};
//! use std::time::Duration;
//!
//! fn main() -> labhub::Result<()> {
//!     // Producer process
//!     let mut producer = Producer::create("bench", DataBlockConfig::default())?;
//!     if let ReserveOutcome::Slot(slot) = producer.reserve(Duration::from_millis(10))? {
//!         producer.payload_mut(&slot).fill(0x42);
//!         producer.commit(slot, true)?;
//!     }
//!
//!     // Consumer process
//!     let mut consumer = Consumer::attach("bench")?;
//!     match consumer.read(Duration::from_millis(10))? {
//!         ReadOutcome::Slot(sample) => {
//!             println!("generation {}: {} bytes", sample.generation(), sample.payload().len());
//!         }
//!         ReadOutcome::TimedOut | ReadOutcome::Stopped => {}
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! | Region: header | slot states | payloads | flex | heartbeats   |
//! +---------------------------------------------------------------+
//!     ^ reserve/commit (producer)         ^ acquire/release (consumers)
//!     |                                   |
//!     +---- futex commit/drain words -----+
//! ```
//!
//! - [`datablock::layout`] - on-SHM binary layout and geometry
//! - [`datablock::slot`] - the FREE/WRITING/COMMITTED/DRAINING machine
//! - [`datablock::producer`] / [`datablock::consumer`] - the hot paths
//! - [`datablock::heartbeat`] - consumer tracking
//! - [`datablock::recovery`] - diagnosis and forced repair
//!
//! The hot path is lock-free; coordination happens through atomics inside
//! the slot-state array and two futex words in the header. No mutex lives
//! in shared memory.

pub mod config;
pub mod datablock;
pub mod metrics;

pub use config::{ChecksumFailPolicy, DataBlockConfig, DropPolicy};
pub use datablock::consumer::{Consumer, RawReadOutcome, RawSample, ReadOutcome, SlotRead};
pub use datablock::producer::{Producer, ReserveOutcome, SlotHandle};
pub use datablock::recovery::{
    ConsumerDiagnostic, Recovery, RecoveryOutcome, SlotDiagnostic,
};
pub use datablock::{cleanup_stale_regions, unlink_region, DataBlockError, Result};
pub use metrics::{DataBusMetrics, MetricsSnapshot};
