// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! DataBlock: a single-producer / multi-consumer slot ring in POSIX shared
//! memory.
//!
//! A DataBlock is a named shared-memory region holding a fixed header, an
//! array of slot-state entries, an array of payload slots, a producer-owned
//! flex zone, and a consumer heartbeat table. One producer cycles payload
//! slots through the `FREE -> WRITING -> COMMITTED -> DRAINING -> FREE` state
//! machine; consumers attach, acquire the most recently committed slot,
//! verify its checksum and release it, all without taking a lock.
//!
//! ```text
//! +--------------------+              +--------------------+
//! |  Producer process  |    Shared    | Consumer processes |
//! |  reserve/commit  --+--  Memory  --+-> acquire/release  |
//! +--------------------+   (mmap +    +--------------------+
//!                           futex)
//! ```
//!
//! # Crash tolerance
//!
//! Either side may die at any instant. Committed payloads carry BLAKE2b
//! checksums so torn or corrupted data is never delivered silently; consumers
//! are tracked in a heartbeat table so a dead reader's hold on a slot can be
//! reclaimed; the [`recovery`] module diagnoses stuck slots and restores the
//! ring without the cooperation of the crashed party.

pub mod checksum;
pub mod consumer;
mod futex;
pub mod heartbeat;
pub mod layout;
pub mod liveness;
pub mod producer;
pub mod recovery;
mod region;
pub mod segment;
pub mod slot;

use std::fmt;
use std::io;

/// Prefix for every DataBlock segment under `/dev/shm`.
pub const SEGMENT_PREFIX: &str = "labhub_";

/// Errors surfaced by DataBlock operations.
///
/// Transient conditions (`Busy`, `TimedOut`, `Stopped`) are not errors; they
/// are variants of [`producer::ReserveOutcome`] and [`consumer::ReadOutcome`]
/// and are expected on the hot path.
#[derive(Debug)]
pub enum DataBlockError {
    /// Memory mapping or segment syscall failed
    MapFailed(io::Error),

    /// A region with this name already exists (or its producer is alive)
    NameConflict(String),

    /// Insufficient permissions for the segment
    Permission(String),

    /// No region with this name exists
    NotFound(String),

    /// Region name is not usable as a POSIX shm name
    InvalidName(String),

    /// Region geometry rejected (slot count, slot bytes, flex bytes)
    InvalidConfig(String),

    /// Header magic does not identify a DataBlock
    MagicMismatch { found: u32 },

    /// Header version is not supported by this build
    VersionMismatch { found: u16 },

    /// A payload or flex-zone checksum failed verification
    ChecksumMismatch { generation: u64 },

    /// The region violates a slot-state invariant
    InvariantViolated(String),

    /// The heartbeat table has no free entry for another consumer
    HeartbeatFull,

    /// Recovery found the recorded writer dead
    WriterDead { pid: u64 },

    /// Recovery found a registered reader dead
    ReaderDead { pid: u64 },
}

impl fmt::Display for DataBlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapFailed(e) => write!(f, "shared memory mapping failed: {e}"),
            Self::NameConflict(name) => write!(f, "region already exists: {name}"),
            Self::Permission(name) => write!(f, "permission denied for region: {name}"),
            Self::NotFound(name) => write!(f, "region not found: {name}"),
            Self::InvalidName(name) => write!(f, "invalid region name: {name}"),
            Self::InvalidConfig(why) => write!(f, "invalid region configuration: {why}"),
            Self::MagicMismatch { found } => {
                write!(f, "header magic mismatch: found 0x{found:08x}")
            }
            Self::VersionMismatch { found } => {
                write!(f, "unsupported region version: {found}")
            }
            Self::ChecksumMismatch { generation } => {
                write!(f, "checksum mismatch at generation {generation}")
            }
            Self::InvariantViolated(why) => write!(f, "slot invariant violated: {why}"),
            Self::HeartbeatFull => write!(f, "heartbeat table is full"),
            Self::WriterDead { pid } => write!(f, "writer process {pid} is dead"),
            Self::ReaderDead { pid } => write!(f, "reader process {pid} is dead"),
        }
    }
}

impl std::error::Error for DataBlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MapFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for DataBlock operations.
pub type Result<T> = std::result::Result<T, DataBlockError>;

/// Derive the POSIX shm name for a region.
///
/// Format: `/labhub_<name>`. The caller-facing name is restricted to
/// alphanumerics plus `_`, `-` and `.` so the segment name stays valid on
/// every POSIX shm implementation.
pub fn segment_name(name: &str) -> Result<String> {
    if name.is_empty() || name.len() > 200 {
        return Err(DataBlockError::InvalidName(name.to_string()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(DataBlockError::InvalidName(name.to_string()));
    }
    Ok(format!("/{SEGMENT_PREFIX}{name}"))
}

/// Remove a region by name regardless of its state.
///
/// The mapping disappears from the namespace immediately; processes that
/// still have it mapped keep their mapping until they detach. Intended for
/// operator cleanup, not for the hot path.
pub fn unlink_region(name: &str) -> Result<()> {
    let shm_name = segment_name(name)?;
    segment::ShmSegment::unlink(&shm_name)
}

/// Sweep `/dev/shm` for DataBlock segments whose recorded producer is dead
/// and remove them.
///
/// Returns the number of segments removed. Call before starting a fresh
/// producer to reclaim regions left behind by crashed processes.
pub fn cleanup_stale_regions() -> usize {
    let shm_dir = std::path::Path::new("/dev/shm");
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return 0;
    };

    let mut cleaned = 0;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file) = file_name.to_str() else {
            continue;
        };
        if !file.starts_with(SEGMENT_PREFIX) {
            continue;
        }

        let shm_name = format!("/{file}");
        if region_is_stale(&shm_name) && segment::ShmSegment::unlink(&shm_name).is_ok() {
            log::debug!("[DATABLOCK] removed stale region {shm_name}");
            cleaned += 1;
        }
    }
    cleaned
}

/// A region is stale when its header is unreadable/invalid, or when the
/// recorded producer PID no longer names a live process.
fn region_is_stale(shm_name: &str) -> bool {
    let Ok(seg) = segment::ShmSegment::open(shm_name) else {
        return false;
    };
    if seg.size() < layout::HEADER_LEN {
        return true;
    }
    // SAFETY: the mapping is at least HEADER_LEN bytes and page-aligned,
    // which satisfies RegionHeader's alignment. Header fields read here are
    // either written once at creation or atomics.
    let header = unsafe { &*(seg.as_ptr() as *const layout::RegionHeader) };
    if header.validate().is_err() {
        return true;
    }
    let pid = header.producer_pid();
    pid != 0 && !liveness::is_process_alive(pid)
}
