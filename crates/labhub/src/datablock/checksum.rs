// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! BLAKE2b-128 checksum engine.
//!
//! Every committed payload, the flex zone, and the region header carry a
//! 16-byte BLAKE2b digest. Producers stamp digests before the release-store
//! that publishes them; consumers recompute after reading and compare.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};

/// BLAKE2b with 16-byte (128-bit) output.
pub type Blake2b128 = Blake2b<U16>;

/// Digest length in bytes.
pub const CHECKSUM_LEN: usize = 16;

/// Compute the BLAKE2b-128 digest of `data`.
#[must_use]
pub fn digest(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Blake2b128::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compare a stored digest against the digest of `data`.
#[inline]
#[must_use]
pub fn verify(data: &[u8], stored: &[u8; CHECKSUM_LEN]) -> bool {
    digest(data) == *stored
}
