// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Publishes a monotonic counter plus a timestamp.
//!
//! Slot layout (little-endian):
//!   0   8   count (i64)  - monotonic counter
//!   8   8   ts    (f64)  - Unix timestamp, seconds
//!
//! Flex zone:
//!   0   8   producer_pid (u64)
//!   8   8   start_time   (f64)
//!   16  32  label        (NUL-padded)
//!
//! Run `consumer_logger` against the same channel name:
//!
//! ```text
//! cargo run --example producer_counter -- lab.examples.counter
//! ```

use labhub::{DataBlockConfig, Producer, ReserveOutcome};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LABEL: &[u8] = b"lab.examples.counter";

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn main() -> labhub::Result<()> {
    env_logger::init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "lab.examples.counter".to_string());

    let config = DataBlockConfig::with_geometry(64, 64, 48);
    let mut producer = Producer::create(&name, config)?;

    // Stamp the channel metadata once, before the write loop.
    let flex = producer.flexzone_mut();
    flex[..8].copy_from_slice(&u64::from(std::process::id()).to_le_bytes());
    flex[8..16].copy_from_slice(&unix_now().to_le_bytes());
    flex[16..16 + LABEL.len()].copy_from_slice(LABEL);
    producer.flexzone_checksum_update();

    log::info!(
        "producer_counter: started on '{name}', pid={}",
        std::process::id()
    );

    let mut count: i64 = 0;
    loop {
        match producer.reserve(Duration::from_millis(100))? {
            ReserveOutcome::Slot(handle) => {
                count += 1;
                let payload = producer.payload_mut(&handle);
                payload[..8].copy_from_slice(&count.to_le_bytes());
                payload[8..16].copy_from_slice(&unix_now().to_le_bytes());
                producer.commit(handle, true)?;

                if count % 1000 == 0 {
                    log::info!("producer_counter: slot {count}");
                }
            }
            ReserveOutcome::Busy => {
                // Drop-newest policy: a straggling reader kept the slot.
                log::debug!("producer_counter: slot busy, sample dropped");
            }
            ReserveOutcome::Stopped => break,
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    log::info!("producer_counter: stopped after {count} slots");
    Ok(())
}
