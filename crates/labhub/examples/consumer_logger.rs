// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Subscribes to the counter channel from `producer_counter` and logs each
//! delivered slot, including skip warnings when it falls behind.
//!
//! ```text
//! cargo run --example consumer_logger -- lab.examples.counter
//! ```

use labhub::{Consumer, ReadOutcome};
use std::time::{Duration, Instant};

fn main() -> labhub::Result<()> {
    env_logger::init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "lab.examples.counter".to_string());

    let mut consumer = Consumer::attach(&name)?;

    let flex = consumer.flexzone();
    let producer_pid = u64::from_le_bytes(flex[..8].try_into().unwrap());
    let label: String = flex[16..48]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    log::info!(
        "consumer_logger: connected  producer_pid={producer_pid}  label='{label}'  flexzone_valid={}",
        consumer.verify_flexzone()
    );

    let start = Instant::now();
    let mut slots_read: u64 = 0;

    loop {
        match consumer.read(Duration::from_millis(100))? {
            ReadOutcome::Slot(sample) => {
                if !sample.is_valid() {
                    log::warn!("slot checksum failed at generation {}", sample.generation());
                }
                let payload = sample.payload();
                let count = i64::from_le_bytes(payload[..8].try_into().unwrap());
                let ts = f64::from_le_bytes(payload[8..16].try_into().unwrap());
                slots_read += 1;

                if sample.skipped() > 0 {
                    log::warn!("skipped {} slot(s) at count={count}", sample.skipped());
                }
                if count % 1000 == 0 {
                    let elapsed = start.elapsed().as_secs_f64();
                    let rate = if elapsed > 0.0 {
                        slots_read as f64 / elapsed
                    } else {
                        0.0
                    };
                    log::info!("slot {count}  ts={ts:.3}  rate={rate:.0} slots/s");
                }
            }
            ReadOutcome::TimedOut => {}
            ReadOutcome::Stopped => break,
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    log::info!("consumer_logger: stopped. read {slots_read} slots in {elapsed:.1}s");
    Ok(())
}
