// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! Two-process demo: the example re-executes itself as a producer child
//! and a consumer child sharing one DataBlock region.
//!
//! ```text
//! cargo run --example datablock_multiprocess
//! ```

use labhub::{Consumer, DataBlockConfig, Producer, ReadOutcome, ReserveOutcome};
use std::time::Duration;

const SAMPLES: u64 = 200;

fn run_producer(name: &str) -> labhub::Result<()> {
    let config = DataBlockConfig::with_geometry(16, 128, 0);
    let mut producer = Producer::create(name, config)?;
    println!("[producer {}] region '{name}' created", std::process::id());

    // Give the consumer child a moment to attach before the first commit.
    std::thread::sleep(Duration::from_millis(200));

    for i in 1..=SAMPLES {
        loop {
            match producer.reserve(Duration::from_millis(100))? {
                ReserveOutcome::Slot(handle) => {
                    let payload = producer.payload_mut(&handle);
                    payload[..8].copy_from_slice(&i.to_le_bytes());
                    payload[8..].fill((i % 251) as u8);
                    producer.commit(handle, true)?;
                    break;
                }
                ReserveOutcome::Busy => std::thread::yield_now(),
                ReserveOutcome::Stopped => return Ok(()),
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    println!(
        "[producer {}] committed {SAMPLES} samples: {}",
        std::process::id(),
        producer.metrics.snapshot()
    );
    // Let the consumer drain the tail before the region shuts down.
    std::thread::sleep(Duration::from_millis(500));
    producer.destroy()
}

fn run_consumer(name: &str) -> labhub::Result<()> {
    // The producer child may not have created the region yet.
    let mut consumer = loop {
        match Consumer::attach(name) {
            Ok(consumer) => break consumer,
            Err(labhub::DataBlockError::NotFound(_)) => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e),
        }
    };
    println!("[consumer {}] attached to '{name}'", std::process::id());

    let mut delivered = 0u64;
    let mut skipped = 0u64;
    loop {
        let timed_out = match consumer.read(Duration::from_millis(500))? {
            ReadOutcome::Slot(sample) => {
                let seq = u64::from_le_bytes(sample.payload()[..8].try_into().unwrap());
                assert_eq!(seq, sample.generation());
                delivered += 1;
                skipped += sample.skipped();
                false
            }
            ReadOutcome::TimedOut => true,
            ReadOutcome::Stopped => break,
        };
        if timed_out && consumer.head_generation() >= SAMPLES {
            break;
        }
    }

    println!(
        "[consumer {}] delivered {delivered}, skipped {skipped} (sum {})",
        std::process::id(),
        delivered + skipped
    );
    Ok(())
}

fn main() -> labhub::Result<()> {
    env_logger::init();
    let mut args = std::env::args();
    let exe = args.next().expect("argv[0]");

    match (args.next().as_deref(), args.next()) {
        (Some("producer"), Some(name)) => run_producer(&name),
        (Some("consumer"), Some(name)) => run_consumer(&name),
        _ => {
            let name = format!("multiproc-{}", std::process::id());
            let mut producer = std::process::Command::new(&exe)
                .args(["producer", &name])
                .spawn()
                .expect("spawn producer");
            let mut consumer = std::process::Command::new(&exe)
                .args(["consumer", &name])
                .spawn()
                .expect("spawn consumer");

            let producer_ok = producer.wait().expect("wait producer").success();
            let consumer_ok = consumer.wait().expect("wait consumer").success();
            labhub::unlink_region(&name).ok();
            assert!(producer_ok && consumer_ok, "a child failed");
            println!("multiprocess demo complete");
            Ok(())
        }
    }
}
