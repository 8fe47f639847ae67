// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 labhub contributors

//! End-to-end scenarios over the public API: a producer and consumers on a
//! real shared-memory region, including checksum corruption injected
//! through the region's backing file.

use labhub::{
    ChecksumFailPolicy, Consumer, DataBlockConfig, Producer, ReadOutcome, ReserveOutcome,
};
use std::time::Duration;

fn unique_name(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{prefix}-{ts}")
}

struct Region(String);

impl Drop for Region {
    fn drop(&mut self) {
        labhub::unlink_region(&self.0).ok();
    }
}

fn ring_config() -> DataBlockConfig {
    DataBlockConfig::with_geometry(4, 64, 0).drain_timeout(Duration::from_millis(5))
}

fn commit_generation(producer: &mut Producer) -> u64 {
    loop {
        match producer.reserve(Duration::from_millis(50)).expect("reserve") {
            ReserveOutcome::Slot(handle) => {
                let gen = handle.generation();
                let byte = (gen % 251) as u8;
                producer.payload_mut(&handle).fill(byte);
                return producer.commit(handle, true).expect("commit");
            }
            ReserveOutcome::Busy => std::thread::yield_now(),
            ReserveOutcome::Stopped => panic!("unexpected shutdown"),
        }
    }
}

#[test]
fn happy_path_delivers_every_generation() {
    let name = unique_name("scn-happy");
    let _region = Region(name.clone());
    let mut producer = Producer::create(&name, ring_config()).expect("create");
    let mut consumer = Consumer::attach(&name).expect("attach");

    // Lock-step: one commit, one read. Every generation is delivered, none
    // skipped, every checksum verifies.
    for expected in 1..=1000u64 {
        let committed = commit_generation(&mut producer);
        assert_eq!(committed, expected);

        let ReadOutcome::Slot(sample) = consumer.read(Duration::from_millis(10)).expect("read")
        else {
            panic!("generation {expected} not delivered");
        };
        assert_eq!(sample.generation(), expected);
        assert_eq!(sample.skipped(), 0);
        assert!(sample.is_valid());
        let byte = (expected % 251) as u8;
        assert!(sample.payload().iter().all(|&b| b == byte));
    }

    let snap = consumer.metrics.snapshot();
    assert_eq!(snap.deliveries, 1000);
    assert_eq!(snap.skips, 0);
    assert_eq!(snap.checksum_failures, 0);
}

#[test]
fn slow_consumer_accounts_for_every_generation() {
    let name = unique_name("scn-slow");
    let _region = Region(name.clone());
    let mut producer = Producer::create(&name, ring_config()).expect("create");
    let mut consumer = Consumer::attach(&name).expect("attach");

    let producer_thread = std::thread::spawn(move || {
        for _ in 1..=1000u64 {
            commit_generation(&mut producer);
        }
        producer
    });

    // The consumer deliberately lags; deliveries form a strictly
    // increasing subsequence and skips account for the rest.
    let mut deliveries = 0u64;
    let mut skipped_total = 0u64;
    let mut last_generation = 0u64;
    loop {
        match consumer.read(Duration::from_millis(100)).expect("read") {
            ReadOutcome::Slot(sample) => {
                assert!(sample.generation() > last_generation);
                last_generation = sample.generation();
                deliveries += 1;
                skipped_total += sample.skipped();
                let byte = (sample.generation() % 251) as u8;
                assert!(sample.payload().iter().all(|&b| b == byte));
                drop(sample);
                if last_generation == 1000 {
                    break;
                }
                std::thread::sleep(Duration::from_micros(200));
            }
            ReadOutcome::TimedOut => {
                assert!(last_generation < 1000, "timed out after the final generation");
            }
            ReadOutcome::Stopped => panic!("unexpected shutdown"),
        }
    }

    assert_eq!(deliveries + skipped_total, 1000);
    let producer = producer_thread.join().expect("producer thread");
    assert_eq!(producer.metrics.snapshot().commits, 1000);
}

#[test]
fn skip_count_is_exact() {
    let name = unique_name("scn-skip");
    let _region = Region(name.clone());
    let mut producer = Producer::create(&name, ring_config()).expect("create");
    let mut consumer = Consumer::attach(&name).expect("attach");

    commit_generation(&mut producer);
    {
        let ReadOutcome::Slot(sample) = consumer.read(Duration::from_millis(10)).expect("read")
        else {
            panic!("expected generation 1");
        };
        assert_eq!((sample.generation(), sample.skipped()), (1, 0));
    }

    for _ in 0..4 {
        commit_generation(&mut producer);
    }
    let ReadOutcome::Slot(sample) = consumer.read(Duration::from_millis(10)).expect("read")
    else {
        panic!("expected generation 5");
    };
    assert_eq!(sample.generation(), 5);
    assert_eq!(sample.skipped(), 3);
}

#[test]
fn two_consumers_read_independently() {
    let name = unique_name("scn-two");
    let _region = Region(name.clone());
    let mut producer = Producer::create(&name, ring_config()).expect("create");
    let mut first = Consumer::attach(&name).expect("attach first");
    let mut second = Consumer::attach(&name).expect("attach second");
    assert_ne!(first.uid(), second.uid());

    commit_generation(&mut producer);

    for consumer in [&mut first, &mut second] {
        let ReadOutcome::Slot(sample) = consumer.read(Duration::from_millis(10)).expect("read")
        else {
            panic!("expected a sample");
        };
        assert_eq!(sample.generation(), 1);
        assert!(sample.is_valid());
    }
}

#[cfg(target_os = "linux")]
fn corrupt_payload_byte(name: &str, slot_index: u64) {
    use std::io::{Seek, SeekFrom, Write};

    // Region layout for 4 slots x 64 bytes: header 128, slot states 256,
    // payloads from 384 at a 64-byte stride.
    let payload_offset = 128 + 4 * 64 + slot_index * 64;
    let path = format!("/dev/shm/labhub_{name}");
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .expect("open backing file");
    file.seek(SeekFrom::Start(payload_offset)).expect("seek");
    file.write_all(&[0xFF]).expect("corrupt");
}

#[cfg(target_os = "linux")]
#[test]
fn checksum_corruption_strict_suppresses_delivery() {
    let name = unique_name("scn-corrupt-strict");
    let _region = Region(name.clone());
    let mut producer = Producer::create(&name, ring_config()).expect("create");
    let mut consumer = Consumer::attach(&name).expect("attach");

    commit_generation(&mut producer); // generation 1, slot 1, payload bytes 1
    corrupt_payload_byte(&name, 1);

    // Strict policy: the corrupt generation is suppressed and the read
    // reports a timeout.
    assert!(matches!(
        consumer.read(Duration::from_millis(50)).expect("read"),
        ReadOutcome::TimedOut
    ));
    assert_eq!(consumer.metrics.snapshot().checksum_failures, 1);
    assert_eq!(consumer.metrics.snapshot().deliveries, 0);

    // The bus keeps going: the next generation is delivered normally.
    commit_generation(&mut producer);
    let ReadOutcome::Slot(sample) = consumer.read(Duration::from_millis(50)).expect("read")
    else {
        panic!("expected generation 2");
    };
    assert_eq!(sample.generation(), 2);
    assert!(sample.is_valid());
}

#[cfg(target_os = "linux")]
#[test]
fn checksum_corruption_pass_delivers_invalid() {
    let name = unique_name("scn-corrupt-pass");
    let _region = Region(name.clone());
    let config = ring_config().checksum_fail(ChecksumFailPolicy::Pass);
    let mut producer = Producer::create(&name, config).expect("create");
    let mut consumer = Consumer::attach(&name).expect("attach");

    commit_generation(&mut producer);
    corrupt_payload_byte(&name, 1);

    let ReadOutcome::Slot(sample) = consumer.read(Duration::from_millis(50)).expect("read")
    else {
        panic!("pass policy must deliver");
    };
    assert_eq!(sample.generation(), 1);
    assert!(!sample.is_valid());
    drop(sample);
    assert_eq!(consumer.metrics.snapshot().checksum_failures, 1);
    assert_eq!(consumer.metrics.snapshot().deliveries, 1);
}

#[test]
fn destroy_stops_attached_consumers() {
    let name = unique_name("scn-destroy");
    let _region = Region(name.clone());
    let producer = Producer::create(&name, ring_config()).expect("create");
    let mut consumer = Consumer::attach(&name).expect("attach");

    producer.destroy().expect("destroy");

    assert!(matches!(
        consumer.read(Duration::from_secs(1)).expect("read"),
        ReadOutcome::Stopped
    ));
    assert!(matches!(
        Consumer::attach(&name),
        Err(labhub::DataBlockError::NotFound(_))
    ));
}

#[test]
fn flexzone_survives_the_round_trip() {
    let name = unique_name("scn-flex");
    let _region = Region(name.clone());
    let config = DataBlockConfig::with_geometry(4, 64, 48);
    let mut producer = Producer::create(&name, config).expect("create");

    let flex = producer.flexzone_mut();
    flex[..8].copy_from_slice(&12345u64.to_le_bytes());
    flex[8..16].copy_from_slice(&6.25f64.to_le_bytes());
    producer.flexzone_checksum_update();

    let consumer = Consumer::attach(&name).expect("attach");
    assert!(consumer.verify_flexzone());
    let flex = consumer.flexzone();
    assert_eq!(u64::from_le_bytes(flex[..8].try_into().unwrap()), 12345);
    assert!((f64::from_le_bytes(flex[8..16].try_into().unwrap()) - 6.25).abs() < f64::EPSILON);
}

#[test]
fn blocked_consumer_wakes_across_threads() {
    let name = unique_name("scn-wake");
    let _region = Region(name.clone());
    let mut producer = Producer::create(&name, ring_config()).expect("create");
    let mut consumer = Consumer::attach(&name).expect("attach");

    let committer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        for _ in 0..3 {
            commit_generation(&mut producer);
        }
        producer
    });

    let mut last = 0;
    while last < 3 {
        match consumer.read(Duration::from_secs(2)).expect("read") {
            ReadOutcome::Slot(sample) => last = sample.generation(),
            ReadOutcome::TimedOut => panic!("wakeup lost"),
            ReadOutcome::Stopped => panic!("unexpected shutdown"),
        }
    }
    drop(committer.join().expect("committer"));
}
