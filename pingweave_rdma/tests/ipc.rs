/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Producer and consumer running concurrently against a real shared memory
//! region.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use pingweave_rdma::ipc::IpcConsumer;
use pingweave_rdma::ipc::IpcOptions;
use pingweave_rdma::ipc::IpcProducer;

fn unique_id(tag: &str) -> String {
    format!("it_{}_{}_{}", tag, std::process::id(), rand::random::<u32>())
}

fn spawn_consumer(
    id: String,
    batch_size: usize,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<Vec<(Instant, String)>> {
    thread::spawn(move || {
        let mut consumer = IpcConsumer::open(&id, batch_size).unwrap();
        let mut received = Vec::new();
        loop {
            for message in consumer.try_drain() {
                received.push((Instant::now(), message));
            }
            if done.load(Ordering::Acquire) && !consumer.is_ready() {
                break;
            }
            thread::sleep(Duration::from_micros(200));
        }
        received
    })
}

#[test]
fn test_ring_delivers_in_order() {
    pingweave_rdma::telemetry::initialize_logging_for_test();

    const TOTAL: u64 = 20_000;
    let id = unique_id("order");
    let options = IpcOptions {
        batch_size: 64,
        flush_wait_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let mut producer = IpcProducer::create(&id, options).unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let consumer = spawn_consumer(id.clone(), 64, done.clone());

    for seq in 0..TOTAL {
        producer.enqueue(&format!("10.0.0.{},{},0,{}", seq % 250, seq, seq * 1000));
    }
    producer.flush().unwrap();
    done.store(true, Ordering::Release);

    let received = consumer.join().unwrap();
    assert_eq!(received.len() as u64 + producer.dropped(), TOTAL);

    let mut last = None;
    for (_, message) in &received {
        let fields: Vec<&str> = message.split(',').collect();
        assert_eq!(fields.len(), 4, "torn message: {:?}", message);
        let seq: u64 = fields[1].parse().unwrap();
        assert_eq!(fields[0], format!("10.0.0.{}", seq % 250));
        assert_eq!(fields[3], (seq * 1000).to_string());
        if let Some(last) = last {
            assert!(seq > last, "message {} delivered after {}", seq, last);
        }
        last = Some(seq);
    }
}

#[test]
fn test_timeout_flush_of_single_message() {
    let id = unique_id("timing");
    let timeout = Duration::from_millis(100);
    let options = IpcOptions {
        batch_size: 1000,
        batch_timeout: timeout,
        ..Default::default()
    };
    let mut producer = IpcProducer::create(&id, options).unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let consumer = spawn_consumer(id.clone(), 1000, done.clone());

    let start = producer.last_flush();
    assert!(producer.enqueue("10.0.0.2,1,0,42"));
    // Silence: only the owner's loop polls.
    loop {
        if producer.poll_flush().unwrap() {
            break;
        }
        thread::sleep(Duration::from_micros(500));
    }
    let flushed_at = Instant::now();
    done.store(true, Ordering::Release);

    let received = consumer.join().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1, "10.0.0.2,1,0,42");

    let elapsed = received[0].0.duration_since(start);
    assert!(elapsed >= timeout, "flushed early after {:?}", elapsed);
    assert!(
        flushed_at.duration_since(start) < timeout + Duration::from_millis(80),
        "flushed late after {:?}",
        flushed_at.duration_since(start)
    );
}
