/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use super::IpcError;
use super::IpcOptions;
use super::Ring;
use super::shm_name;
use crate::clock::Clock;
use crate::clock::RealClock;

/// Writing side of the channel. Creates the region and unlinks it on drop.
///
/// `enqueue` never blocks on a full ring: the message is dropped and counted
/// instead, so the measurement path cannot stall on a slow reporter. Pending
/// messages are published when `batch_size` of them have accumulated or when
/// `batch_timeout` has passed since the previous flush.
pub struct IpcProducer<C: Clock = RealClock> {
    ring: Ring,
    name: String,
    options: IpcOptions,
    clock: C,
    unflushed: usize,
    last_flush: Instant,
    dropped: u64,
    // Set when a flush gave up on the consumer; cleared once it drains again.
    stalled: bool,
}

impl IpcProducer<RealClock> {
    /// Creates (or re-initializes) the region `/pingweave_<id>`.
    pub fn create(id: &str, options: IpcOptions) -> Result<Self, IpcError> {
        Self::create_with_clock(id, options, RealClock)
    }
}

impl<C: Clock> IpcProducer<C> {
    pub fn create_with_clock(id: &str, options: IpcOptions, clock: C) -> Result<Self, IpcError> {
        let name = shm_name(id);
        let ring = Ring::create(&name, options.batch_size)?;
        let last_flush = clock.now();
        tracing::info!(
            "[{}] producer queue created (capacity {})",
            name,
            ring.capacity()
        );
        Ok(Self {
            ring,
            name,
            options,
            clock,
            unflushed: 0,
            last_flush,
            dropped: 0,
            stalled: false,
        })
    }

    /// Appends `message` (truncated to 63 bytes) to the ring.
    ///
    /// Returns `false` if the ring is full; the message is dropped and the
    /// drop counter is incremented. A flush triggered by this call that fails
    /// is logged, not returned: the message itself was queued.
    pub fn enqueue(&mut self, message: &str) -> bool {
        let tail = self.ring.tail().load(Ordering::Relaxed);
        let next = self.ring.next(tail);
        if next == self.ring.head().load(Ordering::Acquire) {
            self.dropped += 1;
            tracing::debug!("[{}] queue full, dropped: {}", self.name, self.dropped);
            return false;
        }

        self.ring.write_slot(tail, message);
        self.ring.tail().store(next, Ordering::Release);
        self.unflushed += 1;

        if self.unflushed >= self.options.batch_size || self.timeout_elapsed() {
            if let Err(e) = self.flush() {
                tracing::warn!("[{}] {}", self.name, e);
            }
        }
        true
    }

    /// Flushes if messages are pending and `batch_timeout` has passed since
    /// the previous flush. Meant to be called from the owner's loop so that a
    /// quiet producer still publishes within the timeout.
    ///
    /// Returns whether a flush was attempted.
    pub fn poll_flush(&mut self) -> Result<bool, IpcError> {
        if self.unflushed == 0 || !self.timeout_elapsed() {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Publishes the pending messages and waits for the consumer to drain
    /// them.
    ///
    /// The wait is bounded by `flush_wait_timeout`. On expiry the batch stays
    /// published (a late consumer still drains it), the pending count is
    /// reset, and `IpcError::ConsumerUnresponsive` is returned. Until the
    /// consumer clears the ready flag again, later flushes fail immediately
    /// instead of waiting.
    pub fn flush(&mut self) -> Result<(), IpcError> {
        if self.unflushed == 0 {
            return Ok(());
        }

        if self.stalled {
            if self.ring.ready().load(Ordering::Acquire) {
                self.mark_flushed();
                return Err(IpcError::ConsumerUnresponsive {
                    name: self.name.clone(),
                    waited: Duration::ZERO,
                });
            }
            tracing::info!("[{}] consumer resumed draining", self.name);
            self.stalled = false;
        }

        self.ring.ready().store(true, Ordering::Release);
        let start = self.clock.now();
        while self.ring.ready().load(Ordering::Acquire) {
            let waited = self.clock.now().duration_since(start);
            if waited >= self.options.flush_wait_timeout {
                tracing::warn!(
                    "[{}] consumer did not drain {} messages within {:?}",
                    self.name,
                    self.unflushed,
                    waited
                );
                self.stalled = true;
                self.mark_flushed();
                return Err(IpcError::ConsumerUnresponsive {
                    name: self.name.clone(),
                    waited,
                });
            }
            self.clock.sleep(self.options.poll_interval);
        }

        tracing::trace!("[{}] flushed {} messages", self.name, self.unflushed);
        self.mark_flushed();
        Ok(())
    }

    fn mark_flushed(&mut self) {
        self.unflushed = 0;
        self.last_flush = self.clock.now();
    }

    fn timeout_elapsed(&self) -> bool {
        self.clock.now().duration_since(self.last_flush) >= self.options.batch_timeout
    }

    /// Number of messages dropped because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Number of messages written since the last flush.
    pub fn unflushed(&self) -> usize {
        self.unflushed
    }

    /// Time of the last completed (or abandoned) flush.
    pub fn last_flush(&self) -> Instant {
        self.last_flush
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &IpcOptions {
        &self.options
    }
}

impl<C: Clock> Drop for IpcProducer<C> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!("[{}] final flush failed: {}", self.name, e);
        }
        tracing::info!(
            "[{}] producer queue closed ({} messages dropped)",
            self.name,
            self.dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ipc::IpcConsumer;

    fn unique_id(tag: &str) -> String {
        format!("{}_{}_{}", tag, std::process::id(), rand::random::<u32>())
    }

    fn options(batch_size: usize) -> IpcOptions {
        IpcOptions {
            batch_size,
            batch_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_micros(500),
            flush_wait_timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_create_rejects_invalid_batch_size() {
        for batch_size in [0, usize::MAX] {
            let id = unique_id("batch");
            assert!(matches!(
                IpcProducer::create_with_clock(&id, options(batch_size), ManualClock::new()),
                Err(IpcError::InvalidBatchSize { .. })
            ));
        }
    }

    #[test]
    fn test_capacity_drops_exactly_one() {
        let clock = ManualClock::new();
        let id = unique_id("capacity");
        let mut producer = IpcProducer::create_with_clock(&id, options(4), clock).unwrap();

        for i in 0..4 {
            assert!(producer.enqueue(&format!("msg {}", i)));
        }
        // The fourth enqueue triggered a flush nobody answered.
        assert_eq!(producer.dropped(), 0);
        assert_eq!(producer.unflushed(), 0);

        assert!(!producer.enqueue("overflow"));
        assert_eq!(producer.dropped(), 1);
    }

    #[test]
    fn test_flush_without_consumer_is_bounded() {
        let clock = ManualClock::new();
        let id = unique_id("bounded");
        let mut producer = IpcProducer::create_with_clock(&id, options(8), clock.clone()).unwrap();

        assert!(producer.enqueue("a"));
        let start = clock.now();
        let err = producer.flush().unwrap_err();
        assert!(matches!(err, IpcError::ConsumerUnresponsive { .. }));
        assert!(clock.now() - start >= Duration::from_millis(10));
        assert_eq!(producer.unflushed(), 0);

        // While stalled, further flushes fail without waiting.
        assert!(producer.enqueue("b"));
        let start = clock.now();
        assert!(producer.flush().is_err());
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_flush_resumes_after_consumer_drains() {
        let clock = ManualClock::new();
        let id = unique_id("resume");
        let mut producer = IpcProducer::create_with_clock(&id, options(8), clock).unwrap();
        let mut consumer = IpcConsumer::open(&id, 8).unwrap();

        assert!(producer.enqueue("first"));
        assert!(producer.flush().is_err());

        // A late consumer still sees the published batch.
        assert_eq!(consumer.try_drain(), vec!["first".to_string()]);

        assert!(producer.enqueue("second"));
        // The consumer has cleared ready, so the stall is over; nobody drains
        // this time, so the bounded wait applies again.
        assert!(matches!(
            producer.flush(),
            Err(IpcError::ConsumerUnresponsive { waited, .. }) if waited >= Duration::from_millis(10)
        ));
        assert_eq!(consumer.try_drain(), vec!["second".to_string()]);
    }

    #[test]
    fn test_poll_flush_waits_for_timeout() {
        let clock = ManualClock::new();
        let id = unique_id("poll");
        let mut producer = IpcProducer::create_with_clock(&id, options(8), clock.clone()).unwrap();

        assert!(!producer.poll_flush().unwrap());
        assert!(producer.enqueue("a"));
        clock.advance(Duration::from_millis(99));
        assert!(!producer.poll_flush().unwrap());
        assert_eq!(producer.unflushed(), 1);

        clock.advance(Duration::from_millis(1));
        // Attempted, but there is no consumer.
        assert!(producer.poll_flush().is_err());
        assert_eq!(producer.unflushed(), 0);
    }

    #[test]
    fn test_enqueue_flushes_after_timeout() {
        let clock = ManualClock::new();
        let id = unique_id("enqueue_timeout");
        let mut producer = IpcProducer::create_with_clock(&id, options(8), clock.clone()).unwrap();

        assert!(producer.enqueue("a"));
        assert_eq!(producer.unflushed(), 1);
        clock.advance(Duration::from_millis(100));
        assert!(producer.enqueue("b"));
        assert_eq!(producer.unflushed(), 0);
    }
}
