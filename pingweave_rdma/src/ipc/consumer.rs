/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::sync::atomic::Ordering;

use super::IpcError;
use super::Ring;
use super::shm_name;

/// Reading side of the channel, used by the reporting process.
///
/// Attaches to a region created by an [`super::IpcProducer`] with the same
/// `id` and `batch_size`. The consumer never unlinks the region.
pub struct IpcConsumer {
    ring: Ring,
    name: String,
}

impl IpcConsumer {
    pub fn open(id: &str, batch_size: usize) -> Result<Self, IpcError> {
        let name = shm_name(id);
        let ring = Ring::open(&name, batch_size)?;
        tracing::debug!("[{}] consumer attached", name);
        Ok(Self { ring, name })
    }

    /// Whether the producer has published a batch that has not been drained.
    pub fn is_ready(&self) -> bool {
        self.ring.ready().load(Ordering::Acquire)
    }

    /// Drains every message between head and tail if a batch is published,
    /// then releases the producer by clearing the ready flag. Returns an
    /// empty vector when nothing is published.
    pub fn try_drain(&mut self) -> Vec<String> {
        if !self.is_ready() {
            return Vec::new();
        }

        let tail = self.ring.tail().load(Ordering::Acquire);
        let mut head = self.ring.head().load(Ordering::Relaxed);
        let mut messages = Vec::new();
        while head != tail {
            messages.push(self.ring.read_slot(head));
            head = self.ring.next(head);
        }
        self.ring.head().store(tail, Ordering::Release);
        self.ring.ready().store(false, Ordering::Release);

        tracing::trace!("[{}] drained {} messages", self.name, messages.len());
        messages
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ipc::IpcOptions;
    use crate::ipc::IpcProducer;

    #[test]
    fn test_open_missing_region() {
        let id = format!("missing_{}", std::process::id());
        assert!(matches!(
            IpcConsumer::open(&id, 10),
            Err(IpcError::Shm { .. })
        ));
    }

    #[test]
    fn test_open_with_other_batch_size() {
        let id = format!("mismatch_{}_{}", std::process::id(), rand::random::<u32>());
        let options = IpcOptions {
            batch_size: 8,
            ..Default::default()
        };
        let _producer = IpcProducer::create_with_clock(&id, options, ManualClock::new()).unwrap();

        assert!(matches!(
            IpcConsumer::open(&id, 4),
            Err(IpcError::LayoutMismatch { .. })
        ));
        assert!(matches!(
            IpcConsumer::open(&id, 0),
            Err(IpcError::InvalidBatchSize { .. })
        ));
        assert!(IpcConsumer::open(&id, 8).is_ok());
    }

    #[test]
    fn test_drain_only_when_ready() {
        let id = format!("drain_{}_{}", std::process::id(), rand::random::<u32>());
        let options = IpcOptions {
            batch_size: 4,
            flush_wait_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        let mut producer = IpcProducer::create_with_clock(&id, options, ManualClock::new()).unwrap();
        let mut consumer = IpcConsumer::open(&id, 4).unwrap();

        assert!(producer.enqueue("10.0.0.2,1,0,100"));
        assert!(producer.enqueue("10.0.0.3,2,0,200"));
        // Not published yet.
        assert!(!consumer.is_ready());
        assert!(consumer.try_drain().is_empty());

        assert!(producer.flush().is_err());
        assert!(consumer.is_ready());
        assert_eq!(
            consumer.try_drain(),
            vec!["10.0.0.2,1,0,100".to_string(), "10.0.0.3,2,0,200".to_string()]
        );
        assert!(!consumer.is_ready());

        // Slots are reused after the drain: the ring wraps around.
        for i in 0..4 {
            assert!(producer.enqueue(&format!("m{}", i)));
        }
        assert_eq!(producer.dropped(), 0);
        assert_eq!(consumer.try_drain().len(), 4);
    }
}
