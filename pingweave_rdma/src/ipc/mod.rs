/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Batched single-producer/single-consumer queue over POSIX shared memory.
//!
//! The measuring process writes one 64-byte message per ping result with
//! [`IpcProducer::enqueue`]; the reporting process drains them in batches
//! with [`IpcConsumer::try_drain`]. The region named `/pingweave_<id>` is laid
//! out as
//!
//! ```text
//! [capacity x 64-byte slots][tail: u32][head: u32][ready: u8][pad][capacity: u32]
//! ```
//!
//! with `capacity = batch_size + 1`, so that a full batch always fits and a
//! full ring (`(tail + 1) % capacity == head`) is never confused with an
//! empty one (`head == tail`). The producer records the capacity in the
//! control block; a consumer attaching with a different batch size is
//! rejected.
//!
//! Only the producer writes `tail` and only the consumer writes `head`.
//! `ready` is the rendezvous: the producer sets it to publish a batch and
//! waits for the consumer to clear it once it has drained up to `tail`.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::MESSAGE_SIZE;

mod consumer;
mod producer;
mod shm;

pub use consumer::IpcConsumer;
pub use producer::IpcProducer;

/// Prefix of every region name.
pub const SHM_NAME_PREFIX: &str = "/pingweave_";

/// Errors returned by the IPC channel.
#[derive(thiserror::Error, Debug)]
pub enum IpcError {
    #[error("{op} failed for shared memory {name}: {source}")]
    Shm {
        name: String,
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("shared memory {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid shared memory name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("shared memory {name} does not match the expected layout: {reason}")]
    LayoutMismatch { name: String, reason: String },

    #[error("batch size {batch_size} is out of range for shared memory {name}")]
    InvalidBatchSize { name: String, batch_size: usize },

    #[error("consumer of {name} did not drain the batch within {waited:?}")]
    ConsumerUnresponsive { name: String, waited: Duration },
}

/// Tuning of the producer side of the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcOptions {
    /// Number of messages that triggers a flush. The ring holds
    /// `batch_size + 1` slots.
    pub batch_size: usize,
    /// Maximum time between flushes while messages are pending.
    #[serde(with = "crate::config::humantime_duration")]
    pub batch_timeout: Duration,
    /// Sleep between checks of the ready flag while flushing.
    #[serde(with = "crate::config::humantime_duration")]
    pub poll_interval: Duration,
    /// How long a flush waits for the consumer before giving up.
    #[serde(with = "crate::config::humantime_duration")]
    pub flush_wait_timeout: Duration,
}

impl Default for IpcOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_micros(500),
            flush_wait_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared memory name for the channel identified by `id`.
pub fn shm_name(id: &str) -> String {
    format!("{}{}", SHM_NAME_PREFIX, id)
}

/// Typed view over a mapped region.
pub(crate) struct Ring {
    shm: shm::SharedMemory,
    capacity: usize,
}

impl Ring {
    const TAIL_OFFSET: usize = 0;
    const HEAD_OFFSET: usize = 4;
    const READY_OFFSET: usize = 8;
    const CAPACITY_OFFSET: usize = 12;
    const CONTROL_SIZE: usize = 16;

    /// Bytes needed for a ring of `capacity` slots. `None` when the ring
    /// cannot hold a message or cannot be indexed with `u32`.
    pub(crate) fn region_size(capacity: usize) -> Option<usize> {
        if capacity < 2 || u32::try_from(capacity).is_err() {
            return None;
        }
        capacity
            .checked_mul(MESSAGE_SIZE)?
            .checked_add(Self::CONTROL_SIZE)
    }

    fn layout(name: &str, batch_size: usize) -> Result<(usize, usize), IpcError> {
        batch_size
            .checked_add(1)
            .and_then(|capacity| Some((capacity, Self::region_size(capacity)?)))
            .ok_or_else(|| IpcError::InvalidBatchSize {
                name: name.to_string(),
                batch_size,
            })
    }

    /// Creates the region for batches of `batch_size` messages and resets
    /// its control block.
    pub(crate) fn create(name: &str, batch_size: usize) -> Result<Self, IpcError> {
        let (capacity, size) = Self::layout(name, batch_size)?;
        let shm = shm::SharedMemory::create(name, size)?;
        let ring = Self { shm, capacity };
        ring.tail().store(0, Ordering::SeqCst);
        ring.head().store(0, Ordering::SeqCst);
        ring.ready().store(false, Ordering::SeqCst);
        ring.stored_capacity().store(capacity as u32, Ordering::SeqCst);
        Ok(ring)
    }

    /// Attaches to a region created with the same `batch_size`.
    pub(crate) fn open(name: &str, batch_size: usize) -> Result<Self, IpcError> {
        let (capacity, size) = Self::layout(name, batch_size)?;
        let shm = shm::SharedMemory::open(name, size)?;
        let ring = Self { shm, capacity };
        let stored = ring.stored_capacity().load(Ordering::Acquire);
        if stored as usize != capacity {
            return Err(IpcError::LayoutMismatch {
                name: name.to_string(),
                reason: format!("capacity is {}, expected {}", stored, capacity),
            });
        }
        Ok(ring)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    fn control(&self, offset: usize) -> *mut u8 {
        // SAFETY: the control block lies within the mapping (see
        // `region_size`).
        unsafe { self.shm.as_ptr().add(self.capacity * MESSAGE_SIZE + offset) }
    }

    pub(crate) fn tail(&self) -> &AtomicU32 {
        // SAFETY: the offset is 4-byte aligned (slots are 64 bytes, the
        // mapping is page aligned) and lives as long as `self`.
        unsafe { &*(self.control(Self::TAIL_OFFSET) as *const AtomicU32) }
    }

    pub(crate) fn head(&self) -> &AtomicU32 {
        // SAFETY: as for `tail`.
        unsafe { &*(self.control(Self::HEAD_OFFSET) as *const AtomicU32) }
    }

    pub(crate) fn ready(&self) -> &AtomicBool {
        // SAFETY: as for `tail`; AtomicBool has alignment 1.
        unsafe { &*(self.control(Self::READY_OFFSET) as *const AtomicBool) }
    }

    fn stored_capacity(&self) -> &AtomicU32 {
        // SAFETY: as for `tail`.
        unsafe { &*(self.control(Self::CAPACITY_OFFSET) as *const AtomicU32) }
    }

    pub(crate) fn next(&self, index: u32) -> u32 {
        ((index as usize + 1) % self.capacity) as u32
    }

    /// Copies `message` into slot `index`, truncated to at most
    /// `MESSAGE_SIZE - 1` bytes on a character boundary and NUL padded.
    ///
    /// Only the producer may call this, and only for the slot at `tail`.
    pub(crate) fn write_slot(&self, index: u32, message: &str) {
        let mut len = message.len().min(MESSAGE_SIZE - 1);
        while !message.is_char_boundary(len) {
            len -= 1;
        }
        // SAFETY: `index < capacity`, so the slot lies within the mapping. The
        // consumer does not read this slot until `tail` moves past it.
        unsafe {
            let slot = self.shm.as_ptr().add(index as usize * MESSAGE_SIZE);
            std::ptr::copy_nonoverlapping(message.as_ptr(), slot, len);
            std::ptr::write_bytes(slot.add(len), 0, MESSAGE_SIZE - len);
        }
    }

    /// Reads slot `index` up to its first NUL byte.
    ///
    /// Only the consumer may call this, and only for slots between `head`
    /// and a `tail` it has loaded with acquire ordering.
    pub(crate) fn read_slot(&self, index: u32) -> String {
        // SAFETY: `index < capacity`, so the slot lies within the mapping, and
        // the producer does not rewrite it until `head` moves past it.
        let slot = unsafe {
            std::slice::from_raw_parts(
                self.shm.as_ptr().add(index as usize * MESSAGE_SIZE),
                MESSAGE_SIZE,
            )
        };
        let len = slot.iter().position(|&b| b == 0).unwrap_or(MESSAGE_SIZE);
        String::from_utf8_lossy(&slot[..len]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout() {
        assert_eq!(Ring::region_size(1001), Some(1001 * 64 + 16));
        assert_eq!(Ring::region_size(1), None);
        assert_eq!(Ring::region_size(usize::MAX), None);
        assert_eq!(shm_name("10.0.0.1_tx"), "/pingweave_10.0.0.1_tx");
    }

    #[test]
    fn test_invalid_batch_size() {
        let name = shm_name(&format!("ring_batch_{}", std::process::id()));
        for batch_size in [0, usize::MAX] {
            assert!(matches!(
                Ring::create(&name, batch_size),
                Err(IpcError::InvalidBatchSize { batch_size: b, .. }) if b == batch_size
            ));
        }
    }

    #[test]
    fn test_open_rejects_other_batch_size() {
        let name = shm_name(&format!("ring_layout_{}", std::process::id()));
        let _ring = Ring::create(&name, 8).unwrap();

        assert_eq!(Ring::open(&name, 8).unwrap().capacity(), 9);
        for batch_size in [4, 16] {
            assert!(matches!(
                Ring::open(&name, batch_size),
                Err(IpcError::LayoutMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_slot_truncation() {
        let name = shm_name(&format!("ring_test_{}", std::process::id()));
        let ring = Ring::create(&name, 2).unwrap();

        let long = "x".repeat(100);
        ring.write_slot(0, &long);
        assert_eq!(ring.read_slot(0), "x".repeat(MESSAGE_SIZE - 1));

        // A shorter message overwrites the tail of the previous one.
        ring.write_slot(0, "short");
        assert_eq!(ring.read_slot(0), "short");

        // Two-byte characters: 63 bytes would split the 32nd one.
        ring.write_slot(1, &"é".repeat(40));
        assert_eq!(ring.read_slot(1), "é".repeat(31));

        assert_eq!(ring.next(0), 1);
        assert_eq!(ring.next(2), 0);
    }
}
