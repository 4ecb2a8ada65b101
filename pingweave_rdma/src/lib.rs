/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! RDMA fabric health monitoring.
//!
//! A `pingweave_rdma` process binds to one RNIC port, dispatches heartbeat
//! datagrams to the peers that share a ping group with it, and relays each
//! measurement to a reporting process through a batched shared-memory queue.
//!
//! The transport layer (`context`, `transport`, `agent`) requires rdma-core
//! and is only compiled with the `rdma` feature. Everything else is plain
//! Rust: the GID codec, device lookup through sysfs, the IPC queue, the
//! scheduler and configuration.

// RDMA requires frequent unsafe code blocks
#![allow(clippy::undocumented_unsafe_blocks)]

pub mod clock;
pub mod config;
mod device;
mod gid;
pub mod ipc;
mod result;
pub mod scheduler;
pub mod telemetry;

#[cfg(feature = "rdma")]
pub mod agent;
#[cfg(feature = "rdma")]
mod context;
#[cfg(feature = "rdma")]
mod ibverbs_primitives;
#[cfg(all(test, feature = "rdma"))]
mod test_utils;
#[cfg(feature = "rdma")]
mod transport;

pub use device::*;
pub use gid::*;
pub use result::*;

#[cfg(feature = "rdma")]
pub use context::*;
#[cfg(feature = "rdma")]
pub use ibverbs_primitives::*;
#[cfg(feature = "rdma")]
pub use transport::*;

/// Size of one heartbeat message and of one IPC slot, in bytes.
pub const MESSAGE_SIZE: usize = 64;

/// Space reserved ahead of each UD receive for the global routing header.
pub const GRH_SIZE: usize = 40;
