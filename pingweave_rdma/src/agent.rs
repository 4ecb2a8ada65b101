/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The measurement loops.
//!
//! `run_sender` asks the scheduler for the next due target, sends it a
//! heartbeat and records the send completion. `run_receiver` keeps receives
//! posted and records every heartbeat that arrives. Both relay a
//! `PingResult` per measurement to the reporter through the IPC producer and
//! return once `shutdown` is set.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;

use crate::Heartbeat;
use crate::PingResult;
use crate::clock::Clock;
use crate::clock::RealClock;
use crate::clock::realtime_ns;
use crate::config::AgentConfig;
use crate::config::TransportMode;
use crate::context::RdmaContext;
use crate::context::WRID_RECV;
use crate::context::WRID_SEND;
use crate::context::address_key;
use crate::device::InterfaceSelector;
use crate::ibverbs_primitives::PeerAddress;
use crate::ibverbs_primitives::Role;
use crate::ibverbs_primitives::get_all_devices;
use crate::ibverbs_primitives::ibverbs_supported;
use crate::ipc::IpcProducer;
use crate::scheduler::PingScheduler;
use crate::scheduler::TargetEntry;
use crate::scheduler::TargetSource;
use crate::scheduler::YamlTargetSource;
use crate::transport::Completion;

/// Longest a loop iteration blocks, so that shutdown and batch timeouts are
/// noticed promptly.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Process-level parameters that do not come from the configuration file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub ip: Ipv4Addr,
    pub role: Role,
    /// IPC region identifier; the region is `/pingweave_<id>`.
    pub id: String,
    /// Where receivers, and senders in connected mode, publish their address.
    pub upload_dir: PathBuf,
    /// The other end of a connected-mode queue pair. A receiver binds to
    /// the sender's `<peer_ip>_tx` record, a sender to the receiver's
    /// `<peer_ip>` record and pings no one else.
    pub peer_ip: Option<String>,
}

impl RunOptions {
    /// Default IPC identifier: `<ip>_<role>`.
    pub fn default_id(ip: Ipv4Addr, role: Role) -> String {
        format!("{}_{}", ip, role)
    }
}

/// Sets up the context, the producer and (for senders) the scheduler, then
/// runs the loop for `options.role` until `shutdown` is set.
///
/// Receivers publish their address. In connected mode senders publish too,
/// and each end binds its queue pair to the other's record.
pub fn run(
    config: &AgentConfig,
    options: &RunOptions,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    let connected = config.rdma.transport == TransportMode::Connected;
    if connected && options.peer_ip.is_none() {
        anyhow::bail!("a connected-mode {} agent needs a peer ip", options.role);
    }
    if !ibverbs_supported() {
        anyhow::bail!("rdma-core reports no rdma devices");
    }
    for device in get_all_devices() {
        tracing::debug!("found rdma device {}", device);
    }
    let mut ctx = RdmaContext::new(&InterfaceSelector::Ip(options.ip), options.role, &config.rdma)
        .with_context(|| {
            format!(
                "failed to set up the {} context on {}",
                options.role, options.ip
            )
        })?;

    let mut producer = IpcProducer::create(&options.id, config.ipc.clone())
        .with_context(|| format!("failed to create the result queue {}", options.id))?;

    if options.role.is_rx() || connected {
        ctx.publish_address(&options.upload_dir)?;
    }

    let source = YamlTargetSource::new(&config.scheduler.document_dir);
    let peer_ip = if connected {
        options.peer_ip.as_deref()
    } else {
        None
    };
    match options.role {
        Role::Sender => {
            let mut scheduler =
                PingScheduler::new(options.ip.to_string(), source, config.scheduler.clone());
            run_sender(&mut ctx, &mut scheduler, &mut producer, peer_ip, shutdown)
        }
        Role::Receiver => {
            let peer = match peer_ip {
                Some(peer_ip) => {
                    let key = peer_key(peer_ip, options.role);
                    match wait_for_peer(&source, &key, config.scheduler.reload_period, shutdown)? {
                        Some(peer) => Some(peer),
                        None => return Ok(()),
                    }
                }
                None => None,
            };
            run_receiver(&mut ctx, peer.as_ref(), &mut producer, shutdown)
        }
    }
}

/// Address store key of the queue pair a `role` agent connects to on
/// `peer_ip`.
fn peer_key(peer_ip: &str, role: Role) -> String {
    address_key(peer_ip, role.counterpart())
}

fn lookup_peer(source: &impl TargetSource, key: &str) -> anyhow::Result<PeerAddress> {
    let documents = source.load()?;
    let (_, record) = documents
        .addresses
        .iter()
        .find(|(ip, _)| ip == key)
        .with_context(|| format!("{} is not in the address store", key))?;
    Ok(PeerAddress {
        qpn: record.qpn,
        lid: record.lid,
        gid: record.gid,
    })
}

/// Looks `key` up every `retry` until it is in the address store. The sync
/// process may not have fetched a freshly published record yet. Returns
/// `None` if `shutdown` is set first.
fn wait_for_peer(
    source: &impl TargetSource,
    key: &str,
    retry: Duration,
    shutdown: &AtomicBool,
) -> anyhow::Result<Option<PeerAddress>> {
    loop {
        match lookup_peer(source, key) {
            Ok(peer) => return Ok(Some(peer)),
            Err(e) => tracing::info!("waiting for peer: {:#}", e),
        }
        let deadline = RealClock.now() + retry;
        while RealClock.now() < deadline {
            if shutdown.load(Ordering::Relaxed) {
                return Ok(None);
            }
            RealClock.sleep(POLL_SLICE);
        }
    }
}

/// Whether a sender may ping `target_ip`. A connected-mode sender owns one
/// queue pair bound to `peer_ip`, so every other target is skipped.
fn dispatchable(peer_ip: Option<&str>, target_ip: &str) -> bool {
    match peer_ip {
        Some(peer_ip) => peer_ip == target_ip,
        None => true,
    }
}

fn record<C: Clock>(producer: &mut IpcProducer<C>, result: PingResult) {
    tracing::trace!("result {}", result);
    if !producer.enqueue(&result.to_message()) {
        tracing::debug!("result queue full, dropped ping {}", result.ping_id);
    }
}

/// Sends one heartbeat at a time to the scheduler's targets.
///
/// A send whose completion has not arrived blocks further dispatches; its
/// result is recorded when the completion is harvested, failed or not. With
/// `peer_ip` set, only that target is pinged.
pub fn run_sender<S, C, P>(
    ctx: &mut RdmaContext,
    scheduler: &mut PingScheduler<S, C>,
    producer: &mut IpcProducer<P>,
    peer_ip: Option<&str>,
    shutdown: &AtomicBool,
) -> anyhow::Result<()>
where
    S: TargetSource,
    C: Clock,
    P: Clock,
{
    tracing::info!("sender loop started for {}", scheduler.self_ip());
    let mut ping_id: u64 = 0;
    let mut pending: Option<(TargetEntry, u64)> = None;

    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = producer.poll_flush() {
            tracing::warn!("{}", e);
        }

        if let Some((target, id)) = pending.take() {
            match ctx
                .wait_completion(POLL_SLICE)
                .context("failed to harvest a send completion")?
            {
                Some(completion) if completion.wr_id == WRID_SEND => {
                    if !completion.is_success() {
                        tracing::warn!(
                            "heartbeat {} to {} failed: {}",
                            id,
                            target.ip,
                            completion.status_str()
                        );
                    }
                    record(
                        producer,
                        PingResult {
                            ip: target.ip,
                            ping_id: id,
                            status: completion.status,
                            timestamp_ns: completion.timestamp,
                        },
                    );
                }
                Some(completion) => {
                    tracing::debug!("ignoring completion {}", completion.wr_id);
                    pending = Some((target, id));
                }
                None => pending = Some((target, id)),
            }
            continue;
        }

        let Some(target) = scheduler.next() else {
            RealClock.sleep(scheduler.time_until_due().min(POLL_SLICE));
            continue;
        };
        if !dispatchable(peer_ip, &target.ip) {
            tracing::debug!("skipping {}, connected to {:?}", target.ip, peer_ip);
            continue;
        }

        let peer = PeerAddress::from(&target);
        if ctx.transport() == TransportMode::Connected && ctx.peer() != Some(&peer) {
            if let Err(e) = ctx.connect(&peer) {
                tracing::warn!("failed to connect to {}: {}", target.ip, e);
                continue;
            }
        }

        ping_id += 1;
        let heartbeat = Heartbeat {
            ping_id,
            sent_ns: realtime_ns(),
        };
        match ctx.post_send(&peer, &heartbeat.encode()) {
            Ok(()) => pending = Some((target, ping_id)),
            Err(e) => tracing::warn!(
                "failed to send heartbeat {} to {}: {}",
                ping_id,
                target.ip,
                e
            ),
        }
    }

    tracing::info!("sender loop stopped after {} heartbeats", ping_id);
    Ok(())
}

/// Identifies the sender of a received heartbeat: the IPv4 address of a
/// RoCE v2 source GID, the wire GID otherwise, or the connected peer.
fn sender_of(ctx: &RdmaContext, completion: &Completion) -> String {
    match ctx.received_source_gid(completion) {
        Some(gid) => gid
            .to_ipv4()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| gid.to_wire()),
        None => ctx
            .peer()
            .map(|peer| peer.gid.to_wire())
            .unwrap_or_else(|| format!("qpn:{}", completion.src_qp)),
    }
}

/// Keeps `rx_depth` receives posted and records each heartbeat received.
///
/// In connected mode the queue pair is first connected to `peer`.
pub fn run_receiver<P: Clock>(
    ctx: &mut RdmaContext,
    peer: Option<&PeerAddress>,
    producer: &mut IpcProducer<P>,
    shutdown: &AtomicBool,
) -> anyhow::Result<()> {
    if let Some(peer) = peer {
        ctx.connect(peer).context("failed to connect to the sender")?;
    }
    let depth = ctx.config().rx_depth as usize;
    ctx.post_recv(depth, WRID_RECV)
        .context("failed to post the initial receives")?;
    tracing::info!("receiver loop started with {} receives posted", depth);

    let mut received: u64 = 0;
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = producer.poll_flush() {
            tracing::warn!("{}", e);
        }

        let Some(completion) = ctx
            .wait_completion(POLL_SLICE)
            .context("failed to harvest a receive completion")?
        else {
            continue;
        };
        if completion.wr_id != WRID_RECV {
            tracing::debug!("ignoring completion {}", completion.wr_id);
            continue;
        }

        received += 1;
        let ip = sender_of(ctx, &completion);
        let ping_id = if completion.is_success() {
            match Heartbeat::decode(ctx.received_payload()) {
                Some(heartbeat) => heartbeat.ping_id,
                None => {
                    tracing::warn!("malformed heartbeat from {}", ip);
                    0
                }
            }
        } else {
            tracing::warn!("receive from {} failed: {}", ip, completion.status_str());
            0
        };
        record(
            producer,
            PingResult {
                ip,
                ping_id,
                status: completion.status,
                timestamp_ns: completion.timestamp,
            },
        );

        ctx.post_recv(1, WRID_RECV)
            .context("failed to re-post a receive")?;
    }

    tracing::info!("receiver loop stopped after {} heartbeats", received);
    Ok(())
}
