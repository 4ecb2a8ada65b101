/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Posting heartbeats and harvesting their completions.
//!
//! The message buffer is laid out as `[GRH | payload]`. Sends always read the
//! payload part; UD receives land the 40 byte GRH in front of it, RC receives
//! write the payload part only. One send may be outstanding at a time.

use std::ffi::CStr;
use std::os::fd::BorrowedFd;
use std::time::Duration;
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::poll::poll;

use crate::GRH_SIZE;
use crate::Gid;
use crate::MESSAGE_SIZE;
use crate::clock::monotonic_ns;
use crate::config::CompletionMode;
use crate::config::TransportMode;
use crate::context::RdmaContext;
use crate::context::RdmaError;
use crate::context::WRID_SEND;
use crate::ibverbs_primitives::PeerAddress;

/// A harvested work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// `ibv_wc_status`, `IBV_WC_SUCCESS` (0) on success.
    pub status: u32,
    pub vendor_err: u32,
    pub wr_id: u64,
    pub byte_len: u32,
    /// Remote queue pair of a UD receive.
    pub src_qp: u32,
    pub wc_flags: u32,
    /// Device clock ticks when `hw_timestamp` is set, otherwise
    /// `CLOCK_MONOTONIC` nanoseconds taken at harvest.
    pub timestamp: u64,
    pub hw_timestamp: bool,
}

impl Completion {
    pub fn from_wc(wc: &rdmacore_sys::ibv_wc, timestamp: u64) -> Self {
        let (status, vendor_err) = wc.error().unwrap_or((wc.status(), 0));
        Self {
            status,
            vendor_err,
            wr_id: wc.wr_id(),
            byte_len: wc.len() as u32,
            src_qp: wc.src_qp,
            wc_flags: wc.wc_flags,
            timestamp,
            hw_timestamp: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == rdmacore_sys::ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Whether a UD receive carries a GRH in front of the payload.
    pub fn has_grh(&self) -> bool {
        self.wc_flags & rdmacore_sys::ibv_wc_flags::IBV_WC_GRH.0 != 0
    }

    /// Human-readable status, from `ibv_wc_status_str`.
    pub fn status_str(&self) -> String {
        // SAFETY: ibv_wc_status_str returns a pointer to a static C string.
        unsafe {
            let c_str = rdmacore_sys::ibv_wc_status_str(self.status);
            if c_str.is_null() {
                return format!("status {}", self.status);
            }
            CStr::from_ptr(c_str).to_string_lossy().into_owned()
        }
    }

    /// Turns a failed completion into `RdmaError::WorkCompletion`.
    pub fn into_result(self) -> Result<Self, RdmaError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(RdmaError::WorkCompletion {
                wr_id: self.wr_id,
                status: self.status,
                vendor_err: self.vendor_err,
                reason: self.status_str(),
            })
        }
    }
}

/// Source GID recorded in a GRH (bytes 8..24).
pub fn grh_source_gid(grh: &[u8]) -> Option<Gid> {
    let sgid: [u8; 16] = grh.get(8..24)?.try_into().ok()?;
    Some(Gid::new(sgid))
}

impl RdmaContext {
    fn lkey(&self) -> u32 {
        // SAFETY: `mr` is registered for the lifetime of the context.
        unsafe { (*self.mr).lkey }
    }

    /// Posts `n` receives over the message buffer, each tagged `wr_id`.
    /// Returns how many were posted; fails only if none could be.
    pub fn post_recv(&mut self, n: usize, wr_id: u64) -> Result<usize, RdmaError> {
        let (offset, length) = match self.config.transport {
            TransportMode::Connectionless => (0, GRH_SIZE + MESSAGE_SIZE),
            TransportMode::Connected => (GRH_SIZE, MESSAGE_SIZE),
        };
        let addr = self.buf.as_ptr() as u64 + offset as u64;
        let lkey = self.lkey();

        for posted in 0..n {
            let mut sge = rdmacore_sys::ibv_sge {
                addr,
                length: length as u32,
                lkey,
            };
            let mut wr = rdmacore_sys::ibv_recv_wr {
                wr_id,
                next: std::ptr::null_mut(),
                sg_list: &mut sge as *mut _,
                num_sge: 1,
            };
            let mut bad_wr: *mut rdmacore_sys::ibv_recv_wr = std::ptr::null_mut();
            // SAFETY: `sge` and `wr` live on the stack for the duration of
            // the call; the buffer they point to is registered.
            let errno = unsafe {
                let post_recv = (*self.context)
                    .ops
                    .post_recv
                    .ok_or(RdmaError::MissingVerb("post_recv"))?;
                post_recv(self.qp, &mut wr as *mut _, &mut bad_wr)
            };
            if errno != 0 {
                if posted == 0 {
                    return Err(RdmaError::verbs_errno("post receive", errno));
                }
                tracing::warn!("posted {} of {} receives", posted, n);
                return Ok(posted);
            }
        }
        Ok(n)
    }

    /// Sends `message` (truncated to `MESSAGE_SIZE` bytes, zero padded) to
    /// `dest`.
    ///
    /// Connectionless mode builds an address handle for `dest`; connected
    /// mode requires `dest` to be the connected peer. Fails with
    /// `SendInFlight` until the previous send's completion is harvested.
    pub fn post_send(&mut self, dest: &PeerAddress, message: &[u8]) -> Result<(), RdmaError> {
        if self.send_in_flight {
            return Err(RdmaError::SendInFlight);
        }
        if self.config.transport == TransportMode::Connected
            && self.peer.map(|peer| peer.qpn) != Some(dest.qpn)
        {
            return Err(RdmaError::NotConnected(*dest));
        }

        let len = message.len().min(MESSAGE_SIZE);
        let payload = &mut self.buf[GRH_SIZE..];
        payload[..len].copy_from_slice(&message[..len]);
        payload[len..].fill(0);

        let mut sge = rdmacore_sys::ibv_sge {
            addr: self.buf.as_ptr() as u64 + GRH_SIZE as u64,
            length: MESSAGE_SIZE as u32,
            lkey: self.lkey(),
        };
        let mut wr = rdmacore_sys::ibv_send_wr {
            wr_id: WRID_SEND,
            next: std::ptr::null_mut(),
            sg_list: &mut sge as *mut _,
            num_sge: 1,
            opcode: rdmacore_sys::ibv_wr_opcode::IBV_WR_SEND,
            send_flags: rdmacore_sys::ibv_send_flags::IBV_SEND_SIGNALED.0,
            wr: Default::default(),
            qp_type: Default::default(),
            __bindgen_anon_1: Default::default(),
            __bindgen_anon_2: Default::default(),
        };

        if self.config.transport == TransportMode::Connectionless {
            let ah = self.create_ah(dest)?;
            // SAFETY: `wr.wr` is interpreted as `ud` for UD queue pairs.
            unsafe {
                wr.wr.ud.ah = ah;
                wr.wr.ud.remote_qpn = dest.qpn;
                wr.wr.ud.remote_qkey = self.config.qkey;
            }
            self.ah = ah;
        }

        let mut bad_wr: *mut rdmacore_sys::ibv_send_wr = std::ptr::null_mut();
        // SAFETY: `sge` and `wr` live on the stack for the duration of the
        // call; the address handle stays alive until the send completes.
        let errno = unsafe {
            let post_send = (*self.context)
                .ops
                .post_send
                .ok_or(RdmaError::MissingVerb("post_send"))?;
            post_send(self.qp, &mut wr as *mut _, &mut bad_wr)
        };
        if errno != 0 {
            self.release_ah();
            return Err(RdmaError::verbs_errno("post send", errno));
        }

        self.send_in_flight = true;
        tracing::trace!("posted {} byte heartbeat to {:?}", len, dest);
        Ok(())
    }

    fn create_ah(&mut self, dest: &PeerAddress) -> Result<*mut rdmacore_sys::ibv_ah, RdmaError> {
        self.release_ah();
        let mut ah_attr = rdmacore_sys::ibv_ah_attr {
            is_global: 1,
            sl: self.config.service_level,
            src_path_bits: 0,
            port_num: self.port(),
            ..Default::default()
        };
        ah_attr.grh.dgid = dest.gid.into();
        ah_attr.grh.hop_limit = self.config.hop_limit;
        ah_attr.grh.sgid_index = self.config.gid_index;

        // SAFETY: `pd` is allocated and `ah_attr` is initialized.
        let ah = unsafe { rdmacore_sys::ibv_create_ah(self.pd, &mut ah_attr) };
        if ah.is_null() {
            return Err(RdmaError::verbs("create the address handle"));
        }
        Ok(ah)
    }

    fn release_ah(&mut self) {
        if !self.ah.is_null() {
            // SAFETY: `ah` was created by `create_ah` and no send uses it.
            unsafe {
                rdmacore_sys::ibv_destroy_ah(self.ah);
            }
            self.ah = std::ptr::null_mut();
        }
    }

    /// Polls the completion queue once without blocking.
    ///
    /// A send completion, successful or not, frees the send slot.
    pub fn poll_completion(&mut self) -> Result<Option<Completion>, RdmaError> {
        let completion = if self.cq_ex.is_null() {
            self.poll_cq()?
        } else {
            self.poll_cq_ex()?
        };
        if let Some(completion) = &completion {
            if completion.wr_id == WRID_SEND {
                self.send_in_flight = false;
                self.release_ah();
            }
            if !completion.is_success() {
                tracing::debug!(
                    "work completion {} failed: {}",
                    completion.wr_id,
                    completion.status_str()
                );
                // A failed RC work request moves the queue pair to the error
                // state; the next send to this peer reconnects.
                if self.config.transport == TransportMode::Connected {
                    self.peer = None;
                }
            }
        }
        Ok(completion)
    }

    fn poll_cq(&mut self) -> Result<Option<Completion>, RdmaError> {
        let mut wc = rdmacore_sys::ibv_wc::default();
        // SAFETY: `cq` is live and `wc` has room for one entry.
        let ret = unsafe {
            let poll_cq = (*self.context)
                .ops
                .poll_cq
                .ok_or(RdmaError::MissingVerb("poll_cq"))?;
            poll_cq(self.cq, 1, &mut wc)
        };
        if ret < 0 {
            return Err(RdmaError::verbs("poll the completion queue"));
        }
        if ret == 0 {
            return Ok(None);
        }
        Ok(Some(Completion::from_wc(&wc, monotonic_ns())))
    }

    fn poll_cq_ex(&mut self) -> Result<Option<Completion>, RdmaError> {
        let cq_ex = self.cq_ex;
        // SAFETY: `cq_ex` is a live extended CQ created with completion
        // timestamps and the standard fields. Every read happens between
        // start_poll and end_poll.
        unsafe {
            let start_poll = (*cq_ex)
                .start_poll
                .ok_or(RdmaError::MissingVerb("start_poll"))?;
            let end_poll = (*cq_ex)
                .end_poll
                .ok_or(RdmaError::MissingVerb("end_poll"))?;
            let read_completion_ts = (*cq_ex)
                .read_completion_ts
                .ok_or(RdmaError::MissingVerb("read_completion_ts"))?;
            let read_vendor_err = (*cq_ex)
                .read_vendor_err
                .ok_or(RdmaError::MissingVerb("read_vendor_err"))?;
            let read_byte_len = (*cq_ex)
                .read_byte_len
                .ok_or(RdmaError::MissingVerb("read_byte_len"))?;
            let read_src_qp = (*cq_ex)
                .read_src_qp
                .ok_or(RdmaError::MissingVerb("read_src_qp"))?;
            let read_wc_flags = (*cq_ex)
                .read_wc_flags
                .ok_or(RdmaError::MissingVerb("read_wc_flags"))?;

            let mut attr = rdmacore_sys::ibv_poll_cq_attr::default();
            let ret = start_poll(cq_ex, &mut attr);
            if ret == Errno::ENOENT as i32 {
                return Ok(None);
            }
            if ret != 0 {
                return Err(RdmaError::verbs_errno(
                    "poll the extended completion queue",
                    ret,
                ));
            }

            let completion = Completion {
                status: (*cq_ex).status,
                vendor_err: read_vendor_err(cq_ex),
                wr_id: (*cq_ex).wr_id,
                byte_len: read_byte_len(cq_ex),
                src_qp: read_src_qp(cq_ex),
                wc_flags: read_wc_flags(cq_ex),
                timestamp: read_completion_ts(cq_ex),
                hw_timestamp: true,
            };
            end_poll(cq_ex);
            Ok(Some(completion))
        }
    }

    /// Waits up to `timeout` for a completion.
    ///
    /// Event mode sleeps on the completion channel, acknowledges the event
    /// and re-arms the queue before polling. An event left behind by a
    /// completion that was already harvested only restarts the wait. Poll
    /// mode spins. Returns `None` once `timeout` has passed.
    pub fn wait_completion(&mut self, timeout: Duration) -> Result<Option<Completion>, RdmaError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(completion) = self.poll_completion()? {
                return Ok(Some(completion));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.config.completion {
                CompletionMode::Poll => std::hint::spin_loop(),
                CompletionMode::Event => {
                    self.await_cq_event(remaining)?;
                }
            }
        }
    }

    /// Blocks on the completion channel for at most `timeout`. Returns
    /// whether an event was consumed.
    fn await_cq_event(&mut self, timeout: Duration) -> Result<bool, RdmaError> {
        let millis = u16::try_from(timeout.as_millis().max(1)).unwrap_or(u16::MAX);
        // SAFETY: the channel fd stays open for the lifetime of the context.
        let fd = unsafe { BorrowedFd::borrow_raw((*self.channel).fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(false),
            Ok(_) => {}
            Err(errno) => {
                return Err(RdmaError::verbs_errno(
                    "wait on the completion channel",
                    errno as i32,
                ));
            }
        }

        let mut ev_cq: *mut rdmacore_sys::ibv_cq = std::ptr::null_mut();
        let mut ev_ctx: *mut std::ffi::c_void = std::ptr::null_mut();
        // SAFETY: the channel is readable, so ibv_get_cq_event does not block.
        unsafe {
            if rdmacore_sys::ibv_get_cq_event(self.channel, &mut ev_cq, &mut ev_ctx) != 0 {
                return Err(RdmaError::verbs("get the completion event"));
            }
            rdmacore_sys::ibv_ack_cq_events(ev_cq, 1);
        }
        if ev_cq != self.cq {
            tracing::warn!("completion event for an unknown queue {:p}", ev_cq);
            return Ok(false);
        }
        self.arm_cq(ev_cq)?;
        Ok(true)
    }

    /// Heartbeat payload of the last receive.
    pub fn received_payload(&self) -> &[u8] {
        &self.buf[GRH_SIZE..]
    }

    /// Sender GID of the last UD receive, if the completion reported a GRH.
    pub fn received_source_gid(&self, completion: &Completion) -> Option<Gid> {
        if self.config.transport != TransportMode::Connectionless || !completion.has_grh() {
            return None;
        }
        grh_source_gid(&self.buf[..GRH_SIZE])
    }
}
