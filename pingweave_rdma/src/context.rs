/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Transport context
//!
//! An `RdmaContext` owns every ibverbs resource one role of the agent needs:
//!
//! 1. the device context, opened on the RNIC that carries the configured IP
//! 2. a protection domain and one registered message buffer
//!    (`GRH_SIZE + MESSAGE_SIZE` bytes)
//! 3. a completion channel (event mode only) and a completion queue, extended
//!    with completion timestamps when the device supports them
//! 4. a UD or RC queue pair bound to that completion queue
//!
//! In connectionless mode the queue pair is brought to RTS during `new()`;
//! in connected mode `connect()` drives RESET -> INIT -> RTR -> RTS against a
//! peer. Resources are released in reverse order when the context is dropped,
//! including on a failed `new()`.

use std::ffi::CStr;
use std::fmt;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Local;

use crate::GRH_SIZE;
use crate::Gid;
use crate::MESSAGE_SIZE;
use crate::Mtu;
use crate::config::CompletionMode;
use crate::config::IbverbsConfig;
use crate::config::TransportMode;
use crate::device::DeviceError;
use crate::device::InterfaceSelector;
use crate::device::SYSFS_INFINIBAND;
use crate::device::rdma_device_for_interface;
use crate::device::resolve_interface;
use crate::ibverbs_primitives::PeerAddress;
use crate::ibverbs_primitives::Role;
use crate::ibverbs_primitives::get_link_layer_str;

/// Work request id of every posted receive.
pub const WRID_RECV: u64 = 1;
/// Work request id of every posted send.
pub const WRID_SEND: u64 = 2;

#[derive(thiserror::Error, Debug)]
pub enum RdmaError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("rdma-core does not list device {0}")]
    DeviceNotListed(String),

    #[error("no active port on {0}")]
    NoActivePort(String),

    #[error("failed to {step}: {source}")]
    Verbs {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("provider does not implement {0}")]
    MissingVerb(&'static str),

    #[error("a send is already in flight")]
    SendInFlight,

    #[error("work completion {wr_id} failed: {reason} (status {status}, vendor error {vendor_err})")]
    WorkCompletion {
        wr_id: u64,
        status: u32,
        vendor_err: u32,
        reason: String,
    },

    #[error("connected transport is not connected to {0:?}")]
    NotConnected(PeerAddress),

    #[error("connect() requires the connected transport")]
    Connectionless,

    #[error("failed to publish address to {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RdmaError {
    pub(crate) fn verbs(step: &'static str) -> Self {
        RdmaError::Verbs {
            step,
            source: io::Error::last_os_error(),
        }
    }

    /// For verbs that return the error number instead of setting errno.
    pub(crate) fn verbs_errno(step: &'static str, errno: i32) -> Self {
        RdmaError::Verbs {
            step,
            source: io::Error::from_raw_os_error(errno),
        }
    }
}

/// A ready-to-use transport for one role.
pub struct RdmaContext {
    pub(crate) context: *mut rdmacore_sys::ibv_context,
    pub(crate) channel: *mut rdmacore_sys::ibv_comp_channel,
    pub(crate) pd: *mut rdmacore_sys::ibv_pd,
    pub(crate) mr: *mut rdmacore_sys::ibv_mr,
    /// Null unless completion timestamps are enabled.
    pub(crate) cq_ex: *mut rdmacore_sys::ibv_cq_ex,
    pub(crate) cq: *mut rdmacore_sys::ibv_cq,
    pub(crate) qp: *mut rdmacore_sys::ibv_qp,
    /// Address handle of the send in flight (connectionless mode).
    pub(crate) ah: *mut rdmacore_sys::ibv_ah,
    /// `[GRH | message]`, registered as `mr`. Must outlive `mr`.
    pub(crate) buf: Box<[u8]>,
    pub(crate) send_in_flight: bool,
    pub(crate) peer: Option<PeerAddress>,
    pub(crate) config: IbverbsConfig,
    device_name: String,
    interface: String,
    ip: Option<Ipv4Addr>,
    role: Role,
    port: u8,
    lid: u16,
    link_layer: u8,
    gid: Gid,
    hw_ts_mask: u64,
}

// SAFETY: the ibverbs objects behind the raw pointers may be used and
// destroyed from any thread. The context is never shared, only moved.
unsafe impl Send for RdmaContext {}

impl fmt::Debug for RdmaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaContext")
            .field("device", &self.device_name)
            .field("interface", &self.interface)
            .field("role", &self.role)
            .field("port", &self.port)
            .field("lid", &self.lid)
            .field("gid", &self.gid.to_string())
            .field("qpn", &self.qpn())
            .field("transport", &self.config.transport)
            .field("hw_ts_mask", &format!("0x{:x}", self.hw_ts_mask))
            .finish()
    }
}

impl RdmaContext {
    /// Opens the RNIC behind `selector` and builds every resource of the
    /// context. See the module documentation for the sequence.
    ///
    /// # Errors
    ///
    /// Fails with the step that failed. Nothing is retried, and resources
    /// acquired before the failure are released.
    pub fn new(
        selector: &InterfaceSelector,
        role: Role,
        config: &IbverbsConfig,
    ) -> Result<Self, RdmaError> {
        let interface = resolve_interface(selector)?;
        let ip = match selector {
            InterfaceSelector::Ip(ip) => Some(*ip),
            InterfaceSelector::Name(_) => None,
        };
        tracing::debug!("creating {} context on interface {}", role, interface);

        let mut this = RdmaContext {
            context: std::ptr::null_mut(),
            channel: std::ptr::null_mut(),
            pd: std::ptr::null_mut(),
            mr: std::ptr::null_mut(),
            cq_ex: std::ptr::null_mut(),
            cq: std::ptr::null_mut(),
            qp: std::ptr::null_mut(),
            ah: std::ptr::null_mut(),
            buf: vec![0u8; GRH_SIZE + MESSAGE_SIZE].into_boxed_slice(),
            send_in_flight: false,
            peer: None,
            config: config.clone(),
            device_name: String::new(),
            interface,
            ip,
            role,
            port: 0,
            lid: 0,
            link_layer: 0,
            gid: Gid::default(),
            hw_ts_mask: 0,
        };

        this.open_device()?;
        this.find_active_port()?;
        this.query_gid()?;
        this.query_hw_timestamps();
        this.create_resources()?;
        if this.config.transport == TransportMode::Connectionless {
            this.bring_up_connectionless()?;
        }

        tracing::info!(
            "{} context ready on {} port {} (gid {}, lid {}, qpn {}, {})",
            role,
            this.device_name,
            this.port,
            this.gid,
            this.lid,
            this.qpn(),
            this.config.transport,
        );
        Ok(this)
    }

    /// Opens the device whose sysfs entry lists `self.interface`.
    fn open_device(&mut self) -> Result<(), RdmaError> {
        self.device_name =
            rdma_device_for_interface(Path::new(SYSFS_INFINIBAND), &self.interface)?;

        // SAFETY: the device list is only read while it is alive and is
        // freed on every path. The opened context is owned by `self`.
        unsafe {
            let mut num_devices = 0i32;
            let devices = rdmacore_sys::ibv_get_device_list(&mut num_devices as *mut _);
            if devices.is_null() {
                return Err(RdmaError::verbs("get the device list"));
            }

            let mut device_ptr = std::ptr::null_mut();
            for i in 0..num_devices {
                let dev = *devices.offset(i as isize);
                if dev.is_null() {
                    continue;
                }
                let name = CStr::from_ptr(rdmacore_sys::ibv_get_device_name(dev));
                if name.to_string_lossy() == self.device_name {
                    device_ptr = dev;
                    break;
                }
            }

            if device_ptr.is_null() {
                rdmacore_sys::ibv_free_device_list(devices);
                return Err(RdmaError::DeviceNotListed(self.device_name.clone()));
            }
            tracing::info!(
                "using RDMA device {} for interface {}",
                self.device_name,
                self.interface
            );

            self.context = rdmacore_sys::ibv_open_device(device_ptr);
            let result = if self.context.is_null() {
                Err(RdmaError::verbs("open the device"))
            } else {
                Ok(())
            };
            rdmacore_sys::ibv_free_device_list(devices);
            result
        }
    }

    /// Picks the first port in state `IBV_PORT_ACTIVE`.
    fn find_active_port(&mut self) -> Result<(), RdmaError> {
        // SAFETY: `self.context` is an open device context.
        unsafe {
            let mut device_attr = rdmacore_sys::ibv_device_attr::default();
            if rdmacore_sys::ibv_query_device(self.context, &mut device_attr) != 0 {
                return Err(RdmaError::verbs("query the device"));
            }

            for port_num in 1..=device_attr.phys_port_cnt {
                let mut port_attr = rdmacore_sys::ibv_port_attr::default();
                if rdmacore_sys::ibv_query_port(
                    self.context,
                    port_num,
                    &mut port_attr as *mut rdmacore_sys::ibv_port_attr as *mut _,
                ) != 0
                {
                    return Err(RdmaError::verbs("query the port"));
                }
                if port_attr.state == rdmacore_sys::ibv_port_state::IBV_PORT_ACTIVE {
                    self.port = port_num;
                    self.lid = port_attr.lid;
                    self.link_layer = port_attr.link_layer;
                    tracing::debug!(
                        "{} port {} is active ({})",
                        self.device_name,
                        port_num,
                        get_link_layer_str(port_attr.link_layer)
                    );
                    return Ok(());
                }
            }
        }
        Err(RdmaError::NoActivePort(self.device_name.clone()))
    }

    fn query_gid(&mut self) -> Result<(), RdmaError> {
        // SAFETY: `self.context` is open and `self.port` exists.
        let ret = unsafe {
            rdmacore_sys::ibv_query_gid(
                self.context,
                self.port,
                i32::from(self.config.gid_index),
                self.gid.as_mut(),
            )
        };
        if ret != 0 {
            return Err(RdmaError::verbs("query the gid"));
        }
        Ok(())
    }

    /// Records the completion timestamp mask when the device has one and the
    /// configuration asks for hardware timestamps. A failed query only
    /// disables them.
    fn query_hw_timestamps(&mut self) {
        if !self.config.hw_timestamps {
            return;
        }
        let mut attr = rdmacore_sys::ibv_device_attr_ex::default();
        // SAFETY: `self.context` is open; a null input is accepted.
        let ret = unsafe {
            rdmacore_sys::ibv_query_device_ex(self.context, std::ptr::null(), &mut attr)
        };
        if ret != 0 {
            tracing::warn!(
                "failed to query extended attributes of {}: {}",
                self.device_name,
                io::Error::from_raw_os_error(ret)
            );
            return;
        }
        self.hw_ts_mask = attr.completion_timestamp_mask;
        if self.hw_ts_mask == 0 {
            tracing::info!(
                "{} has no completion timestamps, using host time",
                self.device_name
            );
        }
    }

    fn create_resources(&mut self) -> Result<(), RdmaError> {
        let depth = if self.role.is_rx() {
            self.config.rx_depth
        } else {
            self.config.tx_depth
        };

        // SAFETY: every pointer passed below was created by the preceding
        // step and checked for null; `self.buf` is heap allocated and lives
        // as long as `self.mr`.
        unsafe {
            self.pd = rdmacore_sys::ibv_alloc_pd(self.context);
            if self.pd.is_null() {
                return Err(RdmaError::verbs("allocate the protection domain"));
            }

            let access = rdmacore_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
            self.mr = rdmacore_sys::ibv_reg_mr(
                self.pd,
                self.buf.as_mut_ptr() as *mut std::ffi::c_void,
                self.buf.len(),
                access.0 as i32,
            );
            if self.mr.is_null() {
                return Err(RdmaError::verbs("register the memory region"));
            }

            if self.config.completion == CompletionMode::Event {
                self.channel = rdmacore_sys::ibv_create_comp_channel(self.context);
                if self.channel.is_null() {
                    return Err(RdmaError::verbs("create the completion channel"));
                }
            }

            if self.hw_ts_mask != 0 {
                let mut cq_attr = rdmacore_sys::ibv_cq_init_attr_ex {
                    cqe: depth,
                    cq_context: std::ptr::null_mut(),
                    channel: self.channel,
                    comp_vector: 0,
                    wc_flags: rdmacore_sys::IBV_WC_EX_WITH_COMPLETION_TIMESTAMP as u64
                        | rdmacore_sys::IBV_WC_STANDARD_FLAGS as u64,
                    ..Default::default()
                };
                self.cq_ex = rdmacore_sys::ibv_create_cq_ex(self.context, &mut cq_attr);
                if self.cq_ex.is_null() {
                    return Err(RdmaError::verbs("create the extended completion queue"));
                }
                self.cq = rdmacore_sys::ibv_cq_ex_to_cq(self.cq_ex);
            } else {
                self.cq = rdmacore_sys::ibv_create_cq(
                    self.context,
                    depth as i32,
                    std::ptr::null_mut(),
                    self.channel,
                    0,
                );
                if self.cq.is_null() {
                    return Err(RdmaError::verbs("create the completion queue"));
                }
            }

            if self.config.completion == CompletionMode::Event {
                self.arm_cq(self.cq)?;
            }

            let qp_type = match self.config.transport {
                TransportMode::Connectionless => rdmacore_sys::ibv_qp_type::IBV_QPT_UD,
                TransportMode::Connected => rdmacore_sys::ibv_qp_type::IBV_QPT_RC,
            };
            let mut init_attr = rdmacore_sys::ibv_qp_init_attr {
                send_cq: self.cq,
                recv_cq: self.cq,
                cap: rdmacore_sys::ibv_qp_cap {
                    max_send_wr: self.config.tx_depth,
                    max_recv_wr: self.config.rx_depth,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    max_inline_data: 0,
                },
                qp_type,
                ..Default::default()
            };
            self.qp = rdmacore_sys::ibv_create_qp(self.pd, &mut init_attr);
            if self.qp.is_null() {
                return Err(RdmaError::verbs("create the queue pair"));
            }
        }
        Ok(())
    }

    /// Requests a completion event for the next completion on `cq`.
    pub(crate) fn arm_cq(&self, cq: *mut rdmacore_sys::ibv_cq) -> Result<(), RdmaError> {
        // SAFETY: `self.context` is open and `cq` belongs to it.
        unsafe {
            let req_notify_cq = (*self.context)
                .ops
                .req_notify_cq
                .ok_or(RdmaError::MissingVerb("req_notify_cq"))?;
            let errno = req_notify_cq(cq, 0);
            if errno != 0 {
                return Err(RdmaError::verbs_errno("arm the completion queue", errno));
            }
        }
        Ok(())
    }

    fn modify_qp(
        &mut self,
        attr: &mut rdmacore_sys::ibv_qp_attr,
        mask: rdmacore_sys::ibv_qp_attr_mask,
        step: &'static str,
    ) -> Result<(), RdmaError> {
        // SAFETY: `self.qp` is a live queue pair and `attr` is initialized.
        let errno = unsafe { rdmacore_sys::ibv_modify_qp(self.qp, attr, mask.0 as i32) };
        if errno != 0 {
            return Err(RdmaError::verbs_errno(step, errno));
        }
        Ok(())
    }

    /// RESET -> INIT -> RTR -> RTS for a UD queue pair. No peer is involved:
    /// every send carries its own address handle.
    fn bring_up_connectionless(&mut self) -> Result<(), RdmaError> {
        let mut attr = rdmacore_sys::ibv_qp_attr {
            qp_state: rdmacore_sys::ibv_qp_state::IBV_QPS_INIT,
            pkey_index: 0,
            port_num: self.port,
            qkey: self.config.qkey,
            ..Default::default()
        };
        let mask = rdmacore_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_PORT
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_QKEY;
        self.modify_qp(&mut attr, mask, "transition QP to INIT")?;

        let mut attr = rdmacore_sys::ibv_qp_attr {
            qp_state: rdmacore_sys::ibv_qp_state::IBV_QPS_RTR,
            ..Default::default()
        };
        self.modify_qp(
            &mut attr,
            rdmacore_sys::ibv_qp_attr_mask::IBV_QP_STATE,
            "transition QP to RTR",
        )?;

        let mut attr = rdmacore_sys::ibv_qp_attr {
            qp_state: rdmacore_sys::ibv_qp_state::IBV_QPS_RTS,
            sq_psn: self.config.psn,
            ..Default::default()
        };
        let mask = rdmacore_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_SQ_PSN;
        self.modify_qp(&mut attr, mask, "transition QP to RTS")
    }

    /// Connects an RC queue pair to `peer`.
    ///
    /// The queue pair is reset first, so this may be called again to switch
    /// peers. Both ends use the configured `psn` as their initial sequence
    /// number.
    pub fn connect(&mut self, peer: &PeerAddress) -> Result<(), RdmaError> {
        if self.config.transport != TransportMode::Connected {
            return Err(RdmaError::Connectionless);
        }
        self.peer = None;
        self.send_in_flight = false;

        let mut attr = rdmacore_sys::ibv_qp_attr {
            qp_state: rdmacore_sys::ibv_qp_state::IBV_QPS_RESET,
            ..Default::default()
        };
        self.modify_qp(
            &mut attr,
            rdmacore_sys::ibv_qp_attr_mask::IBV_QP_STATE,
            "reset QP",
        )?;

        let access = rdmacore_sys::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
        let mut attr = rdmacore_sys::ibv_qp_attr {
            qp_state: rdmacore_sys::ibv_qp_state::IBV_QPS_INIT,
            qp_access_flags: access.0,
            pkey_index: 0,
            port_num: self.port,
            ..Default::default()
        };
        let mask = rdmacore_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_PORT
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        self.modify_qp(&mut attr, mask, "transition QP to INIT")?;

        let mut attr = rdmacore_sys::ibv_qp_attr {
            qp_state: rdmacore_sys::ibv_qp_state::IBV_QPS_RTR,
            path_mtu: Mtu::from_bytes(self.config.mtu).into(),
            dest_qp_num: peer.qpn,
            rq_psn: self.config.psn,
            max_dest_rd_atomic: 1,
            min_rnr_timer: 12,
            ah_attr: rdmacore_sys::ibv_ah_attr {
                dlid: peer.lid,
                sl: self.config.service_level,
                src_path_bits: 0,
                is_global: 1,
                port_num: self.port,
                ..Default::default()
            },
            ..Default::default()
        };
        attr.ah_attr.grh.dgid = peer.gid.into();
        attr.ah_attr.grh.hop_limit = self.config.hop_limit;
        attr.ah_attr.grh.sgid_index = self.config.gid_index;
        let mask = rdmacore_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_AV
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify_qp(&mut attr, mask, "transition QP to RTR")?;

        let mut attr = rdmacore_sys::ibv_qp_attr {
            qp_state: rdmacore_sys::ibv_qp_state::IBV_QPS_RTS,
            sq_psn: self.config.psn,
            max_rd_atomic: 1,
            retry_cnt: 7,
            rnr_retry: 7,
            timeout: 14,
            ..Default::default()
        };
        let mask = rdmacore_sys::ibv_qp_attr_mask::IBV_QP_STATE
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | rdmacore_sys::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        self.modify_qp(&mut attr, mask, "transition QP to RTS")?;

        tracing::debug!("connected qpn {} to {:?}", self.qpn(), peer);
        self.peer = Some(*peer);
        Ok(())
    }

    /// Writes this context's address to `<upload_dir>/<key>` for the sync
    /// process to upload, keyed by [`address_key`]. Returns the path written.
    pub fn publish_address(&self, upload_dir: &Path) -> Result<PathBuf, RdmaError> {
        let path = upload_dir.join(address_key(&self.local_name(), self.role));
        let contents = format_address_file(&self.gid, self.lid, self.qpn(), Local::now());
        fs::create_dir_all(upload_dir)
            .and_then(|()| fs::write(&path, contents))
            .map_err(|source| RdmaError::Publish {
                path: path.clone(),
                source,
            })?;
        tracing::info!("published {} address to {}", self.role, path.display());
        Ok(path)
    }

    /// The configured IP, or the interface name when none was given.
    pub fn local_name(&self) -> String {
        match self.ip {
            Some(ip) => ip.to_string(),
            None => self.interface.clone(),
        }
    }

    pub fn qpn(&self) -> u32 {
        if self.qp.is_null() {
            return 0;
        }
        // SAFETY: non-null `qp` points to a live queue pair.
        unsafe { (*self.qp).qp_num }
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// The local GID in its 32 hex character wire form.
    pub fn wire_gid(&self) -> String {
        self.gid.to_wire()
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn link_layer(&self) -> String {
        get_link_layer_str(self.link_layer)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> TransportMode {
        self.config.transport
    }

    pub fn config(&self) -> &IbverbsConfig {
        &self.config
    }

    /// Peer of a connected queue pair.
    pub fn peer(&self) -> Option<&PeerAddress> {
        self.peer.as_ref()
    }

    /// Non-zero when completions carry hardware timestamps.
    pub fn hw_timestamp_mask(&self) -> u64 {
        self.hw_ts_mask
    }

    pub fn has_hw_timestamps(&self) -> bool {
        !self.cq_ex.is_null()
    }
}

impl Drop for RdmaContext {
    fn drop(&mut self) {
        // SAFETY: each pointer is either null or a live object created by
        // this context; they are destroyed in reverse order of creation.
        unsafe {
            if !self.ah.is_null() {
                rdmacore_sys::ibv_destroy_ah(self.ah);
            }
            if !self.qp.is_null() {
                rdmacore_sys::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                rdmacore_sys::ibv_destroy_cq(self.cq);
            }
            if !self.channel.is_null() {
                rdmacore_sys::ibv_destroy_comp_channel(self.channel);
            }
            if !self.mr.is_null() {
                rdmacore_sys::ibv_dereg_mr(self.mr);
            }
            if !self.pd.is_null() {
                rdmacore_sys::ibv_dealloc_pd(self.pd);
            }
            if !self.context.is_null() {
                rdmacore_sys::ibv_close_device(self.context);
            }
        }
        tracing::debug!("released {} context on {}", self.role, self.interface);
    }
}

/// Address store key of the queue pair `role` runs on `host`.
///
/// Receivers are published under the bare IP, which is what ping groups
/// list. Connected-mode senders are published as `<ip>_tx`, so a receiver can
/// bind its queue pair to the sender's; that key is never a group member.
pub fn address_key(host: &str, role: Role) -> String {
    match role {
        Role::Receiver => host.to_string(),
        Role::Sender => format!("{}_tx", host),
    }
}

/// Contents of an address file: wire GID, LID, QPN and the local time of
/// publication, one per line.
pub fn format_address_file(gid: &Gid, lid: u16, qpn: u32, now: DateTime<Local>) -> String {
    format!(
        "{}\n{}\n{}\n{}\n",
        gid.to_wire(),
        lid,
        qpn,
        now.format("%Y-%m-%d %H:%M:%S")
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::test_utils::first_interface;

    #[test]
    fn test_format_address_file() {
        let gid = Gid::from_wire("fe800000000000000202c9fffe0a0b0c").unwrap();
        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        let contents = format_address_file(&gid, 3, 0x1234, now);
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                "fe800000000000000202c9fffe0a0b0c",
                "3",
                "4660",
                "2024-05-01 12:30:05"
            ]
        );
    }

    #[test]
    fn test_address_key() {
        assert_eq!(address_key("10.0.0.1", Role::Receiver), "10.0.0.1");
        assert_eq!(address_key("10.0.0.1", Role::Sender), "10.0.0.1_tx");
    }

    #[test]
    fn test_missing_interface() {
        let selector = InterfaceSelector::Name("pingweave-none0".to_string());
        let result = RdmaContext::new(&selector, Role::Sender, &IbverbsConfig::default());
        // Either no sysfs tree at all, or no device exposes the interface.
        assert!(matches!(
            result,
            Err(RdmaError::Device(DeviceError::NoRdmaDevice(_)))
                | Err(RdmaError::Device(DeviceError::Sysfs { .. }))
        ));
    }

    #[test]
    fn test_create_context() {
        let Some(iface) = first_interface() else {
            println!("Skipping test: RDMA devices not available");
            return;
        };
        let selector = InterfaceSelector::Name(iface);
        let config = IbverbsConfig {
            completion: CompletionMode::Poll,
            ..Default::default()
        };
        let ctx = RdmaContext::new(&selector, Role::Receiver, &config).unwrap();
        assert!(ctx.qpn() > 0);
        assert!(ctx.port() >= 1);
        assert_eq!(ctx.wire_gid().len(), 32);

        let dir = tempfile::tempdir().unwrap();
        let path = ctx.publish_address(dir.path()).unwrap();
        let contents = fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 4);
        assert_eq!(contents.lines().next().unwrap(), ctx.wire_gid());
    }

    #[test]
    fn test_connect_requires_connected_mode() {
        let Some(iface) = first_interface() else {
            println!("Skipping test: RDMA devices not available");
            return;
        };
        let selector = InterfaceSelector::Name(iface);
        let mut ctx = RdmaContext::new(&selector, Role::Sender, &IbverbsConfig::default()).unwrap();
        assert!(matches!(
            ctx.connect(&PeerAddress::default()),
            Err(RdmaError::Connectionless)
        ));
    }
}
