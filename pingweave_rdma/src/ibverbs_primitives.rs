/*
 * Portions Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

/*
 * Sections of code adapted from
 * Copyright (c) 2016 Jon Gjengset under MIT License (MIT)
*/

//! Device enumeration and the small value types shared by the context and
//! transport layers.
//!
//! - `RdmaDevice` / `RdmaPort`: what `get_all_devices` reports for each RNIC,
//!   printed at startup for diagnostics.
//! - `PeerAddress`: where a heartbeat goes. QPN and GID, plus the LID for
//!   connected mode.
//! - `Role`: whether a context sends heartbeats or answers them.
use std::ffi::CStr;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::Deserialize;
use serde::Serialize;

use crate::Gid;
use crate::scheduler::TargetEntry;

/// Represents an RDMA device in the system.
///
/// # Examples
///
/// ```no_run
/// use pingweave_rdma::get_all_devices;
///
/// for device in get_all_devices() {
///     println!("{}", device);
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaDevice {
    /// `name` - The name of the RDMA device (e.g., "mlx5_0").
    name: String,
    vendor_id: u32,
    vendor_part_id: u32,
    fw_ver: String,
    node_guid: u64,
    ports: Vec<RdmaPort>,
}

impl RdmaDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn vendor_part_id(&self) -> u32 {
        self.vendor_part_id
    }

    pub fn fw_ver(&self) -> &str {
        &self.fw_ver
    }

    pub fn node_guid(&self) -> u64 {
        self.node_guid
    }

    pub fn ports(&self) -> &[RdmaPort] {
        &self.ports
    }

    /// The first port reporting `IBV_PORT_ACTIVE`, if any.
    pub fn active_port(&self) -> Option<&RdmaPort> {
        self.ports.iter().find(|port| port.is_active())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaPort {
    port_num: u8,
    state: String,
    active: bool,
    physical_state: String,
    lid: u16,
    link_layer: String,
    /// GID at index 0, colon separated.
    gid: String,
    gid_tbl_len: i32,
}

impl RdmaPort {
    pub fn port_num(&self) -> u8 {
        self.port_num
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn lid(&self) -> u16 {
        self.lid
    }

    pub fn link_layer(&self) -> &str {
        &self.link_layer
    }
}

impl fmt::Display for RdmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "\tNumber of ports: {}", self.ports.len())?;
        writeln!(f, "\tFirmware version: {}", self.fw_ver)?;
        writeln!(f, "\tNode GUID: 0x{:016x}", self.node_guid)?;
        writeln!(f, "\tVendor ID: 0x{:x}", self.vendor_id)?;
        writeln!(f, "\tVendor part ID: {}", self.vendor_part_id)?;
        for port in &self.ports {
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

impl fmt::Display for RdmaPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tPort {}:", self.port_num)?;
        writeln!(f, "\t\tState: {}", self.state)?;
        writeln!(f, "\t\tPhysical state: {}", self.physical_state)?;
        writeln!(f, "\t\tLID: {}", self.lid)?;
        writeln!(f, "\t\tLink layer: {}", self.link_layer)?;
        writeln!(f, "\t\tGID: {}", self.gid)?;
        writeln!(f, "\t\tGID table length: {}", self.gid_tbl_len)?;
        Ok(())
    }
}

/// Converts the given port state to a human-readable string.
pub fn get_port_state_str(state: rdmacore_sys::ibv_port_state::Type) -> String {
    // SAFETY: ibv_port_state_str returns a pointer to a static C string.
    unsafe {
        let c_str = rdmacore_sys::ibv_port_state_str(state);
        if c_str.is_null() {
            return "Unknown".to_string();
        }
        CStr::from_ptr(c_str).to_string_lossy().into_owned()
    }
}

/// Converts the given physical state to a human-readable string.
pub fn get_port_phy_state_str(phys_state: u8) -> String {
    match phys_state {
        1 => "Sleep".to_string(),
        2 => "Polling".to_string(),
        3 => "Disabled".to_string(),
        4 => "PortConfigurationTraining".to_string(),
        5 => "LinkUp".to_string(),
        6 => "LinkErrorRecovery".to_string(),
        7 => "PhyTest".to_string(),
        _ => "No state change".to_string(),
    }
}

/// Converts the given link layer type to a human-readable string.
pub fn get_link_layer_str(link_layer: u8) -> String {
    match link_layer {
        1 => "InfiniBand".to_string(),
        2 => "Ethernet".to_string(),
        _ => "Unknown".to_string(),
    }
}

/// Retrieves information about all RDMA devices in the system.
///
/// Devices that cannot be opened or queried are skipped. Returns an empty
/// vector when rdma-core finds no device.
pub fn get_all_devices() -> Vec<RdmaDevice> {
    let mut devices = Vec::new();

    // SAFETY: We are calling several C functions from libibverbs. Every
    // opened context is closed before moving on, and the device list is freed.
    unsafe {
        let mut num_devices = 0;
        let device_list = rdmacore_sys::ibv_get_device_list(&mut num_devices);
        if device_list.is_null() {
            return devices;
        }

        for i in 0..num_devices {
            let device = *device_list.add(i as usize);
            if device.is_null() {
                continue;
            }

            let context = rdmacore_sys::ibv_open_device(device);
            if context.is_null() {
                continue;
            }

            let name = CStr::from_ptr(rdmacore_sys::ibv_get_device_name(device))
                .to_string_lossy()
                .into_owned();

            let mut device_attr = rdmacore_sys::ibv_device_attr::default();
            if rdmacore_sys::ibv_query_device(context, &mut device_attr) != 0 {
                tracing::debug!("failed to query device {}", name);
                rdmacore_sys::ibv_close_device(context);
                continue;
            }

            let fw_ver = CStr::from_ptr(device_attr.fw_ver.as_ptr())
                .to_string_lossy()
                .into_owned();

            let mut rdma_device = RdmaDevice {
                name,
                vendor_id: device_attr.vendor_id,
                vendor_part_id: device_attr.vendor_part_id,
                fw_ver,
                node_guid: device_attr.node_guid,
                ports: Vec::new(),
            };

            for port_num in 1..=device_attr.phys_port_cnt {
                let mut port_attr = rdmacore_sys::ibv_port_attr::default();
                if rdmacore_sys::ibv_query_port(
                    context,
                    port_num,
                    &mut port_attr as *mut rdmacore_sys::ibv_port_attr as *mut _,
                ) != 0
                {
                    continue;
                }

                let mut gid = Gid::default();
                let gid_str =
                    if rdmacore_sys::ibv_query_gid(context, port_num, 0, gid.as_mut()) == 0 {
                        gid.to_string()
                    } else {
                        "N/A".to_string()
                    };

                rdma_device.ports.push(RdmaPort {
                    port_num,
                    state: get_port_state_str(port_attr.state),
                    active: port_attr.state == rdmacore_sys::ibv_port_state::IBV_PORT_ACTIVE,
                    physical_state: get_port_phy_state_str(port_attr.phys_state),
                    lid: port_attr.lid,
                    link_layer: get_link_layer_str(port_attr.link_layer),
                    gid: gid_str,
                    gid_tbl_len: port_attr.gid_tbl_len,
                });
            }

            devices.push(rdma_device);
            rdmacore_sys::ibv_close_device(context);
        }

        rdmacore_sys::ibv_free_device_list(device_list);
    }

    devices
}

/// Cached result of the ibverbs support check.
static IBVERBS_SUPPORTED_CACHE: OnceLock<bool> = OnceLock::new();

/// Whether rdma-core reports at least one device. Cached after the first call.
pub fn ibverbs_supported() -> bool {
    *IBVERBS_SUPPORTED_CACHE.get_or_init(|| {
        // SAFETY: We are calling a C function from libibverbs.
        unsafe {
            let mut num_devices = 0;
            let device_list = rdmacore_sys::ibv_get_device_list(&mut num_devices);
            if !device_list.is_null() {
                rdmacore_sys::ibv_free_device_list(device_list);
            }
            num_devices > 0
        }
    })
}

/// Which side of the heartbeat exchange a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Sends heartbeats; completion queue depth `tx_depth`.
    Sender,
    /// Receives heartbeats; completion queue depth `rx_depth`.
    Receiver,
}

impl Role {
    pub fn is_rx(&self) -> bool {
        matches!(self, Role::Receiver)
    }

    /// The role at the other end of the exchange.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tx" | "sender" => Ok(Role::Sender),
            "rx" | "receiver" => Ok(Role::Receiver),
            other => Err(format!("unknown role {:?}, expected tx or rx", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "tx"),
            Role::Receiver => write!(f, "rx"),
        }
    }
}

/// Addressing needed to reach a peer's queue pair. Comes from the address
/// directory, never from the wire.
#[derive(Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// `qpn` - Queue Pair Number of the remote queue pair.
    pub qpn: u32,
    /// `lid` - Local Identifier, only used in connected mode.
    pub lid: u16,
    /// `gid` - Global Identifier, used for routing across subnets.
    pub gid: Gid,
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PeerAddress {{ qpn: {}, lid: {}, gid: {} }}",
            self.qpn, self.lid, self.gid
        )
    }
}

impl From<&TargetEntry> for PeerAddress {
    fn from(target: &TargetEntry) -> Self {
        Self {
            qpn: target.qpn,
            lid: target.lid,
            gid: target.gid,
        }
    }
}
