/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mapping a local IPv4 address (or interface name) to the RDMA device that
//! exposes it.
//!
//! The agent is configured with the IP it should measure from. The network
//! interface carrying that IP is found with `getifaddrs`, and the RDMA device
//! is the one whose sysfs directory lists that interface under
//! `device/net/<iface>`.

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;

use nix::ifaddrs::getifaddrs;

/// Directory listing every RDMA device, one entry per device.
pub const SYSFS_INFINIBAND: &str = "/sys/class/infiniband";

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("failed to list network interfaces: {0}")]
    Interfaces(#[source] nix::Error),

    #[error("no network interface has address {0}")]
    NoInterface(Ipv4Addr),

    #[error("no RDMA device exposes interface {0}")]
    NoRdmaDevice(String),

    #[error("failed to read {path}: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the local endpoint is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceSelector {
    Ip(Ipv4Addr),
    Name(String),
}

impl fmt::Display for InterfaceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceSelector::Ip(ip) => write!(f, "{}", ip),
            InterfaceSelector::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<Ipv4Addr> for InterfaceSelector {
    fn from(ip: Ipv4Addr) -> Self {
        InterfaceSelector::Ip(ip)
    }
}

/// Returns the name of the interface that carries `ip`.
pub fn interface_for_ip(ip: Ipv4Addr) -> Result<String, DeviceError> {
    let addrs = getifaddrs().map_err(DeviceError::Interfaces)?;
    for ifaddr in addrs {
        let matches = ifaddr
            .address
            .as_ref()
            .and_then(|addr| addr.as_sockaddr_in())
            .is_some_and(|sin| sin.ip() == ip);
        if matches {
            tracing::debug!("address {} is on interface {}", ip, ifaddr.interface_name);
            return Ok(ifaddr.interface_name);
        }
    }
    Err(DeviceError::NoInterface(ip))
}

/// Returns the interface name for `selector`, looking it up by address if
/// needed.
pub fn resolve_interface(selector: &InterfaceSelector) -> Result<String, DeviceError> {
    match selector {
        InterfaceSelector::Ip(ip) => interface_for_ip(*ip),
        InterfaceSelector::Name(name) => Ok(name.clone()),
    }
}

/// Whether the device at `ibdev_path` (e.g. `/sys/class/infiniband/mlx5_0`)
/// is backed by the network interface `iface`.
pub fn exposes_interface(ibdev_path: &Path, iface: &str) -> bool {
    ibdev_path.join("device").join("net").join(iface).exists()
}

/// Scans `sysfs_root` for the RDMA device that exposes `iface`. Devices are
/// visited in name order so that the result is stable.
pub fn rdma_device_for_interface(sysfs_root: &Path, iface: &str) -> Result<String, DeviceError> {
    let entries = fs::read_dir(sysfs_root).map_err(|source| DeviceError::Sysfs {
        path: sysfs_root.to_path_buf(),
        source,
    })?;
    let mut entries: Vec<_> = entries.filter_map(Result::ok).collect();
    entries.sort_by_key(|entry| entry.file_name());

    entries
        .into_iter()
        .find(|entry| exposes_interface(&entry.path(), iface))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .ok_or_else(|| DeviceError::NoRdmaDevice(iface.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_device(root: &Path, device: &str, ifaces: &[&str]) {
        let net = root.join(device).join("device").join("net");
        fs::create_dir_all(&net).unwrap();
        for iface in ifaces {
            fs::create_dir(net.join(iface)).unwrap();
        }
    }

    #[test]
    fn test_rdma_device_for_interface() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "mlx5_1", &["eth1"]);
        fake_device(root.path(), "mlx5_0", &["eth0"]);
        fake_device(root.path(), "rxe0", &[]);

        assert_eq!(
            rdma_device_for_interface(root.path(), "eth0").unwrap(),
            "mlx5_0"
        );
        assert_eq!(
            rdma_device_for_interface(root.path(), "eth1").unwrap(),
            "mlx5_1"
        );
        assert!(matches!(
            rdma_device_for_interface(root.path(), "eth2"),
            Err(DeviceError::NoRdmaDevice(iface)) if iface == "eth2"
        ));
        assert!(exposes_interface(&root.path().join("mlx5_0"), "eth0"));
        assert!(!exposes_interface(&root.path().join("rxe0"), "eth0"));
    }

    #[test]
    fn test_missing_sysfs_root() {
        let root = tempfile::tempdir().unwrap();
        assert!(matches!(
            rdma_device_for_interface(&root.path().join("missing"), "eth0"),
            Err(DeviceError::Sysfs { .. })
        ));
    }

    #[test]
    fn test_loopback_interface() {
        // Every Linux host has 127.0.0.1 on some interface.
        let iface = interface_for_ip(Ipv4Addr::LOCALHOST).unwrap();
        assert!(!iface.is_empty());
        assert_eq!(
            resolve_interface(&InterfaceSelector::Name("eth0".to_string())).unwrap(),
            "eth0"
        );
        // TEST-NET-3, never assigned to a host.
        assert!(matches!(
            interface_for_ip(Ipv4Addr::new(203, 0, 113, 254)),
            Err(DeviceError::NoInterface(_))
        ));
    }
}
