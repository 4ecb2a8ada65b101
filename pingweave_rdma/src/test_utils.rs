/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fs;
use std::path::Path;

use crate::device::SYSFS_INFINIBAND;
use crate::ibverbs_primitives::get_all_devices;

/// Name of a network interface backed by an RDMA device with an active port,
/// or `None` on hosts without one. Tests that need hardware skip on `None`.
pub fn first_interface() -> Option<String> {
    for device in get_all_devices() {
        if device.active_port().is_none() {
            continue;
        }
        let net = Path::new(SYSFS_INFINIBAND)
            .join(device.name())
            .join("device")
            .join("net");
        let Ok(entries) = fs::read_dir(net) else {
            continue;
        };
        if let Some(entry) = entries.filter_map(Result::ok).next() {
            return Some(entry.file_name().to_string_lossy().into_owned());
        }
    }
    None
}
