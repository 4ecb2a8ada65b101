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

//! Addressing primitives shared by the transport and the scheduler.
//!
//! - `Gid`: a 128-bit port address. Peers exchange it out of band in its
//!   32-character hex "wire" form (see `Gid::to_wire`), and it is printed in
//!   the colon separated form used by `ibv_devinfo`.
//! - `Mtu`: the enumerated path MTU negotiated on a port.

use std::fmt;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Length of a GID in its wire form.
pub const GID_WIRE_LEN: usize = 32;

/// Errors returned when decoding a wire GID.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GidParseError {
    #[error("wire gid must be 32 hex characters, got {0}")]
    WrongLength(usize),

    #[error("invalid hex digit {digit:?} at position {position}")]
    InvalidHex { position: usize, digit: char },
}

#[derive(
    Default,
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize
)]
#[repr(transparent)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    pub fn new(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.raw
    }

    /// The IPv4 address of a RoCE v2 GID (`::ffff:a.b.c.d`), if it is one.
    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        Ipv6Addr::from(self.raw).to_ipv4_mapped()
    }

    /// Encodes the GID as 32 lowercase hex characters, one pair per byte in
    /// network order.
    pub fn to_wire(&self) -> String {
        let mut wire = String::with_capacity(GID_WIRE_LEN);
        for byte in &self.raw {
            wire.push(hex_digit(byte >> 4));
            wire.push(hex_digit(byte & 0x0f));
        }
        wire
    }

    /// Decodes a GID from its wire form. Upper and lower case digits are both
    /// accepted.
    pub fn from_wire(wire: &str) -> Result<Self, GidParseError> {
        let bytes = wire.as_bytes();
        if bytes.len() != GID_WIRE_LEN {
            return Err(GidParseError::WrongLength(wire.chars().count()));
        }

        let mut raw = [0u8; 16];
        for (i, pair) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_value(pair[0]).ok_or(GidParseError::InvalidHex {
                position: 2 * i,
                digit: pair[0] as char,
            })?;
            let lo = hex_value(pair[1]).ok_or(GidParseError::InvalidHex {
                position: 2 * i + 1,
                digit: pair[1] as char,
            })?;
            raw[i] = (hi << 4) | lo;
        }
        Ok(Self { raw })
    }
}

fn hex_digit(nibble: u8) -> char {
    char::from_digit(u32::from(nibble), 16).unwrap_or('0')
}

fn hex_value(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

impl FromStr for Gid {
    type Err = GidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Gid::from_wire(s)
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Self { raw }
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_gid(&self.raw))
    }
}

#[cfg(feature = "rdma")]
impl From<rdmacore_sys::ibv_gid> for Gid {
    fn from(gid: rdmacore_sys::ibv_gid) -> Self {
        Self {
            raw: unsafe { gid.raw },
        }
    }
}

#[cfg(feature = "rdma")]
impl From<Gid> for rdmacore_sys::ibv_gid {
    fn from(mut gid: Gid) -> Self {
        *gid.as_mut()
    }
}

#[cfg(feature = "rdma")]
impl AsRef<rdmacore_sys::ibv_gid> for Gid {
    fn as_ref(&self) -> &rdmacore_sys::ibv_gid {
        // SAFETY: ibv_gid is a 16 byte union with the same layout as `raw`.
        unsafe { &*self.raw.as_ptr().cast::<rdmacore_sys::ibv_gid>() }
    }
}

#[cfg(feature = "rdma")]
impl AsMut<rdmacore_sys::ibv_gid> for Gid {
    fn as_mut(&mut self) -> &mut rdmacore_sys::ibv_gid {
        // SAFETY: ibv_gid is a 16 byte union with the same layout as `raw`.
        unsafe { &mut *self.raw.as_mut_ptr().cast::<rdmacore_sys::ibv_gid>() }
    }
}

/// Formats a GID (Global Identifier) into a human-readable string.
///
/// # Arguments
///
/// * `gid` - A reference to a 16-byte array representing the GID.
///
/// # Returns
///
/// A formatted string representation of the GID.
pub fn format_gid(gid: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}",
        gid[0],
        gid[1],
        gid[2],
        gid[3],
        gid[4],
        gid[5],
        gid[6],
        gid[7],
        gid[8],
        gid[9],
        gid[10],
        gid[11],
        gid[12],
        gid[13],
        gid[14],
        gid[15]
    )
}

/// Path MTU of a port, as enumerated by the verbs API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    /// Used for byte counts that do not name a valid MTU. Matches the
    /// default of the rdma-core pingpong examples.
    pub const DEFAULT: Mtu = Mtu::Mtu1024;

    /// Maps a raw byte count to its MTU. Unrecognized values fall back to
    /// `Mtu::DEFAULT`.
    pub fn from_bytes(bytes: u32) -> Self {
        match bytes {
            256 => Mtu::Mtu256,
            512 => Mtu::Mtu512,
            1024 => Mtu::Mtu1024,
            2048 => Mtu::Mtu2048,
            4096 => Mtu::Mtu4096,
            other => {
                tracing::warn!(
                    "unrecognized mtu {}, falling back to {}",
                    other,
                    Mtu::DEFAULT.bytes()
                );
                Mtu::DEFAULT
            }
        }
    }

    pub fn bytes(&self) -> u32 {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }

    /// The `enum ibv_mtu` code (1 for 256 bytes through 5 for 4096 bytes).
    pub fn code(&self) -> u32 {
        match self {
            Mtu::Mtu256 => 1,
            Mtu::Mtu512 => 2,
            Mtu::Mtu1024 => 3,
            Mtu::Mtu2048 => 4,
            Mtu::Mtu4096 => 5,
        }
    }
}

impl Default for Mtu {
    fn default() -> Self {
        Mtu::DEFAULT
    }
}

#[cfg(feature = "rdma")]
impl From<Mtu> for rdmacore_sys::ibv_mtu {
    fn from(mtu: Mtu) -> Self {
        mtu.code()
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let mut rng = rand::thread_rng();
        for _ in 0..256 {
            let mut raw = [0u8; 16];
            rng.fill_bytes(&mut raw);
            let gid = Gid::new(raw);
            let wire = gid.to_wire();
            assert_eq!(wire.len(), GID_WIRE_LEN);
            assert_eq!(Gid::from_wire(&wire).unwrap(), gid);
        }
    }

    #[test]
    fn test_wire_format() {
        let gid = Gid::new([
            0xfe, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0a, 0xc0, 0xeb, 0xff, 0xfe, 0x01,
            0x02, 0x03,
        ]);
        assert_eq!(gid.to_wire(), "fe800000000000000ac0ebfffe010203");
        assert_eq!(
            Gid::from_wire("FE800000000000000AC0EBFFFE010203").unwrap(),
            gid
        );
    }

    #[test]
    fn test_wire_rejects_malformed() {
        assert_eq!(Gid::from_wire("abcd"), Err(GidParseError::WrongLength(4)));
        assert_eq!(
            Gid::from_wire("fe80000000000000000000000000000g"),
            Err(GidParseError::InvalidHex {
                position: 31,
                digit: 'g'
            })
        );
        assert!("zz800000000000000ac0ebfffe010203".parse::<Gid>().is_err());
    }

    #[test]
    fn test_ipv4_mapped() {
        let gid = Gid::from_wire("00000000000000000000ffff0a000102").unwrap();
        assert_eq!(gid.to_ipv4(), Some(Ipv4Addr::new(10, 0, 1, 2)));
        let link_local = Gid::from_wire("fe800000000000000202c9fffe0a0b0c").unwrap();
        assert_eq!(link_local.to_ipv4(), None);
    }

    #[test]
    fn test_format_gid() {
        let gid = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];

        let formatted = format_gid(&gid);
        assert_eq!(formatted, "1234:5678:9abc:def0:1122:3344:5566:7788");
        assert_eq!(Gid::new(gid).to_string(), formatted);
    }

    #[test]
    fn test_mtu_from_bytes() {
        assert_eq!(Mtu::from_bytes(256), Mtu::Mtu256);
        assert_eq!(Mtu::from_bytes(512), Mtu::Mtu512);
        assert_eq!(Mtu::from_bytes(1024), Mtu::Mtu1024);
        assert_eq!(Mtu::from_bytes(2048), Mtu::Mtu2048);
        assert_eq!(Mtu::from_bytes(4096), Mtu::Mtu4096);
        assert_eq!(Mtu::from_bytes(1500), Mtu::DEFAULT);
        assert_eq!(Mtu::from_bytes(0), Mtu::DEFAULT);
        assert_eq!(Mtu::Mtu4096.code(), 5);
        assert_eq!(Mtu::Mtu256.code(), 1);
    }

    #[cfg(feature = "rdma")]
    #[test]
    fn test_mtu_matches_verbs() {
        let codes: Vec<rdmacore_sys::ibv_mtu> = [256, 512, 1024, 2048, 4096]
            .into_iter()
            .map(|bytes| Mtu::from_bytes(bytes).into())
            .collect();
        assert_eq!(
            codes,
            vec![
                rdmacore_sys::IBV_MTU_256,
                rdmacore_sys::IBV_MTU_512,
                rdmacore_sys::IBV_MTU_1024,
                rdmacore_sys::IBV_MTU_2048,
                rdmacore_sys::IBV_MTU_4096,
            ]
        );
    }
}
