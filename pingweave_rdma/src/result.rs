/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Heartbeat payloads and the result lines relayed to the reporter.

use std::fmt;
use std::str::FromStr;

use crate::MESSAGE_SIZE;

/// Payload of one heartbeat datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub ping_id: u64,
    /// Sender timestamp in nanoseconds, taken just before posting.
    pub sent_ns: u64,
}

impl Heartbeat {
    pub const ENCODED_LEN: usize = 16;

    /// Big-endian `ping_id` then `sent_ns`, zero padded to `MESSAGE_SIZE`.
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[..8].copy_from_slice(&self.ping_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sent_ns.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut ping_id = [0u8; 8];
        let mut sent_ns = [0u8; 8];
        ping_id.copy_from_slice(&buf[..8]);
        sent_ns.copy_from_slice(&buf[8..16]);
        Some(Self {
            ping_id: u64::from_be_bytes(ping_id),
            sent_ns: u64::from_be_bytes(sent_ns),
        })
    }
}

/// One measurement, as written to the IPC queue:
/// `"{ip},{ping_id},{status},{timestamp_ns}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingResult {
    /// The peer the heartbeat went to (sender) or came from (receiver).
    pub ip: String,
    pub ping_id: u64,
    /// Work completion status, 0 on success.
    pub status: u32,
    pub timestamp_ns: u64,
}

impl PingResult {
    /// The line written to an IPC slot. Longer lines are cut by the queue.
    pub fn to_message(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.ip, self.ping_id, self.status, self.timestamp_ns
        )
    }
}

impl FromStr for PingResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',');
        let (Some(ip), Some(ping_id), Some(status), Some(timestamp_ns), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(format!("expected 4 fields in {:?}", s));
        };
        Ok(Self {
            ip: ip.to_string(),
            ping_id: ping_id.parse().map_err(|e| format!("ping_id: {}", e))?,
            status: status.parse().map_err(|e| format!("status: {}", e))?,
            timestamp_ns: timestamp_ns
                .parse()
                .map_err(|e| format!("timestamp_ns: {}", e))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_layout() {
        let heartbeat = Heartbeat {
            ping_id: 0x0102,
            sent_ns: 7,
        };
        let buf = heartbeat.encode();
        assert_eq!(&buf[6..8], &[0x01, 0x02]);
        assert_eq!(buf[15], 7);
        assert!(buf[16..].iter().all(|&b| b == 0));
        assert_eq!(Heartbeat::decode(&buf), Some(heartbeat));
        assert_eq!(Heartbeat::decode(&buf[..10]), None);
    }

    #[test]
    fn test_result_line() {
        let result = PingResult {
            ip: "10.0.0.2".to_string(),
            ping_id: 17,
            status: 0,
            timestamp_ns: 1_700_000_000_123_456_789,
        };
        let line = result.to_message();
        assert_eq!(line, "10.0.0.2,17,0,1700000000123456789");
        assert!(line.len() < MESSAGE_SIZE);
        assert_eq!(line.parse::<PingResult>().unwrap(), result);

        assert!("10.0.0.2,17,0".parse::<PingResult>().is_err());
        assert!("10.0.0.2,x,0,1".parse::<PingResult>().is_err());
        assert!("10.0.0.2,1,0,1,extra".parse::<PingResult>().is_err());
    }
}
