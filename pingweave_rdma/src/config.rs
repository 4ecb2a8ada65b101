/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Agent configuration.
//!
//! An `AgentConfig` is read from a YAML document with `AgentConfig::from_yaml`
//! and then adjusted from `PINGWEAVE_*` environment variables with
//! `AgentConfig::apply_env_overrides`. Every field has a default, so an empty
//! document (or no document at all) yields a working configuration.
//!
//! ```yaml
//! rdma:
//!   gid_index: 3
//!   transport: connectionless
//!   completion: event
//! ipc:
//!   batch_size: 1000
//!   batch_timeout: 100ms
//! scheduler:
//!   ping_budget: 1s
//!   reload_period: 10s
//!   document_dir: /opt/pingweave/download
//! logging:
//!   level: info
//!   directory: /var/log/pingweave
//! ```

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::ipc::IpcOptions;
use crate::scheduler::SchedulerConfig;
use crate::telemetry::LoggingConfig;

/// Errors returned while loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidOverride {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the queue pair addresses its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Unreliable datagram. Any peer is reachable through an address handle
    /// built from its GID and QPN.
    Connectionless,
    /// Reliable connection. The queue pair is bound to one peer (QPN, LID,
    /// GID) when it is connected.
    Connected,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connectionless" | "ud" => Ok(TransportMode::Connectionless),
            "connected" | "rc" => Ok(TransportMode::Connected),
            other => Err(format!("unknown transport mode {}", other)),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Connectionless => write!(f, "connectionless"),
            TransportMode::Connected => write!(f, "connected"),
        }
    }
}

/// How completions are harvested from the completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    /// Block on the completion channel until the CQ is signaled.
    Event,
    /// Spin on the CQ.
    Poll,
}

impl FromStr for CompletionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event" => Ok(CompletionMode::Event),
            "poll" => Ok(CompletionMode::Poll),
            other => Err(format!("unknown completion mode {}", other)),
        }
    }
}

/// Represents ibverbs specific configurations.
///
/// This struct holds the parameters used to set up the transport context:
/// queue depths, addressing, and the way completions are harvested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IbverbsConfig {
    /// `gid_index` - The GID index used for the local address.
    pub gid_index: u8,
    /// `service_level` - Service level of the address handles.
    pub service_level: u8,
    /// `tx_depth` - CQ/send queue depth on the sending role. Kept at 1 so
    /// that a single send is in flight at any time.
    pub tx_depth: u32,
    /// `rx_depth` - CQ/receive queue depth on the receiving role.
    pub rx_depth: u32,
    /// `mtu` - Path MTU in bytes (connected mode only).
    pub mtu: u32,
    /// `qkey` - Q_Key shared by all connectionless peers.
    pub qkey: u32,
    /// `psn` - The packet sequence number. Connected peers must agree on
    /// it since it is not part of the published address.
    pub psn: u32,
    /// `hop_limit` - GRH hop limit for routed traffic.
    pub hop_limit: u8,
    /// `transport` - Connectionless (UD) or connected (RC).
    pub transport: TransportMode,
    /// `completion` - Event driven or polled completions.
    pub completion: CompletionMode,
    /// `hw_timestamps` - Use NIC completion timestamps when the device
    /// supports them.
    pub hw_timestamps: bool,
}

/// Defaults follow the rdma-core ud_pingpong example, with the queue depths
/// tuned for one heartbeat in flight.
impl Default for IbverbsConfig {
    fn default() -> Self {
        Self {
            gid_index: 0,
            service_level: 0,
            tx_depth: 1,
            rx_depth: 10,
            mtu: 1024,
            qkey: 0x1111_1111,
            psn: 0,
            hop_limit: 0xff,
            transport: TransportMode::Connectionless,
            completion: CompletionMode::Event,
            hw_timestamps: true,
        }
    }
}

/// Complete configuration of one agent process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub rdma: IbverbsConfig,
    pub ipc: IpcOptions,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit rather than a mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AgentConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PINGWEAVE_*` environment variables on top of this
    /// configuration.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| env::var(var).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            let value = lookup(var);
            if let Some(value) = &value {
                tracing::info!("config override from environment: {}={}", var, value);
            }
            value
        };

        if let Some(v) = get("PINGWEAVE_GID_INDEX") {
            self.rdma.gid_index = parse_override("PINGWEAVE_GID_INDEX", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_MTU") {
            self.rdma.mtu = parse_override("PINGWEAVE_MTU", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_TRANSPORT") {
            self.rdma.transport = parse_override("PINGWEAVE_TRANSPORT", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_COMPLETION") {
            self.rdma.completion = parse_override("PINGWEAVE_COMPLETION", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_HW_TIMESTAMPS") {
            self.rdma.hw_timestamps = parse_override("PINGWEAVE_HW_TIMESTAMPS", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_BATCH_SIZE") {
            self.ipc.batch_size = parse_override("PINGWEAVE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_BATCH_TIMEOUT") {
            self.ipc.batch_timeout = parse_duration_override("PINGWEAVE_BATCH_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_FLUSH_WAIT_TIMEOUT") {
            self.ipc.flush_wait_timeout =
                parse_duration_override("PINGWEAVE_FLUSH_WAIT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_PING_BUDGET") {
            self.scheduler.ping_budget = parse_duration_override("PINGWEAVE_PING_BUDGET", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_RELOAD_PERIOD") {
            self.scheduler.reload_period =
                parse_duration_override("PINGWEAVE_RELOAD_PERIOD", &v)?;
        }
        if let Some(v) = get("PINGWEAVE_DOCUMENT_DIR") {
            self.scheduler.document_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PINGWEAVE_LOG_DIR") {
            self.logging.directory = Some(PathBuf::from(v));
        }

        self.validate()
    }

    /// Rejects configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipc.batch_size == 0 {
            return Err(ConfigError::Invalid("ipc.batch_size must be at least 1".into()));
        }
        if self.rdma.tx_depth == 0 || self.rdma.rx_depth == 0 {
            return Err(ConfigError::Invalid(
                "rdma.tx_depth and rdma.rx_depth must be at least 1".into(),
            ));
        }
        if self.rdma.psn > 0xff_ffff {
            return Err(ConfigError::Invalid("rdma.psn must fit in 24 bits".into()));
        }
        if self.scheduler.ping_budget.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.ping_budget must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_override<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidOverride {
            var: var.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_duration_override(var: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidOverride {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Serde adapter for durations written as humantime strings ("100ms", "1s").
pub(crate) mod humantime_duration {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use indoc::indoc;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.rdma.tx_depth, 1);
        assert_eq!(config.rdma.rx_depth, 10);
        assert_eq!(config.rdma.gid_index, 0);
        assert_eq!(config.rdma.transport, TransportMode::Connectionless);
        assert_eq!(config.rdma.completion, CompletionMode::Event);
        assert_eq!(config.rdma.psn, 0);
        assert_eq!(config.ipc.batch_size, 1000);
        assert_eq!(config.ipc.batch_timeout, Duration::from_millis(100));
        assert_eq!(config.ipc.poll_interval, Duration::from_micros(500));
        assert_eq!(config.scheduler.idle_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            indoc! {"
                rdma:
                  gid_index: 3
                  transport: connected
                  completion: poll
                  mtu: 4096
                ipc:
                  batch_size: 10
                  batch_timeout: 250ms
                scheduler:
                  ping_budget: 2s
                  document_dir: /tmp/pingweave
                logging:
                  level: debug
            "}
        )
        .unwrap();

        let config = AgentConfig::from_yaml(file.path()).unwrap();
        assert_eq!(config.rdma.gid_index, 3);
        assert_eq!(config.rdma.transport, TransportMode::Connected);
        assert_eq!(config.rdma.completion, CompletionMode::Poll);
        assert_eq!(config.rdma.mtu, 4096);
        // Unset fields keep their defaults.
        assert_eq!(config.rdma.rx_depth, 10);
        assert_eq!(config.ipc.batch_size, 10);
        assert_eq!(config.ipc.batch_timeout, Duration::from_millis(250));
        assert_eq!(config.ipc.poll_interval, Duration::from_micros(500));
        assert_eq!(config.scheduler.ping_budget, Duration::from_secs(2));
        assert_eq!(
            config.scheduler.document_dir,
            PathBuf::from("/tmp/pingweave")
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_from_yaml_empty_and_missing() {
        assert_eq!(
            AgentConfig::from_yaml_str("").unwrap().ipc,
            IpcOptions::default()
        );
        assert!(matches!(
            AgentConfig::from_yaml("/nonexistent/pingweave.yaml"),
            Err(ConfigError::Io { .. })
        ));
        assert!(matches!(
            AgentConfig::from_yaml_str("ipc: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AgentConfig::from_yaml_str("ipc:\n  batch_size: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PINGWEAVE_GID_INDEX", "3"),
            ("PINGWEAVE_TRANSPORT", "rc"),
            ("PINGWEAVE_COMPLETION", "poll"),
            ("PINGWEAVE_BATCH_TIMEOUT", "20ms"),
            ("PINGWEAVE_RELOAD_PERIOD", "1m"),
            ("PINGWEAVE_LOG_DIR", "/tmp/logs"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config
            .apply_overrides(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.rdma.gid_index, 3);
        assert_eq!(config.rdma.transport, TransportMode::Connected);
        assert_eq!(config.rdma.completion, CompletionMode::Poll);
        assert_eq!(config.ipc.batch_timeout, Duration::from_millis(20));
        assert_eq!(config.scheduler.reload_period, Duration::from_secs(60));
        assert_eq!(config.logging.directory, Some(PathBuf::from("/tmp/logs")));
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = AgentConfig::default();
        let err = config
            .apply_overrides(|var| (var == "PINGWEAVE_BATCH_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { ref var, .. } if var == "PINGWEAVE_BATCH_SIZE"));

        let err = config
            .apply_overrides(|var| (var == "PINGWEAVE_PING_BUDGET").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }
}
