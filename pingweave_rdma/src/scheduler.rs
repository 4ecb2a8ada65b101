/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Decides which peer to ping, and when.
//!
//! The scheduler keeps the aggregate ping rate constant: with a pacing budget
//! `P` and `N` targets, consecutive dispatches are at least `P / N` apart, so
//! every target is pinged once per budget period, in round robin order. The
//! target list is rebuilt from a [`TargetSource`] every `reload_period`; a
//! source that fails to load leaves the scheduler with no targets rather
//! than stale ones.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use crate::Gid;
use crate::clock::Clock;
use crate::clock::RealClock;

/// Errors returned when loading the target documents.
#[derive(thiserror::Error, Debug)]
pub enum TargetLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("malformed entry {key:?} in {document}: {reason}")]
    MalformedEntry {
        document: &'static str,
        key: String,
        reason: String,
    },
}

/// Resolved address of a peer: `[gid, lid, qpn]` in the address directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub gid: Gid,
    pub lid: u16,
    pub qpn: u32,
}

/// The two documents a reload is built from, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDocuments {
    /// Group name to member IPs.
    pub groups: Vec<(String, Vec<String>)>,
    /// Peer IP to its resolved address.
    pub addresses: Vec<(String, AddressRecord)>,
}

/// A peer that can be pinged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
    pub ip: String,
    pub gid: Gid,
    pub lid: u16,
    pub qpn: u32,
}

/// Supplies the documents the target list is built from.
pub trait TargetSource {
    fn load(&self) -> Result<TargetDocuments, TargetLoadError>;
}

impl<F> TargetSource for F
where
    F: Fn() -> Result<TargetDocuments, TargetLoadError>,
{
    fn load(&self) -> Result<TargetDocuments, TargetLoadError> {
        self()
    }
}

/// Reads `pinglist.yaml` and `address_store.yaml` from a directory kept up
/// to date by the controller sync process.
///
/// ```yaml
/// # pinglist.yaml
/// rdma:
///   rack1: [10.0.0.1, 10.0.0.2]
///   rack2: [10.0.0.3]
///
/// # address_store.yaml
/// 10.0.0.1: [fe800000000000000ac0ebfffe010203, 0, 1234]
/// 10.0.0.2: [fe800000000000000ac0ebfffe010204, 0, 5678]
/// ```
#[derive(Debug, Clone)]
pub struct YamlTargetSource {
    dir: PathBuf,
}

impl YamlTargetSource {
    pub const PINGLIST: &'static str = "pinglist.yaml";
    pub const ADDRESS_STORE: &'static str = "address_store.yaml";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_mapping(path: &Path) -> Result<serde_yaml::Mapping, TargetLoadError> {
        let contents = fs::read_to_string(path).map_err(|source| TargetLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(serde_yaml::Mapping::new());
        }
        serde_yaml::from_str(&contents).map_err(|source| TargetLoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse_groups(
        pinglist: &serde_yaml::Mapping,
    ) -> Result<Vec<(String, Vec<String>)>, TargetLoadError> {
        let malformed = |key: String, reason: &str| TargetLoadError::MalformedEntry {
            document: Self::PINGLIST,
            key,
            reason: reason.to_string(),
        };

        let Some(rdma) = pinglist.get("rdma") else {
            return Ok(Vec::new());
        };
        if rdma.is_null() {
            return Ok(Vec::new());
        }
        let rdma = rdma
            .as_mapping()
            .ok_or_else(|| malformed("rdma".to_string(), "expected a mapping of groups"))?;

        let mut groups = Vec::with_capacity(rdma.len());
        for (name, members) in rdma {
            let name = yaml_key(name);
            let members: Vec<String> = serde_yaml::from_value(members.clone())
                .map_err(|e| malformed(name.clone(), &e.to_string()))?;
            groups.push((name, members));
        }
        Ok(groups)
    }

    fn parse_addresses(
        store: &serde_yaml::Mapping,
    ) -> Result<Vec<(String, AddressRecord)>, TargetLoadError> {
        let malformed = |key: &str, reason: String| TargetLoadError::MalformedEntry {
            document: Self::ADDRESS_STORE,
            key: key.to_string(),
            reason,
        };

        let mut addresses = Vec::with_capacity(store.len());
        for (ip, record) in store {
            let ip = yaml_key(ip);
            let (gid, lid, qpn): (String, u32, u32) = serde_yaml::from_value(record.clone())
                .map_err(|e| malformed(&ip, e.to_string()))?;
            let gid = Gid::from_wire(&gid).map_err(|e| malformed(&ip, e.to_string()))?;
            let lid = u16::try_from(lid).map_err(|e| malformed(&ip, e.to_string()))?;
            addresses.push((ip, AddressRecord { gid, lid, qpn }));
        }
        Ok(addresses)
    }
}

fn yaml_key(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

impl TargetSource for YamlTargetSource {
    fn load(&self) -> Result<TargetDocuments, TargetLoadError> {
        let pinglist = Self::read_mapping(&self.dir.join(Self::PINGLIST))?;
        let store = Self::read_mapping(&self.dir.join(Self::ADDRESS_STORE))?;
        Ok(TargetDocuments {
            groups: Self::parse_groups(&pinglist)?,
            addresses: Self::parse_addresses(&store)?,
        })
    }
}

/// Pacing and reload settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Time in which every target is pinged once.
    #[serde(with = "crate::config::humantime_duration")]
    pub ping_budget: Duration,
    /// Dispatch interval when there is nothing to ping.
    #[serde(with = "crate::config::humantime_duration")]
    pub idle_interval: Duration,
    /// How often the target documents are reloaded.
    #[serde(with = "crate::config::humantime_duration")]
    pub reload_period: Duration,
    /// Directory holding `pinglist.yaml` and `address_store.yaml`.
    pub document_dir: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ping_budget: Duration::from_secs(1),
            idle_interval: Duration::from_secs(1),
            reload_period: Duration::from_secs(10),
            document_dir: PathBuf::from("download"),
        }
    }
}

/// Builds the target list of `self_ip`: every address-directory entry whose
/// IP shares at least one group with `self_ip`, in address-directory order.
/// `self_ip` itself is kept when it has an address.
pub fn build_targets(self_ip: &str, documents: &TargetDocuments) -> Vec<TargetEntry> {
    let relevant: HashSet<&str> = documents
        .groups
        .iter()
        .filter(|(_, members)| members.iter().any(|ip| ip == self_ip))
        .flat_map(|(_, members)| members.iter().map(String::as_str))
        .collect();

    documents
        .addresses
        .iter()
        .filter(|(ip, _)| relevant.contains(ip.as_str()))
        .map(|(ip, record)| TargetEntry {
            ip: ip.clone(),
            gid: record.gid,
            lid: record.lid,
            qpn: record.qpn,
        })
        .collect()
}

/// Round robin ping scheduler.
pub struct PingScheduler<S, C = RealClock> {
    self_ip: String,
    source: S,
    clock: C,
    config: SchedulerConfig,
    targets: Vec<TargetEntry>,
    index: usize,
    interval: Duration,
    last_dispatch: Option<Instant>,
    last_reload: Option<Instant>,
}

impl<S: TargetSource> PingScheduler<S, RealClock> {
    pub fn new(self_ip: impl Into<String>, source: S, config: SchedulerConfig) -> Self {
        Self::with_clock(self_ip, source, config, RealClock)
    }
}

impl<S: TargetSource, C: Clock> PingScheduler<S, C> {
    pub fn with_clock(
        self_ip: impl Into<String>,
        source: S,
        config: SchedulerConfig,
        clock: C,
    ) -> Self {
        let interval = config.idle_interval;
        Self {
            self_ip: self_ip.into(),
            source,
            clock,
            config,
            targets: Vec::new(),
            index: 0,
            interval,
            last_dispatch: None,
            last_reload: None,
        }
    }

    /// Returns the target to ping now, if any.
    ///
    /// Reloads the target list first when the reload period has elapsed (or
    /// on the first call). A target is due when at least `interval()` has
    /// passed since the previous dispatch.
    pub fn next(&mut self) -> Option<TargetEntry> {
        let now = self.clock.now();

        let reload_due = self
            .last_reload
            .map_or(true, |t| now.duration_since(t) >= self.config.reload_period);
        if reload_due {
            self.reload();
            self.last_reload = Some(now);
        }

        let dispatch_due = self
            .last_dispatch
            .map_or(true, |t| now.duration_since(t) >= self.interval);
        if !dispatch_due {
            return None;
        }
        self.last_dispatch = Some(now);

        if self.targets.is_empty() {
            return None;
        }
        let target = self.targets[self.index % self.targets.len()].clone();
        self.index = (self.index + 1) % self.targets.len();
        Some(target)
    }

    /// Rebuilds the target list and resets the rotation. On failure the list
    /// is cleared.
    pub fn reload(&mut self) {
        self.index = 0;
        match self.source.load() {
            Ok(documents) => {
                self.targets = build_targets(&self.self_ip, &documents);
                tracing::debug!(
                    "loaded {} relevant addresses for {}",
                    self.targets.len(),
                    self.self_ip
                );
            }
            Err(e) => {
                tracing::error!("failed to load targets: {}", e);
                self.targets.clear();
            }
        }

        self.interval = if self.targets.is_empty() {
            self.config.idle_interval
        } else {
            self.config.ping_budget / self.targets.len() as u32
        };
        tracing::debug!("interval between pings: {:?}", self.interval);
    }

    /// Time until `next` may return a target, assuming no reload changes the
    /// interval.
    pub fn time_until_due(&self) -> Duration {
        match self.last_dispatch {
            None => Duration::ZERO,
            Some(t) => self
                .interval
                .saturating_sub(self.clock.now().duration_since(t)),
        }
    }

    /// Minimum time between two dispatches.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn targets(&self) -> &[TargetEntry] {
        &self.targets
    }

    pub fn self_ip(&self) -> &str {
        &self.self_ip
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use indoc::indoc;

    use super::*;
    use crate::clock::ManualClock;

    fn record(n: u8) -> AddressRecord {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[15] = n;
        AddressRecord {
            gid: Gid::new(raw),
            lid: 0,
            qpn: 1000 + u32::from(n),
        }
    }

    fn documents(groups: &[(&str, &[&str])], ips: &[&str]) -> TargetDocuments {
        TargetDocuments {
            groups: groups
                .iter()
                .map(|(name, members)| {
                    (
                        name.to_string(),
                        members.iter().map(|ip| ip.to_string()).collect(),
                    )
                })
                .collect(),
            addresses: ips
                .iter()
                .enumerate()
                .map(|(i, ip)| (ip.to_string(), record(i as u8)))
                .collect(),
        }
    }

    fn config(ping_budget: Duration) -> SchedulerConfig {
        SchedulerConfig {
            ping_budget,
            idle_interval: Duration::from_secs(1),
            reload_period: Duration::from_secs(10),
            document_dir: PathBuf::new(),
        }
    }

    #[test]
    fn test_group_filtering() {
        let docs = documents(
            &[("A", &["ip1", "ip2"]), ("B", &["ip3"])],
            &["ip1", "ip2", "ip3"],
        );
        let ips: Vec<String> = build_targets("ip1", &docs)
            .into_iter()
            .map(|t| t.ip)
            .collect();
        assert!(ips.contains(&"ip2".to_string()));
        assert!(!ips.contains(&"ip3".to_string()));
        // Loopback through the NIC is kept.
        assert_eq!(ips, vec!["ip1".to_string(), "ip2".to_string()]);
    }

    #[test]
    fn test_targets_follow_address_order() {
        let docs = documents(
            &[("A", &["ip3", "ip1"]), ("B", &["ip1", "ip2"])],
            &["ip2", "ip9", "ip3", "ip1"],
        );
        let ips: Vec<String> = build_targets("ip1", &docs)
            .into_iter()
            .map(|t| t.ip)
            .collect();
        assert_eq!(ips, vec!["ip2", "ip3", "ip1"]);
        assert!(build_targets("ip9", &docs).is_empty());
    }

    #[test]
    fn test_round_robin() {
        let docs = documents(&[("A", &["a", "b", "c"])], &["a", "b", "c"]);
        let clock = ManualClock::new();
        let mut scheduler = PingScheduler::with_clock(
            "a",
            move || Ok(docs.clone()),
            config(Duration::from_millis(300)),
            clock.clone(),
        );

        let mut order = Vec::new();
        for _ in 0..6 {
            let target = scheduler.next().expect("target due");
            order.push(target.ip);
            // Called too soon.
            assert!(scheduler.next().is_none());
            clock.advance(Duration::from_millis(100));
        }
        assert_eq!(order, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_interval_scaling() {
        let clock = ManualClock::new();
        let budget = Duration::from_secs(1);

        let two = documents(&[("A", &["a", "b"])], &["a", "b"]);
        let mut scheduler =
            PingScheduler::with_clock("a", move || Ok(two.clone()), config(budget), clock.clone());
        scheduler.reload();
        assert_eq!(scheduler.interval(), budget / 2);

        let four = documents(&[("A", &["a", "b", "c", "d"])], &["a", "b", "c", "d"]);
        let mut scheduler =
            PingScheduler::with_clock("a", move || Ok(four.clone()), config(budget), clock);
        scheduler.reload();
        assert_eq!(scheduler.interval(), budget / 4);
    }

    #[test]
    fn test_reload_failure_clears_targets() {
        let clock = ManualClock::new();
        let calls = Cell::new(0);
        let docs = documents(&[("A", &["a", "b"])], &["a", "b"]);
        let source = || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Ok(docs.clone())
            } else {
                Err(TargetLoadError::MalformedEntry {
                    document: YamlTargetSource::ADDRESS_STORE,
                    key: "b".to_string(),
                    reason: "truncated".to_string(),
                })
            }
        };
        let mut scheduler =
            PingScheduler::with_clock("a", source, config(Duration::from_secs(1)), clock.clone());

        assert_eq!(scheduler.next().map(|t| t.ip), Some("a".to_string()));
        assert_eq!(scheduler.targets().len(), 2);

        clock.advance(Duration::from_secs(10));
        assert!(scheduler.next().is_none());
        assert!(scheduler.targets().is_empty());
        assert_eq!(scheduler.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_reload_resets_rotation() {
        let clock = ManualClock::new();
        let docs = documents(&[("A", &["a", "b", "c"])], &["a", "b", "c"]);
        let mut scheduler = PingScheduler::with_clock(
            "a",
            move || Ok(docs.clone()),
            config(Duration::from_secs(3)),
            clock.clone(),
        );

        assert_eq!(scheduler.next().unwrap().ip, "a");
        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.next().unwrap().ip, "b");
        clock.advance(Duration::from_secs(9));
        // Reloaded: the rotation starts over.
        assert_eq!(scheduler.next().unwrap().ip, "a");
    }

    #[test]
    fn test_yaml_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(YamlTargetSource::PINGLIST),
            indoc! {"
                rdma:
                  rack1: [10.0.0.1, 10.0.0.2]
                  rack2: [10.0.0.3]
                tcp:
                  all: [10.0.0.1, 10.0.0.3]
            "},
        )
        .unwrap();
        fs::write(
            dir.path().join(YamlTargetSource::ADDRESS_STORE),
            indoc! {"
                10.0.0.3: [fe800000000000000ac0ebfffe010203, 0, 300]
                10.0.0.2: [fe800000000000000ac0ebfffe010202, 7, 200]
                10.0.0.1: [fe800000000000000ac0ebfffe010201, 0, 100]
            "},
        )
        .unwrap();

        let source = YamlTargetSource::new(dir.path());
        let docs = source.load().unwrap();
        assert_eq!(docs.groups.len(), 2);
        assert_eq!(docs.groups[0].0, "rack1");

        let targets = build_targets("10.0.0.1", &docs);
        let ips: Vec<&str> = targets.iter().map(|t| t.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.2", "10.0.0.1"]);
        assert_eq!(targets[0].lid, 7);
        assert_eq!(targets[0].qpn, 200);
        assert_eq!(targets[0].gid.to_wire(), "fe800000000000000ac0ebfffe010202");
    }

    #[test]
    fn test_malformed_address_store_never_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(YamlTargetSource::PINGLIST),
            "rdma:\n  rack1: [10.0.0.1, 10.0.0.2]\n",
        )
        .unwrap();
        fs::write(
            dir.path().join(YamlTargetSource::ADDRESS_STORE),
            "10.0.0.2: [not-a-gid, 0, 200]\n",
        )
        .unwrap();

        let clock = ManualClock::new();
        let mut scheduler = PingScheduler::with_clock(
            "10.0.0.1",
            YamlTargetSource::new(dir.path()),
            config(Duration::from_secs(1)),
            clock.clone(),
        );
        for _ in 0..30 {
            assert!(scheduler.next().is_none());
            clock.advance(Duration::from_millis(500));
        }
        assert!(scheduler.targets().is_empty());

        // Not YAML at all.
        fs::write(dir.path().join(YamlTargetSource::ADDRESS_STORE), "[: {").unwrap();
        assert!(matches!(
            YamlTargetSource::new(dir.path()).load(),
            Err(TargetLoadError::Yaml { .. })
        ));
    }

    #[test]
    fn test_missing_documents() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            YamlTargetSource::new(dir.path()).load(),
            Err(TargetLoadError::Io { .. })
        ));
    }
}
