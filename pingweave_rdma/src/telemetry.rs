/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-wide logging setup.
//!
//! Logs go to stderr and, when a directory is configured, to
//! `<directory>/<file_name>.log` through a non-blocking writer. The
//! `PINGWEAVE_LOG` environment variable takes an `EnvFilter` directive and
//! overrides the configured level.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding a filter directive, e.g. `pingweave_rdma=debug`.
pub const LOG_ENV: &str = "PINGWEAVE_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level directive when `PINGWEAVE_LOG` is unset.
    pub level: String,
    /// If set, logs are also written to a file in this directory.
    pub directory: Option<PathBuf>,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            file_name: "pingweave_rdma".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Path of the log file, if file logging is enabled.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.directory
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", self.file_name)))
    }
}

fn env_filter(level: &str) -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.is_empty() => EnvFilter::try_new(&directive)
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info")),
        _ => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive for the lifetime of the process. Returns `None` if file logging is
/// disabled. A second call in the same process is logged and ignored.
pub fn initialize_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter(&config.level));

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, format!("{}.log", config.file_name));
            let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter(&config.level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
    {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
    if let Some(path) = config.file_path() {
        tracing::info!("logging to {}", path.display());
    }
    guard
}

/// Installs a subscriber that writes through the test harness's captured
/// output, at debug level unless `PINGWEAVE_LOG` says otherwise. Later calls
/// are no-ops, so every test may call it.
pub fn initialize_logging_for_test() {
    let _ = fmt()
        .with_env_filter(env_filter("debug"))
        .with_test_writer()
        .try_init();
}
