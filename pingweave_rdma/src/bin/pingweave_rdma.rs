/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Runs one heartbeat agent bound to the RDMA device that carries `--ip`.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use nix::sys::signal;
use nix::sys::signal::SigHandler;
use pingweave_rdma::Role;
use pingweave_rdma::agent;
use pingweave_rdma::agent::RunOptions;
use pingweave_rdma::config::AgentConfig;
use pingweave_rdma::telemetry;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(about = "RDMA heartbeat agent")]
struct Args {
    /// Local IPv4 address; selects the interface and RDMA device.
    #[arg(long)]
    ip: Ipv4Addr,

    /// `tx` sends heartbeats, `rx` receives them.
    #[arg(long)]
    role: Role,

    /// YAML configuration file. Defaults are used when omitted.
    #[arg(long, env = "PINGWEAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Result queue identifier. Defaults to `<ip>_<role>`.
    #[arg(long)]
    id: Option<String>,

    /// Directory the agent publishes its queue pair address into.
    #[arg(long, default_value = "upload")]
    upload_dir: PathBuf,

    /// The other end of the queue pair in connected mode.
    #[arg(long)]
    peer_ip: Option<String>,
}

extern "C" fn request_shutdown(_signo: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<()> {
    for sig in [signal::SIGINT, signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        unsafe { signal::signal(sig, SigHandler::Handler(request_shutdown)) }
            .with_context(|| format!("unable to register a handler for {}", sig))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_yaml(path)?,
        None => AgentConfig::default(),
    };
    config.apply_env_overrides()?;

    let _guard = telemetry::initialize_logging(&config.logging);
    install_signal_handlers()?;

    let options = RunOptions {
        ip: args.ip,
        role: args.role,
        id: args
            .id
            .unwrap_or_else(|| RunOptions::default_id(args.ip, args.role)),
        upload_dir: args.upload_dir,
        peer_ip: args.peer_ip,
    };
    tracing::info!(
        "starting {} agent on {} with queue {}",
        options.role,
        options.ip,
        options.id
    );

    let result = agent::run(&config, &options, &SHUTDOWN);
    if let Err(e) = &result {
        tracing::error!("agent exited: {:#}", e);
    }
    result
}
