// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use accel_runtime::HostRuntime;
use anyhow::Context;
use clap::Parser;
use log::{error, info};

use clservd::error::ServerError;
use clservd::global_config::{self, Args, ServerConfig};
use clservd::logging::init_logging;
use clservd::server::{Server, ServerReport};
use clservd::shutdown::ShutdownReason;
use clservd::signals;

fn run(config: &ServerConfig) -> anyhow::Result<ServerReport> {
    // before any thread exists, so every server thread inherits the mask
    let signal_set =
        signals::block_shutdown_signals().context("failed to block shutdown signals")?;

    let settings = config.settings().map_err(ServerError::InvalidConfig)?;
    let max_allocs = config
        .device_max_alloc_bytes()
        .map_err(ServerError::InvalidConfig)?;
    let runtime = HostRuntime::new(&max_allocs).with_page_locking(config.lock_pages);
    let devices = runtime.discover_devices();
    info!("{} devices discovered", devices.len());

    let server =
        Server::start(&runtime, devices, &settings).context("failed to start dispatch server")?;

    if let Err(e) = signals::spawn_signal_listener(signal_set, server.coordinator()) {
        error!("failed to create signal thread: {e}");
        server.request_shutdown(ShutdownReason::SpawnFailure);
        server.wait_for_shutdown();
        return Err(e).context("failed to create signal thread");
    }

    Ok(server.wait_for_shutdown())
}

fn main() {
    let args = Args::parse();

    let config = match global_config::load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    };
    if let Err(e) = global_config::validate_config(&config) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    init_logging(config.log_verbosity);

    match run(&config) {
        Ok(report) => {
            info!(
                "clservd exits ({:?}): {} threads, {} unprocessed messages",
                report.reason, report.threads_started, report.drained_messages
            );
            if report.reason == Some(ShutdownReason::SpawnFailure) {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}
