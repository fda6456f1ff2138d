// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! SIGTERM/SIGHUP handling.
//!
//! The signals are blocked in every thread and consumed synchronously by one
//! dedicated thread with sigwait(2). That thread only asks the coordinator to
//! shut down, which sets a flag and wakes the queue.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, info};
use nix::sys::signal::{SigSet, Signal};

use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

pub fn shutdown_signals() -> SigSet {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGTERM);
    signals.add(Signal::SIGHUP);
    signals.add(Signal::SIGINT);
    signals
}

/// Blocks the shutdown signals in the calling thread. Must run before any
/// other thread is created, so that all of them inherit the mask.
pub fn block_shutdown_signals() -> nix::Result<SigSet> {
    let signals = shutdown_signals();
    signals.thread_block()?;
    Ok(signals)
}

pub fn reason_for(signal: Signal) -> ShutdownReason {
    match signal {
        Signal::SIGHUP => ShutdownReason::Reconfigure,
        _ => ShutdownReason::Terminate,
    }
}

/// Spawns the thread that turns shutdown signals into shutdown requests.
///
/// The thread keeps waiting after the first signal, so repeated signals are
/// absorbed. It is never joined; it ends with the process.
pub fn spawn_signal_listener(
    signals: SigSet,
    coordinator: Arc<ShutdownCoordinator>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("clserv-signals".into())
        .spawn(move || loop {
            match signals.wait() {
                Ok(signal) => {
                    info!("Got {}", signal.as_str());
                    coordinator.request_shutdown(reason_for(signal));
                }
                Err(e) => {
                    error!("sigwait failed: {e}");
                    break;
                }
            }
        })
}
