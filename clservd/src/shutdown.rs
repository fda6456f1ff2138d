// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use log::{info, warn};

use crate::dispatch::server_queue::ServerQueue;
use crate::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM (or SIGINT)
    Terminate,
    /// SIGHUP. Reloading is not supported; it stops the server like SIGTERM.
    Reconfigure,
    /// A server thread could not be created.
    SpawnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Running = 0,
    ShuttingDown = 1,
    Stopped = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Running,
            1 => ServerState::ShuttingDown,
            _ => ServerState::Stopped,
        }
    }
}

/// Drives RUNNING -> SHUTTING_DOWN -> STOPPED. There is no way back.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    reason: OnceLock<ShutdownReason>,
    queue: Arc<ServerQueue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub threads_joined: usize,
    pub drained_messages: usize,
}

impl ShutdownCoordinator {
    pub fn new(queue: Arc<ServerQueue>) -> Self {
        Self {
            state: AtomicU8::new(ServerState::Running as u8),
            reason: OnceLock::new(),
            queue,
        }
    }

    /// Sets the shutdown flag and wakes every blocked dequeue. Does nothing
    /// else, so it is fine to call from a signal thread. Safe to repeat; the
    /// first reason wins. Returns true for the call that started the shutdown.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        let first = self
            .state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if first {
            let _ = self.reason.set(reason);
            info!("shutdown requested ({reason:?})");
        }
        self.queue.cancel_all();
        first
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.queue.cancellation().is_cancelled()
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Waits for every server thread, then closes the queue so that whatever
    /// is left goes back to its producer as failed. Blocks until a shutdown
    /// was requested, since the threads only exit then.
    pub fn finish(&self, pool: WorkerPool) -> ShutdownOutcome {
        let threads_joined = pool.join();

        info!("Stopping dispatch server");
        let previous = self
            .state
            .swap(ServerState::Stopped as u8, Ordering::SeqCst);
        if previous == ServerState::Stopped as u8 {
            warn!("dispatch server already stopped");
            return ShutdownOutcome {
                threads_joined,
                drained_messages: 0,
            };
        }

        ShutdownOutcome {
            threads_joined,
            drained_messages: self.queue.close(),
        }
    }
}
