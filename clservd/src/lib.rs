// SPDX-License-Identifier: MIT
// clservd: intermediation server between producer processes and accelerator devices
//
// - Maps one shared memory segment and pins it, zone by zone, in a device context.
// - Dispatches work items from a shared queue to a pool of server threads.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod context;
pub mod dispatch;
pub mod error;
pub mod global_config;
pub mod logging;
pub mod scheduler;
pub mod server;
pub mod shmem;
pub mod shutdown;
pub mod signals;
pub mod worker_pool;
pub mod zone_pinning;

#[cfg(test)]
mod test_support;

pub use crate::context::DeviceSet;
pub use crate::dispatch::closure_message::ClosureMessage;
pub use crate::dispatch::message::Message;
pub use crate::dispatch::reply_message::{MessageStatus, Reply, ReplyMessage};
pub use crate::error::ServerError;
pub use crate::server::{Producer, Server, ServerReport, ServerSettings};
pub use crate::shutdown::{ServerState, ShutdownReason};
