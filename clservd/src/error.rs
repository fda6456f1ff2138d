// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt;

use accel_runtime::RuntimeError;

/// Errors of the dispatch server.
///
/// The first group is fatal at startup. `QueueClosed` and `ProcessingFailed`
/// are the statuses a producer sees on a work item that was not processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    NoDevices,
    ContextCreation(RuntimeError),
    QueueCreation { device: usize, source: RuntimeError },
    ZoneRegistration {
        address: usize,
        length: usize,
        source: RuntimeError,
    },
    SharedMemory(String),
    InvalidConfig(String),
    /// The server queue is closed; the work item was returned unprocessed.
    QueueClosed,
    /// The work item's own processing reported a failure.
    ProcessingFailed(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevices => write!(f, "no accelerator devices available"),
            Self::ContextCreation(e) => write!(f, "context creation failed: {e}"),
            Self::QueueCreation { device, source } => {
                write!(f, "command queue creation failed on device {device}: {source}")
            }
            Self::ZoneRegistration {
                address,
                length,
                source,
            } => write!(
                f,
                "buffer creation failed on host memory ({:#x}-{:#x}): {source}",
                address,
                address + length.saturating_sub(1)
            ),
            Self::SharedMemory(msg) => write!(f, "shared memory: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::QueueClosed => write!(f, "server queue is closed"),
            Self::ProcessingFailed(msg) => write!(f, "processing failed: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ContextCreation(e)
            | Self::QueueCreation { source: e, .. }
            | Self::ZoneRegistration { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl ServerError {
    /// True for errors that abort server startup.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::QueueClosed | Self::ProcessingFailed(_))
    }
}
