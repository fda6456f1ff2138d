// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::ops::Deref;
use std::ptr::NonNull;

use accel_runtime::{AcceleratorRuntime, BufferHandle, ContextHandle, MemFlags};
use log::{debug, error, info, warn};

use crate::error::ServerError;
use crate::shmem::ZoneTable;

/// Registers one zone of the shared segment as a host-pointer buffer, so later
/// transfers from it can run asynchronously.
///
/// Only the returned handle and the log carry its effect. A failure is fatal
/// for startup: zones are sized so that every device accepts them.
pub fn pin_zone<R: AcceleratorRuntime + ?Sized>(
    runtime: &R,
    context: ContextHandle,
    address: NonNull<u8>,
    length: usize,
) -> Result<BufferHandle, ServerError> {
    let start = address.as_ptr() as usize;
    let end = start + length.saturating_sub(1);

    match runtime.create_host_buffer(context, MemFlags::READ_WRITE_USE_HOST_PTR, address, length) {
        Ok(buffer) => {
            info!(
                "zone {:#x}-{:#x} was mapped (len: {}MB)",
                start,
                end,
                length >> 20
            );
            Ok(buffer)
        }
        Err(source) => {
            error!(
                "buffer creation failed on host memory ({:#x}-{:#x}): {}",
                start, end, source
            );
            Err(ServerError::ZoneRegistration {
                address: start,
                length,
                source,
            })
        }
    }
}

/// Unregisters buffers that were pinned with [`pin_zone`]. Failures are only
/// logged; the memory is about to go away anyway.
pub fn unpin_zones<R: AcceleratorRuntime + ?Sized>(runtime: &R, buffers: &[BufferHandle]) {
    for buffer in buffers {
        if let Err(e) = runtime.release_host_buffer(*buffer) {
            warn!("failed to release zone buffer {}: {e}", buffer.0);
        }
    }
    debug!("{} zone buffers released", buffers.len());
}

/// The zone table together with the runtime its buffers were registered in.
/// Dropping it releases every zone buffer, so it must be dropped before the
/// segment the zones point into.
#[derive(Debug)]
pub struct PinnedZones<'r> {
    runtime: &'r dyn AcceleratorRuntime,
    table: ZoneTable,
}

impl<'r> PinnedZones<'r> {
    pub fn new(runtime: &'r dyn AcceleratorRuntime, table: ZoneTable) -> Self {
        Self { runtime, table }
    }
}

impl Deref for PinnedZones<'_> {
    type Target = ZoneTable;

    fn deref(&self) -> &ZoneTable {
        &self.table
    }
}

impl Drop for PinnedZones<'_> {
    fn drop(&mut self) {
        let buffers: Vec<_> = self.table.iter().map(|zone| zone.buffer).collect();
        unpin_zones(self.runtime, &buffers);
    }
}
