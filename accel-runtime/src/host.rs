// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! CPU reference implementation of [`AcceleratorRuntime`].
//!
//! Devices are simulated from a list of max-allocation sizes. Contexts, queues
//! and buffers are bookkeeping entries with the same validation rules a real
//! OpenCL driver applies. With page locking enabled, host buffers are
//! `mlock`ed, which is what "pinned" means for DMA on the host side.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use nix::errno::Errno;

use crate::{
    AcceleratorRuntime, BufferHandle, ContextHandle, DeviceDescriptor, DeviceId, MemFlags,
    QueueHandle, QueueProperties, Result, RuntimeError,
};

#[derive(Debug)]
struct HostQueue {
    context: ContextHandle,
    device: DeviceId,
    properties: QueueProperties,
}

#[derive(Debug)]
struct HostBuffer {
    context: ContextHandle,
    address: usize,
    length: usize,
    locked: bool,
}

#[derive(Debug, Default)]
struct Registry {
    contexts: HashMap<ContextHandle, Vec<DeviceId>>,
    queues: HashMap<QueueHandle, HostQueue>,
    buffers: HashMap<BufferHandle, HostBuffer>,
}

#[derive(Debug)]
pub struct HostRuntime {
    devices: Vec<DeviceDescriptor>,
    lock_pages: bool,
    next_handle: AtomicU64,
    registry: Mutex<Registry>,
}

impl HostRuntime {
    /// One simulated device per entry, in the given order.
    pub fn new(max_mem_alloc_sizes: &[u64]) -> Self {
        let devices = max_mem_alloc_sizes
            .iter()
            .enumerate()
            .map(|(index, &max_mem_alloc_size)| DeviceDescriptor {
                id: DeviceId(index as u64 + 1),
                index,
                name: format!("host-cpu-{index}"),
                max_mem_alloc_size,
            })
            .collect();
        Self {
            devices,
            lock_pages: false,
            next_handle: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn with_page_locking(mut self, lock_pages: bool) -> Self {
        self.lock_pages = lock_pages;
        self
    }

    /// Device discovery. Returns the devices in a stable order.
    pub fn discover_devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.clone()
    }

    pub fn context_devices(&self, context: ContextHandle) -> Option<Vec<DeviceId>> {
        self.registry().contexts.get(&context).cloned()
    }

    /// Device and properties a queue was created with.
    pub fn queue_info(&self, queue: QueueHandle) -> Option<(DeviceId, QueueProperties)> {
        self.registry()
            .queues
            .get(&queue)
            .map(|q| (q.device, q.properties))
    }

    /// Host range wrapped by a buffer, as (address, length).
    pub fn buffer_range(&self, buffer: BufferHandle) -> Option<(usize, usize)> {
        self.registry()
            .buffers
            .get(&buffer)
            .map(|b| (b.address, b.length))
    }

    pub fn buffer_count(&self) -> usize {
        self.registry().buffers.len()
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_alloc_of(&self, device: DeviceId) -> Option<u64> {
        self.devices
            .iter()
            .find(|d| d.id == device)
            .map(|d| d.max_mem_alloc_size)
    }
}

impl AcceleratorRuntime for HostRuntime {
    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextHandle> {
        if devices.is_empty() {
            return Err(RuntimeError::NoDevices);
        }
        if let Some(unknown) = devices.iter().find(|id| self.max_alloc_of(**id).is_none()) {
            return Err(RuntimeError::DeviceNotFound(*unknown));
        }
        let context = ContextHandle(self.next_handle());
        self.registry().contexts.insert(context, devices.to_vec());
        debug!("context {} created for {} devices", context.0, devices.len());
        Ok(context)
    }

    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceId,
        properties: QueueProperties,
    ) -> Result<QueueHandle> {
        let mut registry = self.registry();
        let members = registry
            .contexts
            .get(&context)
            .ok_or(RuntimeError::InvalidContext(context))?;
        if !members.contains(&device) {
            return Err(RuntimeError::DeviceNotFound(device));
        }
        let queue = QueueHandle(self.next_handle());
        registry.queues.insert(
            queue,
            HostQueue {
                context,
                device,
                properties,
            },
        );
        Ok(queue)
    }

    fn create_host_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        host_ptr: NonNull<u8>,
        length: usize,
    ) -> Result<BufferHandle> {
        if !flags.use_host_ptr {
            return Err(RuntimeError::InvalidMemFlags(flags));
        }
        let members = self
            .context_devices(context)
            .ok_or(RuntimeError::InvalidContext(context))?;
        // a buffer must fit on every device of its context
        let max = members
            .iter()
            .filter_map(|id| self.max_alloc_of(*id))
            .min()
            .unwrap_or(0);
        if length == 0 || length as u64 > max {
            return Err(RuntimeError::InvalidBufferSize {
                requested: length,
                max,
            });
        }

        if self.lock_pages {
            // SAFETY: the caller guarantees that the range is mapped.
            let rc = unsafe { libc::mlock(host_ptr.as_ptr().cast(), length) };
            Errno::result(rc).map_err(|errno| RuntimeError::PageLockFailed { length, errno })?;
        }

        let buffer = BufferHandle(self.next_handle());
        self.registry().buffers.insert(
            buffer,
            HostBuffer {
                context,
                address: host_ptr.as_ptr() as usize,
                length,
                locked: self.lock_pages,
            },
        );
        Ok(buffer)
    }

    fn release_host_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let released = self
            .registry()
            .buffers
            .remove(&buffer)
            .ok_or(RuntimeError::InvalidBuffer(buffer))?;
        debug!(
            "releasing buffer {} of context {}",
            buffer.0, released.context.0
        );
        if released.locked {
            // SAFETY: the caller releases buffers before unmapping their memory.
            let rc =
                unsafe { libc::munlock(released.address as *const libc::c_void, released.length) };
            if let Err(errno) = Errno::result(rc) {
                warn!("munlock of {:#x} failed: {errno}", released.address);
            }
        }
        Ok(())
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        let registry = self.registry.get_mut().unwrap_or_else(PoisonError::into_inner);
        // Never munlock here: the memory behind a leftover buffer may be
        // unmapped already and its address reused.
        for (handle, buffer) in registry.buffers.drain() {
            warn!(
                "buffer {} ({:#x}, {} bytes) was never released",
                handle.0, buffer.address, buffer.length
            );
        }
        for (_, queue) in registry.queues.drain() {
            debug!(
                "releasing queue of device {} in context {}",
                queue.device.0, queue.context.0
            );
        }
    }
}
