// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Fault injection for the unit tests.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use accel_runtime::{
    AcceleratorRuntime, BufferHandle, ContextHandle, DeviceId, HostRuntime, MemFlags, QueueHandle,
    QueueProperties, RuntimeError,
};

use crate::worker_pool::{OsThreadSpawner, ThreadSpawner};

/// HostRuntime that fails selected calls. Indices count calls from zero.
#[derive(Debug)]
pub(crate) struct FaultyRuntime {
    inner: HostRuntime,
    fail_context: bool,
    fail_queue_at: Option<usize>,
    fail_buffer_at: Option<usize>,
    queue_calls: AtomicUsize,
    buffer_calls: AtomicUsize,
}

impl FaultyRuntime {
    pub(crate) fn new(max_mem_alloc_sizes: &[u64]) -> Self {
        Self {
            inner: HostRuntime::new(max_mem_alloc_sizes),
            fail_context: false,
            fail_queue_at: None,
            fail_buffer_at: None,
            queue_calls: AtomicUsize::new(0),
            buffer_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_context(mut self) -> Self {
        self.fail_context = true;
        self
    }

    pub(crate) fn fail_queue_at(mut self, call: usize) -> Self {
        self.fail_queue_at = Some(call);
        self
    }

    pub(crate) fn fail_buffer_at(mut self, call: usize) -> Self {
        self.fail_buffer_at = Some(call);
        self
    }

    pub(crate) fn inner(&self) -> &HostRuntime {
        &self.inner
    }

    pub(crate) fn buffer_attempts(&self) -> usize {
        self.buffer_calls.load(Ordering::SeqCst)
    }
}

impl AcceleratorRuntime for FaultyRuntime {
    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextHandle, RuntimeError> {
        if self.fail_context {
            return Err(RuntimeError::NoDevices);
        }
        self.inner.create_context(devices)
    }

    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceId,
        properties: QueueProperties,
    ) -> Result<QueueHandle, RuntimeError> {
        let call = self.queue_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_queue_at == Some(call) {
            return Err(RuntimeError::DeviceNotFound(device));
        }
        self.inner.create_command_queue(context, device, properties)
    }

    fn create_host_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        host_ptr: NonNull<u8>,
        length: usize,
    ) -> Result<BufferHandle, RuntimeError> {
        let call = self.buffer_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_buffer_at == Some(call) {
            return Err(RuntimeError::InvalidBufferSize {
                requested: length,
                max: 0,
            });
        }
        self.inner.create_host_buffer(context, flags, host_ptr, length)
    }

    fn release_host_buffer(&self, buffer: BufferHandle) -> Result<(), RuntimeError> {
        self.inner.release_host_buffer(buffer)
    }
}

/// Spawns real threads until the `fail_at`-th spawn, which returns an error.
pub(crate) struct FailingSpawner {
    fail_at: Option<usize>,
    pub(crate) attempts: usize,
}

impl FailingSpawner {
    pub(crate) fn fail_at(call: usize) -> Self {
        Self {
            fail_at: Some(call),
            attempts: 0,
        }
    }

    pub(crate) fn never() -> Self {
        Self {
            fail_at: None,
            attempts: 0,
        }
    }
}

impl ThreadSpawner for FailingSpawner {
    fn spawn(
        &mut self,
        index: usize,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        self.attempts += 1;
        if self.fail_at == Some(index) {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "simulated thread creation failure",
            ));
        }
        OsThreadSpawner.spawn(index, body)
    }
}
