// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Minimal surface of an OpenCL-like accelerator runtime.
//!
//! The dispatch server only needs three calls from the runtime: create one
//! context spanning a set of devices, create a command queue per device, and
//! wrap a host memory range into a device-visible buffer. They are collected in
//! [`AcceleratorRuntime`] so that the server can run against real drivers or
//! against the CPU reference implementation in [`host`].

use std::fmt;
use std::ptr::NonNull;

pub mod host;

pub use host::HostRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// What device discovery reports for one device. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    /// Position in the discovery order. Command queues are indexed the same way.
    pub index: usize,
    pub name: String,
    /// Largest single buffer the device accepts (CL_DEVICE_MAX_MEM_ALLOC_SIZE).
    pub max_mem_alloc_size: u64,
}

/// Command queue creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueProperties {
    pub out_of_order_exec: bool,
    pub profiling: bool,
}

impl QueueProperties {
    pub const OUT_OF_ORDER_WITH_PROFILING: QueueProperties = QueueProperties {
        out_of_order_exec: true,
        profiling: true,
    };
}

/// Buffer creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemFlags {
    pub read_write: bool,
    /// The buffer wraps caller-provided host memory instead of allocating its own.
    pub use_host_ptr: bool,
}

impl MemFlags {
    pub const READ_WRITE_USE_HOST_PTR: MemFlags = MemFlags {
        read_write: true,
        use_host_ptr: true,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A context needs at least one device.
    NoDevices,
    DeviceNotFound(DeviceId),
    InvalidContext(ContextHandle),
    InvalidBuffer(BufferHandle),
    /// Zero sized, or larger than the max allocation size of a device in the context.
    InvalidBufferSize { requested: usize, max: u64 },
    /// Only host-pointer buffers are supported.
    InvalidMemFlags(MemFlags),
    /// The host range could not be page-locked.
    PageLockFailed { length: usize, errno: nix::errno::Errno },
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevices => write!(f, "no devices given"),
            Self::DeviceNotFound(id) => write!(f, "device {} not found", id.0),
            Self::InvalidContext(ctx) => write!(f, "invalid context {}", ctx.0),
            Self::InvalidBuffer(buffer) => write!(f, "invalid buffer {}", buffer.0),
            Self::InvalidBufferSize { requested, max } => {
                write!(f, "invalid buffer size {requested} (max {max})")
            }
            Self::InvalidMemFlags(flags) => write!(f, "unsupported memory flags {flags:?}"),
            Self::PageLockFailed { length, errno } => {
                write!(f, "failed to lock {length} bytes of host memory: {errno}")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// The calls the dispatch server makes into the accelerator runtime.
///
/// Implementations must be usable from any thread; handles are plain values
/// and stay valid for the lifetime of the runtime.
pub trait AcceleratorRuntime: Send + Sync + fmt::Debug {
    /// Create one execution context spanning `devices`.
    fn create_context(&self, devices: &[DeviceId]) -> Result<ContextHandle>;

    /// Create a command queue bound to `device` inside `context`.
    fn create_command_queue(
        &self,
        context: ContextHandle,
        device: DeviceId,
        properties: QueueProperties,
    ) -> Result<QueueHandle>;

    /// Wrap `length` bytes of host memory starting at `host_ptr` into a buffer.
    ///
    /// The memory must stay mapped for as long as the returned handle is used.
    fn create_host_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        host_ptr: NonNull<u8>,
        length: usize,
    ) -> Result<BufferHandle>;

    /// Release a buffer created by `create_host_buffer`. Must be called while
    /// the host memory is still mapped.
    fn release_host_buffer(&self, buffer: BufferHandle) -> Result<()>;
}
