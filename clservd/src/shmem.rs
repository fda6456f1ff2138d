// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Shared memory segment and its split into zones.
//!
//! A device only accepts buffers up to its max allocation size, which is far
//! smaller than the segment. The segment is therefore carved into zones of at
//! most `zone_length` bytes and each zone is registered on its own.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use accel_runtime::BufferHandle;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, MapFlags, ProtFlags};

use crate::error::ServerError;

/// One anonymous `MAP_SHARED` mapping, unmapped on drop.
#[derive(Debug)]
pub struct SharedSegment {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the segment is a plain memory mapping owned by this struct. It is
// never remapped, so its address is valid from any thread until drop.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    pub fn allocate(size: usize) -> Result<Self, ServerError> {
        let length = NonZeroUsize::new(size).ok_or_else(|| {
            ServerError::SharedMemory("segment size must be greater than zero".into())
        })?;
        // SAFETY: anonymous mapping at a kernel-chosen address, no existing memory is touched.
        let base = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| ServerError::SharedMemory(format!("mmap of {size} bytes failed: {e}")))?;
        debug!("shared segment of {size} bytes mapped at {:p}", base);
        Ok(Self {
            base: base.cast(),
            size,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Splits the segment into zones of `zone_length` bytes (the last one may be
    /// shorter) and calls `register` once per zone, in address order.
    ///
    /// Stops at the first failing registration; later zones are not registered.
    pub fn setup_zones<F>(
        &self,
        zone_length: usize,
        mut register: F,
    ) -> Result<ZoneTable, ServerError>
    where
        F: FnMut(NonNull<u8>, usize) -> Result<BufferHandle, ServerError>,
    {
        if zone_length == 0 {
            return Err(ServerError::SharedMemory(
                "zone length must be greater than zero".into(),
            ));
        }

        let count = self.size.div_ceil(zone_length);
        let mut zones = Vec::with_capacity(count);
        for index in 0..count {
            let offset = index * zone_length;
            let length = zone_length.min(self.size - offset);
            // SAFETY: offset < size, so the pointer stays inside the mapping.
            let address = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
            let buffer = register(address, length)?;
            zones.push(Zone {
                index,
                offset,
                length,
                buffer,
            });
        }

        Ok(ZoneTable {
            base: self.base.as_ptr() as usize,
            zone_length,
            zones,
        })
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: base/size describe exactly the mapping created in allocate().
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.size) };
        if let Err(e) = Errno::result(rc) {
            warn!("munmap of shared segment at {:p} failed: {e}", self.base);
        }
    }
}

/// A registered zone. The buffer handle is kept for the lifetime of the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub index: usize,
    /// Offset from the start of the segment.
    pub offset: usize,
    pub length: usize,
    pub buffer: BufferHandle,
}

#[derive(Debug)]
pub struct ZoneTable {
    base: usize,
    zone_length: usize,
    zones: Vec<Zone>,
}

impl ZoneTable {
    pub fn zone_length(&self) -> usize {
        self.zone_length
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Zone> {
        self.zones.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter()
    }

    /// The zone that contains `address`, if it lies inside the segment.
    pub fn zone_for(&self, address: *const u8) -> Option<&Zone> {
        let offset = (address as usize).checked_sub(self.base)?;
        let zone = self.zones.get(offset / self.zone_length)?;
        (offset < zone.offset + zone.length).then_some(zone)
    }
}
