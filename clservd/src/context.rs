// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Execution context, command queue table and shared memory pinning.
//!
//! Asynchronous DMA between host and device needs the host side to be pinned,
//! but a device only pins up to its max allocation size at once (a few hundred
//! MB to 2 GB on typical GPUs). The shared segment is thus split into zones no
//! larger than the smallest max allocation size of all devices, so each zone
//! can be registered on any device of the context.

use accel_runtime::{
    AcceleratorRuntime, ContextHandle, DeviceDescriptor, QueueHandle, QueueProperties,
};
use log::{error, info};

use crate::error::ServerError;
use crate::shmem::SharedSegment;
use crate::zone_pinning::{pin_zone, unpin_zones, PinnedZones};

/// The devices the server dispatches to, with their context and queues.
///
/// Read-only after creation; `queues[i]` is bound to `devices[i]`.
#[derive(Debug)]
pub struct DeviceSet {
    context: ContextHandle,
    devices: Vec<DeviceDescriptor>,
    queues: Vec<QueueHandle>,
}

impl DeviceSet {
    /// Creates one context over all `devices` and one out-of-order, profiling
    /// command queue per device. Any failure aborts; there is no partial set.
    pub fn create<R: AcceleratorRuntime + ?Sized>(
        runtime: &R,
        devices: Vec<DeviceDescriptor>,
    ) -> Result<Self, ServerError> {
        if devices.is_empty() {
            error!("no devices to create a context for");
            return Err(ServerError::NoDevices);
        }

        let ids: Vec<_> = devices.iter().map(|d| d.id).collect();
        let context = runtime.create_context(&ids).map_err(|e| {
            error!("context creation failed: {e}");
            ServerError::ContextCreation(e)
        })?;

        let mut queues = Vec::with_capacity(devices.len());
        for (index, device) in devices.iter().enumerate() {
            let queue = runtime
                .create_command_queue(
                    context,
                    device.id,
                    QueueProperties::OUT_OF_ORDER_WITH_PROFILING,
                )
                .map_err(|source| {
                    error!("command queue creation failed on {}: {source}", device.name);
                    ServerError::QueueCreation {
                        device: index,
                        source,
                    }
                })?;
            queues.push(queue);
        }

        info!("context {} created for {} devices", context.0, devices.len());
        Ok(Self {
            context,
            devices,
            queues,
        })
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&DeviceDescriptor> {
        self.devices.get(index)
    }

    /// Command queue of the device at `index`.
    pub fn queue(&self, index: usize) -> Option<QueueHandle> {
        self.queues.get(index).copied()
    }

    pub fn queues(&self) -> &[QueueHandle] {
        &self.queues
    }

    pub fn zone_length(&self) -> u64 {
        compute_zone_length(&self.devices).unwrap_or(0)
    }
}

/// Smallest max allocation size over all devices, `None` without devices.
pub fn compute_zone_length(devices: &[DeviceDescriptor]) -> Option<u64> {
    devices.iter().map(|d| d.max_mem_alloc_size).min()
}

/// Builds the device set and pins every zone of `segment` in its context.
///
/// If a zone cannot be pinned, the zones pinned before it are released again.
pub fn init_context_and_shmem<'r>(
    runtime: &'r dyn AcceleratorRuntime,
    devices: Vec<DeviceDescriptor>,
    segment: &SharedSegment,
) -> Result<(DeviceSet, PinnedZones<'r>), ServerError> {
    let device_set = DeviceSet::create(runtime, devices)?;

    let zone_length = device_set.zone_length();
    info!("setting up shared memory (zone length={zone_length})");

    let context = device_set.context();
    let mut pinned = Vec::new();
    let result = segment.setup_zones(
        usize::try_from(zone_length).unwrap_or(usize::MAX),
        |address, length| {
            let buffer = pin_zone(runtime, context, address, length)?;
            pinned.push(buffer);
            Ok(buffer)
        },
    );
    let zones = match result {
        Ok(zones) => zones,
        Err(e) => {
            unpin_zones(runtime, &pinned);
            return Err(e);
        }
    };
    info!(
        "{} zones pinned over {} bytes of shared memory",
        zones.len(),
        segment.size()
    );
    Ok((device_set, PinnedZones::new(runtime, zones)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FaultyRuntime;
    use accel_runtime::{DeviceId, HostRuntime, RuntimeError};

    fn descriptor(index: usize, max_mem_alloc_size: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId(index as u64),
            index,
            name: format!("dev{index}"),
            max_mem_alloc_size,
        }
    }

    #[test]
    fn zone_length_is_minimum_of_all_devices() {
        let cases: &[&[u64]] = &[&[512], &[4096, 1024, 2048], &[7, 7, 7], &[1 << 40, 3]];
        for sizes in cases {
            let devices: Vec<_> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| descriptor(i, *s))
                .collect();
            let zone_length = compute_zone_length(&devices).unwrap();
            assert_eq!(zone_length, *sizes.iter().min().unwrap());
            assert!(devices.iter().all(|d| zone_length <= d.max_mem_alloc_size));
        }
        assert_eq!(compute_zone_length(&[]), None);
    }

    #[test]
    fn one_queue_per_device_in_discovery_order() {
        let runtime = HostRuntime::new(&[4096, 1024, 2048]);
        let set = DeviceSet::create(&runtime, runtime.discover_devices()).unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.queues().len(), set.devices().len());
        assert_eq!(set.zone_length(), 1024);
        for (index, device) in set.devices().iter().enumerate() {
            let (bound_to, properties) = runtime.queue_info(set.queue(index).unwrap()).unwrap();
            assert_eq!(bound_to, device.id);
            assert!(properties.out_of_order_exec);
            assert!(properties.profiling);
        }
        assert_eq!(runtime.context_devices(set.context()).unwrap().len(), 3);
    }

    #[test]
    fn empty_device_list_is_fatal() {
        let runtime = HostRuntime::new(&[]);
        let err = DeviceSet::create(&runtime, Vec::new()).unwrap_err();
        assert_eq!(err, ServerError::NoDevices);
        assert!(err.is_fatal());
    }

    #[test]
    fn context_failure_is_fatal() {
        let runtime = FaultyRuntime::new(&[1024]).fail_context();
        let devices = runtime.inner().discover_devices();
        let err = DeviceSet::create(&runtime, devices).unwrap_err();
        assert!(matches!(err, ServerError::ContextCreation(_)));
    }

    #[test]
    fn queue_failure_aborts_whole_set() {
        let runtime = FaultyRuntime::new(&[1024, 1024, 1024]).fail_queue_at(1);
        let devices = runtime.inner().discover_devices();
        let err = DeviceSet::create(&runtime, devices).unwrap_err();
        assert!(matches!(err, ServerError::QueueCreation { device: 1, .. }));
    }

    #[test]
    fn every_zone_is_pinned() {
        let runtime = HostRuntime::new(&[8192, 4096]);
        let segment = SharedSegment::allocate(10 * 1024).unwrap();
        let (set, zones) =
            init_context_and_shmem(&runtime, runtime.discover_devices(), &segment).unwrap();

        assert_eq!(set.zone_length(), 4096);
        assert_eq!(zones.len(), 3);
        assert_eq!(runtime.buffer_count(), 3);
        for zone in zones.iter() {
            let (address, length) = runtime.buffer_range(zone.buffer).unwrap();
            assert_eq!(address, segment.base().as_ptr() as usize + zone.offset);
            assert_eq!(length, zone.length);
        }
    }

    #[test]
    fn failing_zone_aborts_startup() {
        let runtime = FaultyRuntime::new(&[4096]).fail_buffer_at(1);
        let segment = SharedSegment::allocate(3 * 4096).unwrap();
        let err = init_context_and_shmem(&runtime, runtime.inner().discover_devices(), &segment)
            .unwrap_err();

        assert!(matches!(
            err,
            ServerError::ZoneRegistration {
                source: RuntimeError::InvalidBufferSize { .. },
                ..
            }
        ));
        assert_eq!(runtime.buffer_attempts(), 2);
        // the first zone was pinned and released again
        assert_eq!(runtime.inner().buffer_count(), 0);
    }

    #[test]
    fn dropping_pinned_zones_releases_buffers() {
        let runtime = HostRuntime::new(&[4096]);
        let segment = SharedSegment::allocate(3 * 4096).unwrap();
        let (_set, zones) =
            init_context_and_shmem(&runtime, runtime.discover_devices(), &segment).unwrap();
        assert_eq!(runtime.buffer_count(), 3);

        drop(zones);
        assert_eq!(runtime.buffer_count(), 0);
    }
}
