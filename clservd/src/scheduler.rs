// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ServerError;

/// Suggests the device a work item should run on.
///
/// Plain round robin for now. Choosing by NUMA distance or by the length of
/// each device's pending work is left for later.
#[derive(Debug)]
pub struct DeviceScheduler {
    next: AtomicUsize,
    num_devices: usize,
}

impl DeviceScheduler {
    pub fn new(num_devices: usize) -> Result<Self, ServerError> {
        if num_devices == 0 {
            return Err(ServerError::NoDevices);
        }
        Ok(Self {
            next: AtomicUsize::new(0),
            num_devices,
        })
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Index in `[0, num_devices)`. Sequential callers get 0, 1, .., n-1, 0, ..;
    /// concurrent callers get valid indices in unspecified order.
    pub fn select_device(&self) -> usize {
        // the counter wraps at usize::MAX, which only shifts the sequence once
        self.next.fetch_add(1, Ordering::Relaxed) % self.num_devices
    }
}
