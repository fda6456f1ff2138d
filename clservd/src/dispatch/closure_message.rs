// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use crate::context::DeviceSet;
use crate::dispatch::message::Message;
use crate::error::ServerError;

type ProcessFn = Box<dyn FnOnce(usize, &DeviceSet) + Send + 'static>;
type FailFn = Box<dyn FnOnce(ServerError) + Send + 'static>;

/// A message made of two closures: one runs on a worker, the other runs if
/// the message is handed back unprocessed.
pub struct ClosureMessage {
    desc: String,
    device_index: usize,
    on_process: ProcessFn,
    on_fail: FailFn,
}

impl ClosureMessage {
    pub fn new(
        desc: impl Into<String>,
        device_index: usize,
        on_process: Box<dyn FnOnce(usize, &DeviceSet) + Send + 'static>,
        on_fail: Box<dyn FnOnce(ServerError) + Send + 'static>,
    ) -> Self {
        Self {
            desc: desc.into(),
            device_index,
            on_process,
            on_fail,
        }
    }
}

impl Message for ClosureMessage {
    fn desc(&self) -> &str {
        &self.desc
    }

    fn device_index(&self) -> usize {
        self.device_index
    }

    fn process(self: Box<Self>, devices: &DeviceSet) {
        (self.on_process)(self.device_index, devices)
    }

    fn fail(self: Box<Self>, error: ServerError) {
        (self.on_fail)(error)
    }
}
