// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use crate::context::DeviceSet;
use crate::error::ServerError;

/// A unit of work for the server queue.
pub trait Message: Send + 'static {
    /// Free-form description, used for logging or debugging
    fn desc(&self) -> &str;

    /// Device the producer assigned this message to.
    fn device_index(&self) -> usize;

    /// Runs the work on the calling worker thread. Errors are the message's own
    /// business; the worker moves on to the next message either way.
    fn process(self: Box<Self>, devices: &DeviceSet);

    /// Hands the message back unprocessed.
    fn fail(self: Box<Self>, error: ServerError);
}

impl std::fmt::Debug for dyn Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("device", &self.device_index())
            .field("desc", &self.desc())
            .finish()
    }
}
