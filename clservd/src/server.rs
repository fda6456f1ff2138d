// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;

use accel_runtime::{AcceleratorRuntime, DeviceDescriptor};
use log::{error, info};

use crate::context::{init_context_and_shmem, DeviceSet};
use crate::dispatch::cancel::CancellationToken;
use crate::dispatch::message::Message;
use crate::dispatch::server_queue::ServerQueue;
use crate::error::ServerError;
use crate::scheduler::DeviceScheduler;
use crate::shmem::{SharedSegment, ZoneTable};
use crate::shutdown::{ServerState, ShutdownCoordinator, ShutdownReason};
use crate::worker_pool::{self, OsThreadSpawner, ThreadSpawner, WorkerPool};
use crate::zone_pinning::PinnedZones;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// 0 = one thread per online processor
    pub num_threads: usize,
    /// Bytes of shared memory to map and pin
    pub shmem_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerReport {
    pub threads_requested: usize,
    pub threads_started: usize,
    pub drained_messages: usize,
    pub reason: Option<ShutdownReason>,
}

/// Submission side of the server. Cheap to clone and hand to producer threads.
#[derive(Debug, Clone)]
pub struct Producer {
    queue: Arc<ServerQueue>,
    scheduler: Arc<DeviceScheduler>,
}

impl Producer {
    pub fn select_device(&self) -> usize {
        self.scheduler.select_device()
    }

    pub fn enqueue(&self, message: Box<dyn Message>) -> Result<(), ServerError> {
        self.queue.enqueue(message)
    }

    /// Picks a device, builds the message for it and enqueues it. Returns the device.
    pub fn submit<F>(&self, build: F) -> Result<usize, ServerError>
    where
        F: FnOnce(usize) -> Box<dyn Message>,
    {
        let device = self.scheduler.select_device();
        self.queue.enqueue(build(device))?;
        Ok(device)
    }
}

/// A running dispatch server, borrowing the runtime its zones are pinned in.
///
/// Field order matters on drop: zone buffers are released in the runtime
/// before the segment they point into is unmapped.
#[derive(Debug)]
pub struct Server<'r> {
    producer: Producer,
    coordinator: Arc<ShutdownCoordinator>,
    pool: WorkerPool,
    devices: Arc<DeviceSet>,
    zones: PinnedZones<'r>,
    segment: SharedSegment,
}

impl<'r> Server<'r> {
    pub fn start(
        runtime: &'r dyn AcceleratorRuntime,
        devices: Vec<DeviceDescriptor>,
        settings: &ServerSettings,
    ) -> Result<Self, ServerError> {
        Self::start_with(
            runtime,
            devices,
            settings,
            &mut OsThreadSpawner,
            worker_pool::online_processors,
        )
    }

    /// Startup: map the shared segment, build context and queues, pin every
    /// zone, then launch the server threads. Everything before the threads is
    /// fatal on failure. A thread that cannot be created turns into a shutdown
    /// request instead; the returned server then only needs to be waited for.
    pub fn start_with<P>(
        runtime: &'r dyn AcceleratorRuntime,
        devices: Vec<DeviceDescriptor>,
        settings: &ServerSettings,
        spawner: &mut dyn ThreadSpawner,
        processors: P,
    ) -> Result<Self, ServerError>
    where
        P: FnOnce() -> Option<usize>,
    {
        let segment = SharedSegment::allocate(settings.shmem_size)?;
        let (device_set, zones) = init_context_and_shmem(runtime, devices, &segment)?;
        let devices = Arc::new(device_set);
        info!("Starting dispatch server");

        let scheduler = Arc::new(DeviceScheduler::new(devices.len())?);
        let queue = Arc::new(ServerQueue::new(CancellationToken::new()));
        let coordinator = Arc::new(ShutdownCoordinator::new(queue.clone()));

        let num_threads = worker_pool::resolve_thread_count(settings.num_threads, processors);
        let pool = WorkerPool::launch(num_threads, queue.clone(), devices.clone(), spawner);
        if pool.spawn_error().is_some() {
            error!("failed to create server threads");
            coordinator.request_shutdown(ShutdownReason::SpawnFailure);
        } else {
            info!("{} of server threads are up", pool.started());
        }

        Ok(Self {
            producer: Producer { queue, scheduler },
            coordinator,
            pool,
            devices,
            zones,
            segment,
        })
    }

    pub fn producer(&self) -> Producer {
        self.producer.clone()
    }

    pub fn select_device(&self) -> usize {
        self.producer.select_device()
    }

    pub fn enqueue(&self, message: Box<dyn Message>) -> Result<(), ServerError> {
        self.producer.enqueue(message)
    }

    pub fn submit<F>(&self, build: F) -> Result<usize, ServerError>
    where
        F: FnOnce(usize) -> Box<dyn Message>,
    {
        self.producer.submit(build)
    }

    /// Handle for whoever reacts to signals.
    pub fn coordinator(&self) -> Arc<ShutdownCoordinator> {
        self.coordinator.clone()
    }

    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        self.coordinator.request_shutdown(reason)
    }

    pub fn state(&self) -> ServerState {
        self.coordinator.state()
    }

    pub fn devices(&self) -> &DeviceSet {
        &self.devices
    }

    pub fn zones(&self) -> &ZoneTable {
        &self.zones
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    pub fn threads_started(&self) -> usize {
        self.pool.started()
    }

    /// Blocks until a shutdown was requested and every server thread has
    /// exited, then closes the queue.
    pub fn wait_for_shutdown(self) -> ServerReport {
        let threads_requested = self.pool.requested();
        let threads_started = self.pool.started();
        let outcome = self.coordinator.finish(self.pool);
        let report = ServerReport {
            threads_requested,
            threads_started,
            drained_messages: outcome.drained_messages,
            reason: self.coordinator.reason(),
        };
        info!(
            "dispatch server stopped: {} of {} threads ran, {} messages returned unprocessed",
            report.threads_started, report.threads_requested, report.drained_messages
        );
        report
    }
}
