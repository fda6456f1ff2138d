// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};

use crate::context::DeviceSet;
use crate::dispatch::server_queue::ServerQueue;

/// Creates the OS threads of the pool. A seam for tests that need spawning to fail.
pub trait ThreadSpawner {
    fn spawn(
        &mut self,
        index: usize,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadSpawner;

impl ThreadSpawner for OsThreadSpawner {
    fn spawn(
        &mut self,
        index: usize,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("clserv-{index}"))
            .spawn(body)
    }
}

/// Number of online processors as reported by sysconf(3), if known.
pub fn online_processors() -> Option<usize> {
    // SAFETY: sysconf has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    usize::try_from(n).ok().filter(|n| *n > 0)
}

/// `configured` threads, or one per processor when it is 0 (at least one).
pub fn resolve_thread_count(
    configured: usize,
    processors: impl FnOnce() -> Option<usize>,
) -> usize {
    if configured > 0 {
        return configured;
    }
    processors().unwrap_or(1).max(1)
}

/// Main loop of a server thread. Each message brings its own processing, so
/// all we do here is call it. A panicking message is logged and the thread
/// keeps serving.
fn event_loop(worker: usize, queue: Arc<ServerQueue>, devices: Arc<DeviceSet>) {
    let shutdown = queue.cancellation().clone();
    debug!("server thread {worker} started");
    while !shutdown.is_cancelled() {
        let Some(message) = queue.dequeue() else {
            continue;
        };
        let desc = message.desc().to_string();
        debug!(
            "server thread {worker}: {desc} on device {}",
            message.device_index()
        );
        // the message is consumed either way, nothing observes it half-processed
        if panic::catch_unwind(AssertUnwindSafe(|| message.process(&devices))).is_err() {
            error!("server thread {worker}: processing of {desc} panicked");
        }
    }
    debug!("server thread {worker} exiting");
}

#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    requested: usize,
    spawn_error: Option<io::Error>,
}

impl WorkerPool {
    /// Starts up to `num_threads` server threads. Stops at the first spawn
    /// failure; the threads started so far keep running until shutdown.
    pub fn launch(
        num_threads: usize,
        queue: Arc<ServerQueue>,
        devices: Arc<DeviceSet>,
        spawner: &mut dyn ThreadSpawner,
    ) -> Self {
        // grows with the threads actually started; num_threads may be up to i32::MAX
        let mut handles = Vec::new();
        let mut spawn_error = None;

        for index in 0..num_threads {
            let queue = queue.clone();
            let devices = devices.clone();
            match spawner.spawn(index, Box::new(move || event_loop(index, queue, devices))) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("failed to create server thread {index} of {num_threads}: {e}");
                    spawn_error = Some(e);
                    break;
                }
            }
        }

        Self {
            handles,
            requested: num_threads,
            spawn_error,
        }
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn started(&self) -> usize {
        self.handles.len()
    }

    pub fn spawn_error(&self) -> Option<&io::Error> {
        self.spawn_error.as_ref()
    }

    /// Joins every started thread, last started first. Returns how many were joined.
    pub fn join(self) -> usize {
        let mut joined = 0;
        for handle in self.handles.into_iter().rev() {
            let name = handle.thread().name().unwrap_or("?").to_string();
            match handle.join() {
                Ok(()) => joined += 1,
                Err(_) => error!("server thread {name} panicked"),
            }
        }
        info!("{joined} server threads joined");
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::cancel::CancellationToken;
    use crate::dispatch::closure_message::ClosureMessage;
    use crate::dispatch::reply_message::{MessageStatus, ReplyMessage};
    use crate::error::ServerError;
    use crate::test_support::FailingSpawner;
    use accel_runtime::HostRuntime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn devices() -> Arc<DeviceSet> {
        let runtime = HostRuntime::new(&[1 << 20, 1 << 20]);
        Arc::new(DeviceSet::create(&runtime, runtime.discover_devices()).unwrap())
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn thread_count_resolution() {
        assert_eq!(resolve_thread_count(3, || Some(16)), 3);
        assert_eq!(resolve_thread_count(0, || Some(6)), 6);
        assert_eq!(resolve_thread_count(0, || None), 1);
        assert_eq!(resolve_thread_count(0, || Some(0)), 1);
    }

    #[test]
    fn host_reports_processors() {
        assert!(online_processors().unwrap_or(1) >= 1);
    }

    #[test]
    fn workers_process_and_stop_on_cancel() {
        let queue = Arc::new(ServerQueue::new(CancellationToken::new()));
        let processed = Arc::new(AtomicUsize::new(0));
        let pool = WorkerPool::launch(3, queue.clone(), devices(), &mut OsThreadSpawner);
        assert_eq!(pool.started(), 3);

        for i in 0..20 {
            let processed = processed.clone();
            queue
                .enqueue(Box::new(ClosureMessage::new(
                    format!("msg {i}"),
                    i % 2,
                    Box::new(move |device, devices| {
                        assert!(devices.queue(device).is_some());
                        processed.fetch_add(1, Ordering::SeqCst);
                    }),
                    Box::new(|e| panic!("unexpected failure: {e}")),
                )))
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || processed
            .load(Ordering::SeqCst)
            == 20));

        queue.cancel_all();
        assert_eq!(pool.join(), 3);
    }

    #[test]
    fn failing_message_does_not_stop_worker() {
        let queue = Arc::new(ServerQueue::new(CancellationToken::new()));
        let pool = WorkerPool::launch(1, queue.clone(), devices(), &mut OsThreadSpawner);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (bad, bad_reply) = ReplyMessage::new(
            "bad",
            0,
            Box::new(|_, _| anyhow::bail!("broken kernel")),
        );
        queue.enqueue(Box::new(bad)).unwrap();
        let seen_ok = seen.clone();
        queue
            .enqueue(Box::new(ClosureMessage::new(
                "good",
                0,
                Box::new(move |_, _| seen_ok.lock().unwrap().push("good")),
                Box::new(|_| {}),
            )))
            .unwrap();

        assert!(matches!(bad_reply.wait(), MessageStatus::Failed(_)));
        assert!(wait_until(Duration::from_secs(5), || !seen
            .lock()
            .unwrap()
            .is_empty()));

        queue.cancel_all();
        assert_eq!(pool.join(), 1);
    }

    #[test]
    fn panicking_message_does_not_stop_worker() {
        let queue = Arc::new(ServerQueue::new(CancellationToken::new()));
        let pool = WorkerPool::launch(1, queue.clone(), devices(), &mut OsThreadSpawner);

        let (bad, bad_reply) = ReplyMessage::new(
            "panics",
            0,
            Box::new(|_, _| panic!("kernel launch blew up")),
        );
        let (good, good_reply) = ReplyMessage::new("after panic", 0, Box::new(|_, _| Ok(())));
        queue.enqueue(Box::new(bad)).unwrap();
        queue.enqueue(Box::new(good)).unwrap();

        assert!(matches!(
            bad_reply.wait_timeout(Duration::from_secs(5)),
            Some(MessageStatus::Failed(ServerError::ProcessingFailed(_)))
        ));
        assert_eq!(
            good_reply.wait_timeout(Duration::from_secs(5)),
            Some(MessageStatus::Done)
        );

        queue.cancel_all();
        assert_eq!(pool.join(), 1);
    }

    #[test]
    fn spawn_failure_keeps_started_threads() {
        let queue = Arc::new(ServerQueue::new(CancellationToken::new()));
        let mut spawner = FailingSpawner::fail_at(2);
        let pool = WorkerPool::launch(5, queue.clone(), devices(), &mut spawner);

        assert_eq!(spawner.attempts, 3);
        assert_eq!(pool.requested(), 5);
        assert_eq!(pool.started(), 2);
        assert!(pool.spawn_error().is_some());

        queue.cancel_all();
        assert_eq!(pool.join(), 2);
    }

    #[test]
    fn largest_thread_count_stops_at_spawn_failure() {
        let queue = Arc::new(ServerQueue::new(CancellationToken::new()));
        let mut spawner = FailingSpawner::fail_at(2);
        let pool = WorkerPool::launch(i32::MAX as usize, queue.clone(), devices(), &mut spawner);

        assert_eq!(pool.requested(), i32::MAX as usize);
        assert_eq!(pool.started(), 2);
        assert!(pool.spawn_error().is_some());

        queue.cancel_all();
        assert_eq!(pool.join(), 2);
    }

    #[test]
    fn zero_threads_joins_nothing() {
        let queue = Arc::new(ServerQueue::new(CancellationToken::new()));
        let pool = WorkerPool::launch(0, queue, devices(), &mut FailingSpawner::never());
        assert_eq!(pool.started(), 0);
        assert_eq!(pool.join(), 0);
    }
}
