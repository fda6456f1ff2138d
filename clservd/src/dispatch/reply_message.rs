// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::context::DeviceSet;
use crate::dispatch::message::Message;
use crate::error::ServerError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    Queued,
    Done,
    Failed(ServerError),
}

type SyncStatus = Arc<(Mutex<MessageStatus>, Condvar)>;
type WorkFn = Box<dyn FnOnce(usize, &DeviceSet) -> anyhow::Result<()> + Send + 'static>;

/// A message whose producer waits for the outcome through a [`Reply`].
pub struct ReplyMessage {
    desc: String,
    device_index: usize,
    // taken by process()
    work: Option<WorkFn>,
    sync_status: SyncStatus,
}

/// Producer side of a [`ReplyMessage`].
#[derive(Clone, Debug)]
pub struct Reply {
    sync_status: SyncStatus,
}

impl ReplyMessage {
    pub fn new(
        desc: impl Into<String>,
        device_index: usize,
        work: Box<dyn FnOnce(usize, &DeviceSet) -> anyhow::Result<()> + Send + 'static>,
    ) -> (Self, Reply) {
        let sync_status = Arc::new((Mutex::new(MessageStatus::Queued), Condvar::new()));
        let reply = Reply {
            sync_status: sync_status.clone(),
        };
        let message = Self {
            desc: desc.into(),
            device_index,
            work: Some(work),
            sync_status,
        };
        (message, reply)
    }
}

fn publish(sync_status: &SyncStatus, status: MessageStatus) {
    let (lock, cvar) = &**sync_status;
    let mut current = lock.lock().unwrap_or_else(PoisonError::into_inner);
    *current = status;
    cvar.notify_all();
}

impl Message for ReplyMessage {
    fn desc(&self) -> &str {
        &self.desc
    }

    fn device_index(&self) -> usize {
        self.device_index
    }

    fn process(mut self: Box<Self>, devices: &DeviceSet) {
        let Some(work) = self.work.take() else {
            return;
        };
        // a panic in `work` unwinds through here and Drop reports the failure
        let status = match work(self.device_index, devices) {
            Ok(()) => MessageStatus::Done,
            Err(e) => {
                log::debug!("{}: processing failed: {e:#}", self.desc);
                MessageStatus::Failed(ServerError::ProcessingFailed(format!("{e:#}")))
            }
        };
        publish(&self.sync_status, status);
    }

    fn fail(self: Box<Self>, error: ServerError) {
        publish(&self.sync_status, MessageStatus::Failed(error));
    }
}

/// A message dropped without an outcome (its work panicked, or it was simply
/// discarded) must not leave its producer waiting.
impl Drop for ReplyMessage {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.sync_status;
        let mut status = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if *status != MessageStatus::Queued {
            return;
        }
        let reason = if std::thread::panicking() {
            "processing panicked"
        } else {
            "dropped before it was processed"
        };
        log::debug!("{}: {reason}", self.desc);
        *status = MessageStatus::Failed(ServerError::ProcessingFailed(reason.into()));
        cvar.notify_all();
    }
}

impl Reply {
    pub fn status(&self) -> MessageStatus {
        let (lock, _) = &*self.sync_status;
        lock.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Blocks until the message was processed or handed back.
    pub fn wait(&self) -> MessageStatus {
        // pattern is described on https://doc.rust-lang.org/stable/std/sync/struct.Condvar.html
        let (lock, cvar) = &*self.sync_status;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = cvar
            .wait_while(guard, |status| *status == MessageStatus::Queued)
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// Like `wait`, but gives up after `timeout` and returns `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<MessageStatus> {
        let (lock, cvar) = &*self.sync_status;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, result) = cvar
            .wait_timeout_while(guard, timeout, |status| *status == MessageStatus::Queued)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            None
        } else {
            Some(guard.clone())
        }
    }
}
