// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::atomic::{AtomicBool, Ordering};

use async_channel::{Receiver, Sender};
use futures::executor::block_on;
use futures::future::{self, Either};
use futures::pin_mut;
use log::{debug, info};

use crate::dispatch::cancel::CancellationToken;
use crate::dispatch::message::Message;
use crate::error::ServerError;

/// The process-wide queue between producers and server threads. FIFO.
#[derive(Debug)]
pub struct ServerQueue {
    tx: Sender<Box<dyn Message>>,
    rx: Receiver<Box<dyn Message>>,
    cancel: CancellationToken,
    closing: AtomicBool,
}

impl ServerQueue {
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            cancel,
            closing: AtomicBool::new(false),
        }
    }

    /// Token that wakes blocked dequeues. It doubles as the shutdown flag.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Appends a message. Once `close` has begun the message is failed with
    /// `QueueClosed` right away, including re-submissions from a message that
    /// is still being processed.
    pub fn enqueue(&self, message: Box<dyn Message>) -> Result<(), ServerError> {
        if self.closing.load(Ordering::SeqCst) {
            debug!("rejecting {}: queue is closing", message.desc());
            message.fail(ServerError::QueueClosed);
            return Err(ServerError::QueueClosed);
        }
        // unbounded, so this only fails on a closed channel
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = e.into_inner();
                debug!("rejecting {}: queue is closed", message.desc());
                message.fail(ServerError::QueueClosed);
                Err(ServerError::QueueClosed)
            }
        }
    }

    /// Blocks until a message arrives. Returns `None` once the token is
    /// cancelled or the queue is closed and empty.
    pub fn dequeue(&self) -> Option<Box<dyn Message>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let recv = self.rx.recv();
        let cancelled = self.cancel.cancelled();
        pin_mut!(recv, cancelled);

        match block_on(future::select(recv, cancelled)) {
            Either::Left((Ok(message), _)) => Some(message),
            Either::Left((Err(_closed), _)) => None,
            Either::Right(((), _)) => None,
        }
    }

    /// Wakes every blocked `dequeue`. Queued messages stay where they are.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Closes the queue and fails every message still in it with `QueueClosed`.
    /// Returns the number of failed messages; later calls return 0.
    pub fn close(&self) -> usize {
        if self.closing.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.rx.close();

        let mut drained = 0;
        while let Ok(message) = self.rx.try_recv() {
            debug!("returning unprocessed {}", message.desc());
            message.fail(ServerError::QueueClosed);
            drained += 1;
        }
        info!("server queue closed, {drained} unprocessed messages returned");
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
