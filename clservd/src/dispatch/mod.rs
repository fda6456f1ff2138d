// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: shared server queue
//!
//! ## Overview
//! Producers submit work items ("messages") to one process-wide queue, and a
//! pool of worker threads drains it.
//!
//! - The producer picks the target device (via the scheduler) before enqueueing.
//! - Every message carries its own processing and failure behaviour; the queue
//!   does not know what kind of work it holds.
//! - A message is consumed exactly once: processed by one worker, or failed.
//! - Blocking dequeues are woken by a cancellation token on shutdown.
//! - Closing the queue fails every message still queued, and every message
//!   enqueued afterwards, with `QueueClosed`.
//!
//!   producers --enqueue--> +--------------+ --dequeue--> worker 0 -> process()
//!                          | server queue | --dequeue--> worker 1 -> process()
//!                          +------+-------+ --dequeue--> worker n -> process()
//!                                 |
//!                               close() --> fail(QueueClosed)

pub mod cancel;
pub mod closure_message;
pub mod message;
pub mod reply_message;
pub mod server_queue;
