// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

// Starts a dispatch server in-process, pushes a burst of work items from a few
// producer threads and prints where each one ran.

use std::thread;

use accel_runtime::HostRuntime;
use anyhow::Context;
use clservd::{MessageStatus, ReplyMessage, Server, ServerSettings, ShutdownReason};
use log::info;

const PRODUCERS: usize = 3;
const ITEMS_PER_PRODUCER: usize = 8;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // three devices with different allocation limits; the smallest sets the zone length
    let runtime = HostRuntime::new(&[4 << 20, 2 << 20, 8 << 20]);
    let settings = ServerSettings {
        num_threads: 4,
        shmem_size: 10 << 20,
    };
    let server = Server::start(&runtime, runtime.discover_devices(), &settings)
        .context("failed to start dispatch server")?;
    info!(
        "{} zones of {} bytes pinned",
        server.zones().len(),
        server.zones().zone_length()
    );

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let producer = server.producer();
            thread::spawn(move || {
                let mut replies = Vec::with_capacity(ITEMS_PER_PRODUCER);
                for i in 0..ITEMS_PER_PRODUCER {
                    let device = producer.select_device();
                    let (message, reply) = ReplyMessage::new(
                        format!("burst {p}.{i}"),
                        device,
                        Box::new(move |device, devices| {
                            let name = devices
                                .device(device)
                                .map(|d| d.name.as_str())
                                .unwrap_or("?");
                            println!("producer {p} item {i} ran on {name}");
                            Ok(())
                        }),
                    );
                    producer.enqueue(Box::new(message))?;
                    replies.push(reply);
                }
                let done = replies
                    .iter()
                    .filter(|reply| reply.wait() == MessageStatus::Done)
                    .count();
                Ok::<_, clservd::ServerError>(done)
            })
        })
        .collect();

    let mut done = 0;
    for producer in producers {
        done += producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    }
    println!("{done} of {} items done", PRODUCERS * ITEMS_PER_PRODUCER);

    server.request_shutdown(ShutdownReason::Terminate);
    let report = server.wait_for_shutdown();
    println!("{report:?}");
    Ok(())
}
