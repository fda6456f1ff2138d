// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io::Write;

use crate::global_config::LogVerbosity;

/// Installs env_logger. `RUST_LOG` takes precedence over the default `info` filter.
///
/// Worker threads log concurrently; env_logger writes each record as one line.
pub fn init_logging(verbosity: LogVerbosity) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    match verbosity {
        LogVerbosity::Terse => {
            builder.format(|buf, record| writeln!(buf, "{}: {}", record.level(), record.args()));
        }
        LogVerbosity::Default => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {}] ({}:{}) {}",
                    buf.timestamp(),
                    record.level(),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            });
        }
        LogVerbosity::Verbose => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {} {}] ({}:{}, {}) {}",
                    buf.timestamp_micros(),
                    record.level(),
                    std::thread::current().name().unwrap_or("-"),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.module_path().unwrap_or("?"),
                    record.args()
                )
            });
        }
    }

    // a second init (e.g. an embedding binary already installed a logger) is not an error
    let _ = builder.try_init();
}
