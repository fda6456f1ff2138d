// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::server::ServerSettings;

const MB_SHIFT: u32 = 20;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// JSON file with a server configuration. Explicit flags override its values.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of server threads (0 = one per online processor)
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=2147483647))]
    pub num_threads: Option<u32>,

    /// Size of the shared memory segment in MB
    #[arg(long = "shmem-size-mb", value_name = "MB")]
    pub shmem_size_mb: Option<u64>,

    /// Max allocation size of a simulated device in MB. Repeat for more devices.
    #[arg(long = "device-max-alloc-mb", value_name = "MB")]
    pub device_max_alloc_mb: Vec<u64>,

    /// Page-lock the zones of the shared memory segment
    #[arg(long)]
    pub lock_pages: bool,

    /// How much source location is printed with each log line
    #[arg(long, value_enum)]
    pub log_verbosity: Option<LogVerbosity>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogVerbosity {
    /// Level and message only
    Terse,
    #[default]
    /// Prefix with file and line
    Default,
    /// Prefix with file, line and module
    Verbose,
}

/// Server configuration. Only read at process start.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub num_threads: u32,
    pub shmem_size_mb: u64,
    pub device_max_alloc_mb: Vec<u64>,
    pub lock_pages: bool,
    pub log_verbosity: LogVerbosity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            shmem_size_mb: 256,
            device_max_alloc_mb: vec![128],
            lock_pages: false,
            log_verbosity: LogVerbosity::Default,
        }
    }
}

impl ServerConfig {
    /// Max allocation size of each simulated device, in bytes.
    pub fn device_max_alloc_bytes(&self) -> Result<Vec<u64>, String> {
        self.device_max_alloc_mb
            .iter()
            .map(|mb| {
                mb.checked_shl(MB_SHIFT)
                    .filter(|bytes| bytes >> MB_SHIFT == *mb)
                    .ok_or_else(|| format!("device max alloc of {mb} MB is too large"))
            })
            .collect()
    }

    pub fn settings(&self) -> Result<ServerSettings, String> {
        let shmem_size = self
            .shmem_size_mb
            .checked_shl(MB_SHIFT)
            .filter(|bytes| bytes >> MB_SHIFT == self.shmem_size_mb)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| {
                format!(
                    "shared memory size of {} MB is too large",
                    self.shmem_size_mb
                )
            })?;
        Ok(ServerSettings {
            num_threads: self.num_threads as usize,
            shmem_size,
        })
    }
}

/// Reads the config file (if any) and applies the flags given on the command line.
pub fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(num_threads) = args.num_threads {
        config.num_threads = num_threads;
    }
    if let Some(shmem_size_mb) = args.shmem_size_mb {
        config.shmem_size_mb = shmem_size_mb;
    }
    if !args.device_max_alloc_mb.is_empty() {
        config.device_max_alloc_mb = args.device_max_alloc_mb.clone();
    }
    if args.lock_pages {
        config.lock_pages = true;
    }
    if let Some(verbosity) = args.log_verbosity {
        config.log_verbosity = verbosity;
    }
    Ok(config)
}

pub fn validate_config(config: &ServerConfig) -> Result<(), String> {
    if config.num_threads > i32::MAX as u32 {
        return Err(format!(
            "num_threads must be in [0, {}], got {}",
            i32::MAX,
            config.num_threads
        ));
    }
    if config.shmem_size_mb == 0 {
        return Err("shmem_size_mb must be greater than zero".into());
    }
    if config.device_max_alloc_mb.is_empty() {
        return Err("at least one device is required".into());
    }
    if config.device_max_alloc_mb.contains(&0) {
        return Err("device max alloc must be greater than zero".into());
    }
    config.device_max_alloc_bytes()?;
    config.settings()?;
    Ok(())
}
