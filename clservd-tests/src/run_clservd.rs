// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::{
    io::{BufRead, BufReader},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::{self, Receiver},
    thread,
    time::{Duration, Instant},
};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Printed once every server thread was created.
pub const READY_LINE: &str = "of server threads are up";

/// A clservd process started via cargo run. Killed on drop if still alive.
pub struct ClservdGuard {
    child: Child,
    lines: Receiver<String>,
    seen: Vec<String>,
}

impl ClservdGuard {
    /// Small default sizes are added unless the caller passes `--config`,
    /// whose file values they would override.
    pub fn start(args: &[&str]) -> Self {
        println!("Executing clservd located via cargo run");
        let defaults: &[&str] = if args.contains(&"--config") {
            &[]
        } else {
            &["--shmem-size-mb", "4", "--device-max-alloc-mb", "1"]
        };
        let mut child = Command::new("cargo")
            .args(["run", "-q", "-p", "clservd", "--"])
            .args(defaults)
            .args(args)
            .env("RUST_LOG", "info")
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start clservd");

        let stderr = child.stderr.take().expect("stderr is piped");
        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                println!("clservd: {line}");
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Self {
            child,
            lines,
            seen: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Waits for a log line containing `needle`. The first run may have to compile.
    pub fn wait_for_line(&mut self, needle: &str, timeout: Duration) -> bool {
        if self.seen.iter().any(|line| line.contains(needle)) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.lines.recv_timeout(left) {
                Ok(line) => {
                    let found = line.contains(needle);
                    self.seen.push(line);
                    if found {
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
        false
    }

    pub fn wait_until_ready(&mut self) -> bool {
        self.wait_for_line(READY_LINE, Duration::from_secs(300))
    }

    pub fn send(&self, sig: Signal) -> nix::Result<()> {
        signal::kill(self.pid(), sig)
    }

    /// Waits for the process to exit on its own.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Some(status);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }

    /// Every log line read so far, after draining what is pending.
    pub fn log(&mut self) -> &[String] {
        while let Ok(line) = self.lines.try_recv() {
            self.seen.push(line);
        }
        &self.seen
    }
}

impl Drop for ClservdGuard {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        let pid = self.pid();

        // First: SIGTERM
        let _ = signal::kill(pid, Signal::SIGTERM);

        for _ in 0..10 {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }

        // Still alive -> SIGKILL
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = self.child.wait();
    }
}
