// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

#[cfg(feature = "requires-daemon")]
use std::time::Duration;

#[cfg(feature = "requires-daemon")]
use clservd_tests::run_clservd::ClservdGuard;
#[cfg(feature = "requires-daemon")]
use nix::sys::signal::Signal;

#[cfg(feature = "requires-daemon")]
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(feature = "requires-daemon")]
#[test]
fn test_sigterm_stops_cleanly() {
    let mut clservd = ClservdGuard::start(&["--num-threads", "3"]);
    assert!(clservd.wait_until_ready(), "clservd did not come up");
    assert!(clservd.wait_for_line("3 of server threads are up", Duration::from_secs(1)));

    clservd.send(Signal::SIGTERM).expect("failed to send SIGTERM");
    let status = clservd
        .wait_for_exit(EXIT_TIMEOUT)
        .expect("clservd did not stop after SIGTERM");
    assert_eq!(status.code(), Some(0));

    assert!(clservd.wait_for_line("Got SIGTERM", Duration::from_secs(1)));
    assert!(clservd.wait_for_line("Stopping dispatch server", Duration::from_secs(1)));
    assert!(clservd.wait_for_line("3 server threads joined", Duration::from_secs(1)));
}

#[cfg(feature = "requires-daemon")]
#[test]
fn test_sighup_stops_like_sigterm() {
    let mut clservd = ClservdGuard::start(&["--num-threads", "2", "--log-verbosity", "terse"]);
    assert!(clservd.wait_until_ready(), "clservd did not come up");

    clservd.send(Signal::SIGHUP).expect("failed to send SIGHUP");
    let status = clservd
        .wait_for_exit(EXIT_TIMEOUT)
        .expect("clservd did not stop after SIGHUP");
    assert_eq!(status.code(), Some(0));
    assert!(clservd.wait_for_line("Got SIGHUP", Duration::from_secs(1)));
}

#[cfg(feature = "requires-daemon")]
#[test]
fn test_repeated_sigterm() {
    let mut clservd = ClservdGuard::start(&["--num-threads", "4"]);
    assert!(clservd.wait_until_ready(), "clservd did not come up");

    clservd.send(Signal::SIGTERM).expect("failed to send SIGTERM");
    // the process may already be gone
    let _ = clservd.send(Signal::SIGTERM);

    let status = clservd
        .wait_for_exit(EXIT_TIMEOUT)
        .expect("clservd did not stop after SIGTERM");
    assert_eq!(status.code(), Some(0));
    let stops = clservd
        .log()
        .iter()
        .filter(|line| line.contains("Stopping dispatch server"))
        .count();
    assert_eq!(stops, 1);
}

#[cfg(feature = "requires-daemon")]
#[test]
fn test_config_file() {
    let path = std::env::temp_dir().join(format!("clservd-test-{}.json", std::process::id()));
    let config = serde_json::json!({
        "num_threads": 2,
        "shmem_size_mb": 3,
        "device_max_alloc_mb": [1, 2],
    });
    std::fs::write(&path, config.to_string()).expect("failed to write config");

    let mut clservd = ClservdGuard::start(&["--config", path.to_str().unwrap()]);
    assert!(clservd.wait_until_ready(), "clservd did not come up");
    // every value comes from the file: 2 devices, 1 MB zones over 3 MB, 2 threads
    assert!(clservd.wait_for_line("2 devices discovered", Duration::from_secs(1)));
    assert!(clservd.wait_for_line("3 zones pinned", Duration::from_secs(1)));
    assert!(clservd.wait_for_line("2 of server threads are up", Duration::from_secs(1)));

    clservd.send(Signal::SIGTERM).expect("failed to send SIGTERM");
    assert_eq!(
        clservd.wait_for_exit(EXIT_TIMEOUT).and_then(|s| s.code()),
        Some(0)
    );
    let _ = std::fs::remove_file(path);
}

#[cfg(feature = "requires-daemon")]
#[test]
fn test_invalid_config_exits_with_2() {
    let path = std::env::temp_dir().join(format!("clservd-bad-{}.json", std::process::id()));
    std::fs::write(&path, r#"{ "num_threads": 1, "no_such_option": true }"#)
        .expect("failed to write config");

    let mut clservd = ClservdGuard::start(&["--config", path.to_str().unwrap()]);
    let status = clservd
        .wait_for_exit(Duration::from_secs(300))
        .expect("clservd did not exit");
    assert_eq!(status.code(), Some(2));
    let _ = std::fs::remove_file(path);
}
