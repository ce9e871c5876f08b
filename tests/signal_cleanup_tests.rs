//! Integration tests for handler process cleanup
//!
//! These tests verify that:
//! 1. Handler processes spawned with in_new_process_group() can be killed as a tree
//! 2. A signalled stagehand takes its running handler (and its children) down with it
//! 3. The per-run scratch file is removed when a signal ends the run
//! 4. The binary exits non-zero on errors

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use stagehand::process_guard::CommandProcessGroup;

/// Alive means the PID exists and is not a zombie
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
        if let Some(state) = stat.split_whitespace().nth(2) {
            return !matches!(state, "Z" | "X");
        }
    }

    true
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

// =============================================================================
// Process group mechanics
// =============================================================================

#[test]
fn test_group_signal_kills_handler_children() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");

    let mut parent = Command::new("bash")
        .arg("-c")
        .arg(format!("sleep 1000 & echo $! > {}; wait", pid_file.display()))
        .stdin(Stdio::null())
        .in_new_process_group()
        .spawn()
        .expect("spawn bash");

    assert!(wait_until(Duration::from_secs(5), || read_pid(&pid_file).is_some()));
    let child_pid = read_pid(&pid_file).unwrap();
    assert!(is_process_alive(child_pid));

    kill(Pid::from_raw(-(parent.id() as i32)), Signal::SIGTERM).unwrap();
    let _ = parent.wait();

    assert!(
        wait_until(Duration::from_secs(3), || !is_process_alive(child_pid)),
        "grandchild should die with its process group"
    );
}

// =============================================================================
// Binary behaviour
// =============================================================================

#[test]
fn test_sigterm_stops_running_handler() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("stacks/0005");
    fs::create_dir_all(&first).unwrap();
    fs::write(first.join("quick.sh"), "exit 0\n").unwrap();
    let stage = dir.path().join("stacks/0010");
    fs::create_dir_all(&stage).unwrap();
    fs::write(
        stage.join("slow.sh"),
        "sleep 1000 &\necho $! > sleep.pid\nwait\n",
    )
    .unwrap();

    let mut stagehand = Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .args(["--root"])
        .arg(dir.path())
        .args(["up"])
        .arg(dir.path().join("stacks"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn stagehand");

    let pid_file = stage.join("sleep.pid");
    assert!(
        wait_until(Duration::from_secs(10), || read_pid(&pid_file).is_some()),
        "handler script never started"
    );
    let sleep_pid = read_pid(&pid_file).unwrap();
    assert!(is_process_alive(sleep_pid));

    kill(Pid::from_raw(stagehand.id() as i32), Signal::SIGTERM).unwrap();
    let status = stagehand.wait().unwrap();
    assert_eq!(status.code(), Some(128 + 15));

    assert!(
        wait_until(Duration::from_secs(5), || !is_process_alive(sleep_pid)),
        "handler child should be terminated with stagehand"
    );

    // The databag saved after the first stage survives, the scratch file does not
    let saved = fs::read_to_string(dir.path().join(".env/output_databag.yaml")).unwrap();
    let intermediate = saved
        .lines()
        .find_map(|line| line.strip_prefix("intermediate_databag_file: "))
        .expect("intermediate path persisted");
    assert!(!Path::new(intermediate.trim_matches('\'')).exists());
}

#[test]
fn test_errors_exit_with_status_one() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .arg("--root")
        .arg(dir.path())
        .arg("up")
        .arg(dir.path().join("missing"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_successful_run_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let stage = dir.path().join("stacks/0010");
    fs::create_dir_all(&stage).unwrap();
    fs::write(stage.join("ok.sh"), "exit 0\n").unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_stagehand"))
        .arg("--root")
        .arg(dir.path())
        .arg("up")
        .arg(dir.path().join("stacks"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());
    assert!(dir.path().join(".env/output_databag.yaml").exists());
}
