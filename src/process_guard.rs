//! Lifecycle management for handler subprocesses
//!
//! Handlers shell out to provisioning tools that may run for a long time.
//! If stagehand is interrupted mid-stage those tools must not keep mutating
//! infrastructure behind the user's back, so every handler process:
//!
//! - runs in its own process group (so its children can be signalled too)
//! - gets `PR_SET_PDEATHSIG` so it receives SIGTERM if stagehand dies
//! - is tracked in a global registry that the signal handler drains
//!
//! Termination sends SIGTERM to each group, waits for a grace period, then
//! SIGKILLs whatever is left.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Global registry of handler process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL on normal shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Grace period when a signal asked us to stop
const SIGNAL_GRACE: Duration = Duration::from_secs(3);

/// Handler processes and scratch files owned by the current run.
///
/// The signal thread drains this before exiting, since `process::exit`
/// skips destructors.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    scratch_files: HashSet<PathBuf>,
    /// Set once termination started so concurrent exit paths don't repeat it
    cleanup_initiated: bool,
}

impl ChildRegistry {
    /// Process-wide registry shared by `run_command` and the signal thread
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("registered handler process {}", pid);
    }

    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("unregistered handler process {}", pid);
    }

    /// Number of handler processes still tracked
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Track a file to delete if a signal ends the run
    pub fn register_scratch_file(&mut self, path: &Path) {
        self.scratch_files.insert(path.to_path_buf());
    }

    pub fn unregister_scratch_file(&mut self, path: &Path) {
        self.scratch_files.remove(path);
    }

    /// Delete every tracked scratch file, ignoring ones already gone
    pub fn remove_scratch_files(&mut self) {
        for path in self.scratch_files.drain() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {}", path.display(), e),
            }
        }
    }

    /// Stop every tracked handler.
    ///
    /// Each process group gets SIGTERM; groups still alive after
    /// `grace_period` get SIGKILL. Runs at most once per registry.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.cleanup_initiated {
            debug!("cleanup already initiated, skipping");
            return;
        }
        self.cleanup_initiated = true;

        if self.pids.is_empty() {
            return;
        }

        info!("stopping {} running handler(s)", self.pids.len());

        let pids: Vec<u32> = self.pids.iter().copied().collect();
        for &pid in &pids {
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!("SIGTERM to handler group {} failed: {}", pid, e);
                if let Err(e) = send_signal(pid, Signal::SIGTERM) {
                    warn!("SIGTERM to handler {} failed: {}", pid, e);
                }
            }
        }

        let deadline = Instant::now() + grace_period;
        while Instant::now() < deadline {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                info!("all handlers stopped");
                self.pids.clear();
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for pid in pids.into_iter().filter(|&pid| is_process_alive(pid)) {
            warn!("handler group {} still running, sending SIGKILL", pid);
            if let Err(e) = send_signal_to_group(pid, Signal::SIGKILL) {
                error!("SIGKILL to handler group {} failed: {}", pid, e);
                let _ = send_signal(pid, Signal::SIGKILL);
            }
        }

        self.pids.clear();
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Negative PID addresses the whole process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Alive means the PID exists and is not a zombie
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the process state
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        if let Some(state) = stat.split_whitespace().nth(2) {
            return !matches!(state, "Z" | "X");
        }
    }

    true
}

/// RAII guard that terminates all handler processes on drop
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(SHUTDOWN_GRACE);
        }
    }
}

/// Install SIGINT/SIGTERM/SIGHUP handlers that kill handler processes and exit.
///
/// Call once at program start.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };
            warn!(
                "received {}, stopping handlers - the databag is saved up to the last completed file",
                name
            );

            // Held until exit: run_command must not report the killed handler
            let registry = ChildRegistry::global();
            let mut guard = registry.lock().ok();
            if let Some(registry) = guard.as_mut() {
                registry.terminate_all(SIGNAL_GRACE);
                registry.remove_scratch_files();
            }

            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait putting a command in its own process group
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe functions (setpgid, prctl)
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }
}
