//! Handler subprocess execution
//!
//! `run_command` is the single place stagehand spawns external programs.
//! Every child:
//!
//! - runs in a new process group with a parent-death signal
//! - is registered with [`ChildRegistry`] while it runs
//! - has its output captured and echoed to the log line by line
//!
//! A non-zero exit is not an error here; callers decide with
//! [`CommandOutput::ensure_success`] or by inspecting `success`, since an
//! existence check legitimately exits non-zero.

use crate::error::{Result, StagehandError};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use crate::script_traits::CommandArgs;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Spawn the described command, wait for it and capture its output.
///
/// # Errors
///
/// Returns a handler error when the program cannot be spawned or waited on.
pub fn run_command<T: CommandArgs>(args: &T) -> Result<CommandOutput> {
    let program = args.program();
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();

    debug!(
        "run_command: {} args={:?} ({} env vars)",
        program,
        cli_args,
        env_vars.len()
    );

    let mut cmd = Command::new(program);
    cmd.args(&cli_args)
        .envs(env_vars)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    if let Some(dir) = args.working_dir() {
        cmd.current_dir(dir);
    }

    let child = cmd
        .spawn()
        .map_err(|e| StagehandError::handler(program, format!("failed to spawn: {}", e)))?;
    let pid = child.id();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid);
    }

    let waited = child.wait_with_output();

    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let output = waited
        .map_err(|e| StagehandError::handler(program, format!("failed waiting: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    for line in stdout.lines().chain(stderr.lines()) {
        info!("  {}", line);
    }

    let exit_code = output.status.code();
    debug!("{} exited with {:?}", program, exit_code);

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        success: output.status.success(),
    })
}

/// Output from a handler subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Turn a failed exit into a handler error attributed to `file`
    pub fn ensure_success(&self, file: &Path) -> Result<()> {
        if self.success {
            return Ok(());
        }

        let code = self
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let detail = self.stderr.trim();
        let reason = if detail.is_empty() {
            format!("exited with {}", code)
        } else {
            format!("exited with {}: {}", code, detail)
        };
        Err(StagehandError::handler(file, reason))
    }
}
