//! Typed argument contracts for handler subprocesses.
//!
//! Handlers never assemble `Command` values themselves. They describe the
//! invocation with a struct implementing [`CommandArgs`] and hand it to
//! [`crate::script_runner::run_command`], which owns spawning, process-group
//! isolation and PID registration.

use std::path::Path;

/// Trait for a typed subprocess invocation.
///
/// # Contract
///
/// - `program()`: executable name or path, resolved through `PATH` when bare.
/// - `to_cli_args()`: arguments exactly as the program expects them.
/// - `get_env_vars()`: variables added on top of the inherited environment.
/// - `working_dir()`: directory to run in, `None` for the current one.
///
/// # Example
///
/// ```ignore
/// use stagehand::handlers::script::ScriptInvocation;
/// use stagehand::script_runner::run_command;
///
/// let script = Path::new("stages/0010/vpc.sh");
/// let invocation = ScriptInvocation::new(script, Verb::Up, &databag);
/// let output = run_command(&invocation)?;  // bash vpc.sh up, databag as env
/// output.ensure_success(script)?;
/// ```
pub trait CommandArgs {
    /// Executable to spawn
    fn program(&self) -> &str;

    /// Arguments following the program name
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment variables for the child
    fn get_env_vars(&self) -> Vec<(String, String)>;

    /// Working directory for the child
    fn working_dir(&self) -> Option<&Path> {
        None
    }

    /// Human-readable command line for logs and error messages
    fn display(&self) -> String {
        std::iter::once(self.program().to_string())
            .chain(self.to_cli_args())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
