//! Built-in handler for `.sh` resource files.
//!
//! The script runs as `bash <file> <verb>` from its own directory with every
//! databag entry exported as an environment variable. It reports new values
//! by writing a JSON object to `$intermediate_databag_file`; the stage walker
//! drains that file once the script returns.

use super::Handler;
use crate::databag::Databag;
use crate::error::Result;
use crate::script_runner::run_command;
use crate::script_traits::CommandArgs;
use crate::types::{HandlerStatus, Verb};
use std::path::{Path, PathBuf};

/// Suffix the script handler is registered under
pub const SCRIPT_SUFFIX: &str = ".sh";

/// Arguments for one script run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptInvocation {
    script: PathBuf,
    dir: Option<PathBuf>,
    verb: Verb,
    env: Vec<(String, String)>,
}

impl ScriptInvocation {
    pub fn new(script: &Path, verb: Verb, databag: &Databag) -> Self {
        let dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        // Relative to `dir` once the child has changed into it
        let script = match (&dir, script.file_name()) {
            (Some(_), Some(name)) => PathBuf::from(name),
            _ => script.to_path_buf(),
        };
        Self {
            script,
            dir,
            verb,
            env: databag.to_env_vars(),
        }
    }
}

impl CommandArgs for ScriptInvocation {
    fn program(&self) -> &str {
        "bash"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            self.script.display().to_string(),
            self.verb.as_str().to_string(),
        ]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.env.clone()
    }

    fn working_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }
}

/// Runs shell scripts
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptHandler;

impl Handler for ScriptHandler {
    fn name(&self) -> &str {
        "script"
    }

    fn handle(&self, file: &Path, verb: Verb, databag: &mut Databag) -> Result<HandlerStatus> {
        let invocation = ScriptInvocation::new(file, verb, databag);
        let output = run_command(&invocation)?;
        output.ensure_success(file)?;
        Ok(HandlerStatus::Applied)
    }
}
