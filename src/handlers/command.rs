//! Configured handler that shells out to an external tool.
//!
//! Idempotency comes from the optional `check` command: its exit status says
//! whether the resource exists, which decides if `up`/`down` needs to run at
//! all. Without a check the tool itself is trusted to be idempotent.

use super::Handler;
use crate::config::CommandHandlerConfig;
use crate::databag::{Databag, MSG_UP_TO_DATE};
use crate::error::{Result, StagehandError};
use crate::script_runner::{CommandOutput, run_command};
use crate::script_traits::CommandArgs;
use crate::substitute::{ProcessedTree, substitute_file_to_file};
use crate::types::{HandlerStatus, Verb};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{(file|dir|verb)\}").expect("placeholder regex is valid"))
}

/// One expanded tool command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    argv: Vec<String>,
    env: Vec<(String, String)>,
}

impl ToolInvocation {
    /// Expand `{file}`, `{dir}` and `{verb}` in every argument of `template`
    pub fn new(
        template: &[String],
        file: &Path,
        dir: &Path,
        verb: Verb,
        databag: &Databag,
    ) -> Self {
        let file = file.display().to_string();
        let dir = dir.display().to_string();
        let argv = template
            .iter()
            .map(|arg| {
                placeholder_regex()
                    .replace_all(arg, |caps: &regex::Captures| match &caps[1] {
                        "file" => file.clone(),
                        "dir" => dir.clone(),
                        _ => verb.as_str().to_string(),
                    })
                    .into_owned()
            })
            .collect();
        Self {
            argv,
            env: databag.to_env_vars(),
        }
    }
}

impl CommandArgs for ToolInvocation {
    fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    fn to_cli_args(&self) -> Vec<String> {
        self.argv.iter().skip(1).cloned().collect()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.env.clone()
    }
}

/// Handler driven by a `handlers:` entry in `stagehand.yaml`
#[derive(Debug, Clone)]
pub struct CommandHandler {
    config: CommandHandlerConfig,
    processed: ProcessedTree,
}

impl CommandHandler {
    pub fn new(config: CommandHandlerConfig, processed: ProcessedTree) -> Self {
        Self { config, processed }
    }

    fn run(
        &self,
        template: &[String],
        target: &Path,
        source: &Path,
        verb: Verb,
        databag: &Databag,
    ) -> Result<CommandOutput> {
        let dir = source.parent().unwrap_or_else(|| Path::new("."));
        let invocation = ToolInvocation::new(template, target, dir, verb, databag);
        debug!("{}", invocation.display());
        run_command(&invocation)
    }

    fn run_up(&self, target: &Path, source: &Path, databag: &mut Databag) -> Result<()> {
        let output = self.run(&self.config.up, target, source, Verb::Up, databag)?;
        output.ensure_success(source)?;

        if self.config.capture_json {
            let count = capture_json(&output.stdout, databag)
                .map_err(|reason| StagehandError::handler(source, reason))?;
            debug!("captured {} value(s) from {}", count, source.display());
        }
        Ok(())
    }

    /// Returns `done` on success, `Unchanged` when there is nothing to run
    /// or a tolerated failure happened
    fn run_down(
        &self,
        target: &Path,
        source: &Path,
        databag: &Databag,
        done: HandlerStatus,
    ) -> Result<HandlerStatus> {
        let Some(down) = &self.config.down else {
            debug!("no down command for {}, leaving it", source.display());
            return Ok(HandlerStatus::Unchanged);
        };

        let result = self
            .run(down, target, source, Verb::Down, databag)
            .and_then(|output| output.ensure_success(source));
        match result {
            Ok(()) => Ok(done),
            Err(e) if self.config.ignore_down_errors => {
                warn!("ignoring teardown failure: {}", e);
                Ok(HandlerStatus::Unchanged)
            }
            Err(e) => Err(e),
        }
    }
}

impl Handler for CommandHandler {
    fn name(&self) -> &str {
        self.config.up.first().map_or("command", String::as_str)
    }

    fn handle(&self, file: &Path, verb: Verb, databag: &mut Databag) -> Result<HandlerStatus> {
        let target: PathBuf = if self.config.substitute {
            substitute_file_to_file(
                file,
                &self.processed,
                databag,
                verb,
                self.config.comment.as_deref(),
            )?
        } else {
            file.to_path_buf()
        };

        let Some(check) = &self.config.check else {
            return match verb {
                Verb::Up => {
                    self.run_up(&target, file, databag)?;
                    Ok(HandlerStatus::Applied)
                }
                Verb::Down => self.run_down(&target, file, databag, HandlerStatus::Applied),
            };
        };

        let exists = self.run(check, &target, file, verb, databag)?.success;
        match (verb, exists) {
            (Verb::Up, true) => {
                info!("{}", MSG_UP_TO_DATE);
                Ok(HandlerStatus::Exists)
            }
            (Verb::Up, false) => {
                self.run_up(&target, file, databag)?;
                Ok(HandlerStatus::Created)
            }
            (Verb::Down, true) => self.run_down(&target, file, databag, HandlerStatus::Deleted),
            (Verb::Down, false) => {
                info!("{} already gone", file.display());
                Ok(HandlerStatus::Unchanged)
            }
        }
    }
}

/// Merge a JSON object printed by a tool into the databag
fn capture_json(stdout: &str, databag: &mut Databag) -> std::result::Result<usize, String> {
    let json: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("expected a JSON object on stdout: {}", e))?;
    if !json.is_object() {
        return Err("expected a JSON object on stdout".to_string());
    }
    let value = serde_yaml::to_value(&json).map_err(|e| e.to_string())?;
    databag.merge_value(&value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Handler whose commands are bash snippets; the "resource" is a marker file
    fn handler(root: &Path, check: bool, down: &str, ignore_down_errors: bool) -> CommandHandler {
        let sh = |script: &str| {
            ["bash", "-c", script, "handler", "{file}"]
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        };
        let config = CommandHandlerConfig {
            suffix: ".res".to_string(),
            up: sh("cp \"$1\" \"$1.created\""),
            down: Some(sh(down)),
            check: check.then(|| sh("test -f \"$1.created\"")),
            substitute: false,
            comment: None,
            capture_json: false,
            ignore_down_errors,
        };
        CommandHandler::new(config, ProcessedTree::new(root, ".processed"))
    }

    fn resource(dir: &TempDir) -> PathBuf {
        let file = dir.path().join("thing.res");
        fs::write(&file, "name: thing\n").unwrap();
        file
    }

    #[test]
    fn test_expands_placeholders() {
        let template = vec![
            "tool".to_string(),
            "{verb}".to_string(),
            "--file={file}".to_string(),
            "{dir}".to_string(),
        ];
        let invocation = ToolInvocation::new(
            &template,
            Path::new("/p/.processed/s/a.res"),
            Path::new("/p/s"),
            Verb::Down,
            &Databag::new(),
        );
        assert_eq!(invocation.program(), "tool");
        assert_eq!(
            invocation.to_cli_args(),
            vec!["down", "--file=/p/.processed/s/a.res", "/p/s"]
        );
    }

    #[test]
    fn test_expanded_values_are_not_expanded_again() {
        let template = vec!["tool".to_string(), "{file}".to_string(), "{dir}".to_string()];
        let invocation = ToolInvocation::new(
            &template,
            Path::new("/p/{dir}/{verb}.res"),
            Path::new("/p/{file}"),
            Verb::Up,
            &Databag::new(),
        );
        assert_eq!(
            invocation.to_cli_args(),
            vec!["/p/{dir}/{verb}.res", "/p/{file}"]
        );
    }

    #[test]
    fn test_status_transitions_with_check() {
        let dir = tempfile::tempdir().unwrap();
        let file = resource(&dir);
        let marker = dir.path().join("thing.res.created");
        let handler = handler(dir.path(), true, "rm \"$1.created\"", true);
        let mut databag = Databag::new();

        assert_eq!(handler.handle(&file, Verb::Up, &mut databag).unwrap(), HandlerStatus::Created);
        assert!(marker.exists());
        assert_eq!(handler.handle(&file, Verb::Up, &mut databag).unwrap(), HandlerStatus::Exists);

        assert_eq!(handler.handle(&file, Verb::Down, &mut databag).unwrap(), HandlerStatus::Deleted);
        assert!(!marker.exists());
        assert_eq!(handler.handle(&file, Verb::Down, &mut databag).unwrap(), HandlerStatus::Unchanged);
    }

    #[test]
    fn test_without_check_always_applies() {
        let dir = tempfile::tempdir().unwrap();
        let file = resource(&dir);
        let handler = handler(dir.path(), false, "true", true);
        let mut databag = Databag::new();

        assert_eq!(handler.handle(&file, Verb::Up, &mut databag).unwrap(), HandlerStatus::Applied);
        assert_eq!(handler.handle(&file, Verb::Up, &mut databag).unwrap(), HandlerStatus::Applied);
        assert_eq!(handler.handle(&file, Verb::Down, &mut databag).unwrap(), HandlerStatus::Applied);
    }

    #[test]
    fn test_down_failure_tolerated_or_raised() {
        let dir = tempfile::tempdir().unwrap();
        let file = resource(&dir);
        let mut databag = Databag::new();

        let tolerant = handler(dir.path(), false, "exit 1", true);
        assert_eq!(tolerant.handle(&file, Verb::Down, &mut databag).unwrap(), HandlerStatus::Unchanged);

        let strict = handler(dir.path(), false, "exit 1", false);
        let err = strict.handle(&file, Verb::Down, &mut databag).unwrap_err();
        assert!(matches!(err, StagehandError::Handler { .. }));
    }

    #[test]
    fn test_up_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let file = resource(&dir);
        let mut handler = handler(dir.path(), false, "true", true);
        handler.config.up = vec!["false".to_string()];

        let err = handler.handle(&file, Verb::Up, &mut Databag::new()).unwrap_err();
        assert!(matches!(err, StagehandError::Handler { .. }));
    }

    #[test]
    fn test_capture_json_merges_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let file = resource(&dir);
        let mut handler = handler(dir.path(), false, "true", true);
        handler.config.up = vec![
            "echo".to_string(),
            r#"{"VpcId": "vpc-9", "subnets": ["a", "b"]}"#.to_string(),
        ];
        handler.config.capture_json = true;

        let mut databag = Databag::new();
        handler.handle(&file, Verb::Up, &mut databag).unwrap();
        assert_eq!(databag.get("vpc_id"), Some("vpc-9"));
        assert_eq!(databag.get("subnets_1"), Some("b"));
    }

    #[test]
    fn test_capture_json_rejects_non_object() {
        let mut databag = Databag::new();
        assert!(capture_json("[1, 2]", &mut databag).is_err());
        assert!(capture_json("not json", &mut databag).is_err());
        assert_eq!(capture_json("{\"a\": 1}", &mut databag), Ok(1));
    }

    #[test]
    fn test_substitutes_into_processed_tree() {
        let dir = tempfile::tempdir().unwrap();
        let stage = dir.path().join("0010");
        fs::create_dir_all(&stage).unwrap();
        let file = stage.join("cm.res");
        fs::write(&file, "# ${not_substituted}\nname: ${app}\n").unwrap();

        let config = CommandHandlerConfig {
            suffix: ".res".to_string(),
            up: vec!["cat".to_string(), "{file}".to_string()],
            down: None,
            check: None,
            substitute: true,
            comment: Some("#".to_string()),
            capture_json: false,
            ignore_down_errors: true,
        };
        let handler = CommandHandler::new(config, ProcessedTree::new(dir.path(), ".processed"));

        let mut databag = Databag::new();
        databag.insert("app", "web");
        assert_eq!(handler.handle(&file, Verb::Up, &mut databag).unwrap(), HandlerStatus::Applied);

        let processed = dir.path().join(".processed/0010/cm.res");
        assert_eq!(
            fs::read_to_string(processed).unwrap(),
            "# ${not_substituted}\nname: web\n"
        );
        assert_eq!(fs::read_to_string(&file).unwrap(), "# ${not_substituted}\nname: ${app}\n");

        assert_eq!(handler.handle(&file, Verb::Down, &mut databag).unwrap(), HandlerStatus::Unchanged);
    }
}
