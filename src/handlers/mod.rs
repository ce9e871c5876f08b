//! Handler registry and dispatch.
//!
//! A handler owns one kind of resource file, selected by filename suffix.
//! Suffixes are tried in registration order and the first match wins, so a
//! specific suffix (`.kubectl.yaml`) must be registered before a general one
//! (`.yaml`).

pub mod command;
pub mod script;

use crate::config::ProjectConfig;
use crate::databag::Databag;
use crate::error::Result;
use crate::substitute::ProcessedTree;
use crate::types::{HandlerStatus, Verb};
use std::path::Path;
use tracing::{debug, info};

pub use command::CommandHandler;
pub use script::ScriptHandler;

/// Provisions or decommissions the resource described by one file.
///
/// Handlers read and extend the databag. A handler must be idempotent:
/// `up` on a resource that already exists returns [`HandlerStatus::Exists`]
/// and `down` on one that is gone returns [`HandlerStatus::Unchanged`].
pub trait Handler {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn handle(&self, file: &Path, verb: Verb, databag: &mut Databag) -> Result<HandlerStatus>;
}

/// Ordered suffix → handler table
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<(String, Box<dyn Handler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry for a project: configured command handlers in
    /// config order, then the built-in script handler.
    pub fn from_config(config: &ProjectConfig, processed: &ProcessedTree) -> Self {
        let mut registry = Self::new();
        for handler_config in &config.handlers {
            registry.register(
                handler_config.suffix.clone(),
                Box::new(CommandHandler::new(handler_config.clone(), processed.clone())),
            );
        }
        registry.register(script::SCRIPT_SUFFIX, Box::new(ScriptHandler));
        registry
    }

    /// Append a handler; earlier registrations take precedence
    pub fn register(&mut self, suffix: impl Into<String>, handler: Box<dyn Handler>) {
        let suffix = suffix.into();
        debug!("registered handler '{}' for *{}", handler.name(), suffix);
        self.entries.push((suffix, handler));
    }

    /// Find the handler for a file by its name's suffix
    pub fn resolve(&self, file: &Path) -> Option<&dyn Handler> {
        let name = file.file_name()?.to_string_lossy();
        self.entries
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix.as_str()))
            .map(|(_, handler)| handler.as_ref())
    }

    /// Registered suffixes in match order
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(suffix, _)| suffix.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the matching handler. `Ok(None)` means no handler matched.
    pub fn dispatch(
        &self,
        file: &Path,
        verb: Verb,
        databag: &mut Databag,
    ) -> Result<Option<HandlerStatus>> {
        let Some(handler) = self.resolve(file) else {
            debug!("no handler for {}, skipping", file.display());
            return Ok(None);
        };

        info!("[{}] {} {}", handler.name(), verb, file.display());
        let status = handler.handle(file, verb, databag)?;
        info!("[{}] {}: {}", handler.name(), file.display(), status);
        Ok(Some(status))
    }
}
