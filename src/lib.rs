//! stagehand library
//!
//! Staged infrastructure provisioning: numbered stage directories are walked
//! in order, each resource file is handed to the handler registered for its
//! suffix, and a shared databag carries values from one step to the next.

pub mod cli;
pub mod config;
pub mod databag;
pub mod databag_store;
pub mod error;
pub mod handlers;
pub mod metadata;
pub mod pipeline;
pub mod process_guard;
pub mod script_runner;
pub mod script_traits;
pub mod stage;
pub mod substitute;
pub mod types;

// Re-export main types for convenience
pub use config::{CommandHandlerConfig, ProjectConfig};
pub use databag::Databag;
pub use databag_store::{DatabagStore, EnvScope, IntermediateDatabag};
pub use error::{Result, StagehandError};
pub use handlers::{Handler, HandlerRegistry};
pub use metadata::{Metadata, RemoteSource};
pub use pipeline::{RunContext, RunOptions, RunReport, Runner, Stage};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use script_runner::{CommandOutput, run_command};
pub use script_traits::CommandArgs;
pub use stage::StageReport;
pub use substitute::ProcessedTree;
pub use types::{HandlerStatus, Verb};
