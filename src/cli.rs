use crate::pipeline::RunOptions;
use crate::types::Verb;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// stagehand - staged infrastructure provisioning
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(about = "Run numbered stage directories up or down, threading a databag between steps")]
#[command(version)]
pub struct Cli {
    /// Verbose logging; also exported to handlers as `debug=debug`
    #[arg(long, global = true)]
    pub debug: bool,

    /// Environment scope under `.env/`, e.g. `prod/eu-west-1`
    #[arg(long, global = true, value_name = "NAME")]
    pub env: Option<String>,

    /// Load only the selected scope instead of merging its ancestors
    #[arg(long, global = true)]
    pub no_merge: bool,

    /// Project root holding `.env/` and `stagehand.yaml`
    #[arg(long, global = true, value_name = "DIR", default_value = ".")]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision every stage of a directory in ascending order
    Up {
        /// Directory containing numbered stages
        dir: PathBuf,
        /// Stage to start from (full name or four-digit prefix)
        #[arg(long)]
        start: Option<String>,
    },
    /// Decommission every stage of a directory in descending order
    Down {
        /// Directory containing numbered stages
        dir: PathBuf,
        /// Stage to start from (full name or four-digit prefix)
        #[arg(long)]
        start: Option<String>,
    },
    /// Run a single resource file
    Run {
        /// up or down
        verb: Verb,
        file: PathBuf,
    },
    /// Download a published stage directory described by its metadata.yaml
    Get {
        url: String,
        dir: PathBuf,
    },
    /// Write metadata.yaml for a directory
    Metadata {
        dir: PathBuf,
        /// Extra files to track, comma separated
        #[arg(long, value_delimiter = ',')]
        include: Vec<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Run settings derived from the global flags
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            root: self.root.clone(),
            env: self.env.clone(),
            merge: self.no_merge.then_some(false),
            debug: self.debug,
        }
    }
}
