//! stagehand - main entry point

use anyhow::{Context, Result};
use stagehand::cli::{Cli, Commands};
use stagehand::config::ProjectConfig;
use stagehand::handlers::HandlerRegistry;
use stagehand::metadata::{self, HttpSource};
use stagehand::pipeline::{RunContext, Runner};
use stagehand::process_guard::{self, ProcessGuard};
use stagehand::substitute::ProcessedTree;
use stagehand::types::Verb;
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize tracing; `RUST_LOG` takes precedence over `--debug`
fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);

    // Handler subprocesses are killed if we receive SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("failed to initialize signal handlers: {}", e);
    }
    debug!("signal handlers initialized");

    let code = {
        let _guard = ProcessGuard::new();
        match run(&cli) {
            Ok(()) => 0,
            Err(e) => {
                error!("{:#}", e);
                1
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let options = cli.run_options();

    match &cli.command {
        Commands::Up { dir, start } => run_dir(cli, Verb::Up, dir, start.as_deref()),
        Commands::Down { dir, start } => run_dir(cli, Verb::Down, dir, start.as_deref()),
        Commands::Run { verb, file } => {
            let ctx = RunContext::for_project(&options, *verb)
                .context("failed to prepare run")?;
            let mut runner = Runner::new(ctx);
            runner
                .run_file(file)
                .with_context(|| format!("{} {} failed", verb, file.display()))?;
            Ok(())
        }
        Commands::Get { url, dir } => {
            info!("get {} => {}", url, dir.display());
            let fetched = metadata::fetch(dir, url, &HttpSource)
                .with_context(|| format!("failed to get {}", url))?;
            info!("downloaded {} file(s) into {}", fetched.files.len(), dir.display());
            Ok(())
        }
        Commands::Metadata { dir, include } => {
            let config = ProjectConfig::load(&options.root)?;
            let processed = ProcessedTree::new(options.root.clone(), &config.processed_dir);
            let registry = HandlerRegistry::from_config(&config, &processed);
            metadata::write_metadata(dir, &registry, &config.skip_dir, include)
                .with_context(|| format!("failed to write metadata for {}", dir.display()))?;
            Ok(())
        }
    }
}

fn run_dir(cli: &Cli, verb: Verb, dir: &Path, start: Option<&str>) -> Result<()> {
    let ctx = RunContext::for_project(&cli.run_options(), verb).context("failed to prepare run")?;
    let mut runner = Runner::new(ctx);
    runner
        .run_dir(dir, start)
        .with_context(|| format!("{} {} failed", verb, dir.display()))?;
    Ok(())
}
