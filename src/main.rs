//! credstamp - credential time stamp cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use credstamp::cli::{commands, Cli, Commands};
use credstamp::config::ConfigManager;
use credstamp::error::StampResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8, log_format: &str) {
    // 0 = warn, 1 = info, 2+ = debug
    let filter = match verbose {
        0 => EnvFilter::new("credstamp=warn"),
        1 => EnvFilter::new("credstamp=info"),
        _ => EnvFilter::new("credstamp=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr);

    if log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run() -> StampResult<ExitCode> {
    let cli = Cli::parse();

    // Completions don't need config loading
    if let Commands::Completions(args) = cli.command {
        commands::completions(args);
        return Ok(ExitCode::SUCCESS);
    }

    // Load configuration
    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_tracing(cli.verbose, &config.general.log_format);
    debug!("Using config {}", config_manager.path().display());

    // Dispatch to command
    let code = match cli.command {
        Commands::Completions(_) => unreachable!("Completions handled above"),
        Commands::Status(args) => return commands::status(args, &config).await,
        Commands::Refresh(args) => commands::refresh(args, &config).await,
        Commands::Invalidate(args) => commands::invalidate(args, &config).await,
        Commands::Reset(args) => commands::reset(args, &config).await,
        Commands::Lecture(args) => commands::lecture(args, &config).await,
        Commands::Config(args) => commands::config(args, &config, &config_manager).await,
    };
    code.map(|()| ExitCode::SUCCESS)
}
