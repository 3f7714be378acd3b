//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// credstamp - credential time stamp cache
///
/// Inspects, refreshes and invalidates the per-user records that let a
/// privilege elevation tool skip re-authentication for a short while.
#[derive(Parser, Debug)]
#[command(name = "credstamp")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CREDSTAMP_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check whether the caller's scope has a current time stamp
    Status(StatusArgs),

    /// Stamp the caller's scope after a successful authentication
    Refresh(TargetArgs),

    /// Disable the user's records for the configured scope
    Invalidate(TargetArgs),

    /// Remove the user's time stamp file entirely
    Reset(TargetArgs),

    /// Query or record that the first-use notice was shown
    Lecture(LectureArgs),

    /// Show configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// User whose time stamp to check (defaults to the invoking user)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Fail instead of waiting if another process holds the record
    #[arg(long)]
    pub no_wait: bool,

    /// Output format
    #[arg(short, long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments naming the target user
#[derive(Parser, Debug)]
pub struct TargetArgs {
    /// Target user (defaults to the invoking user)
    #[arg(short, long)]
    pub user: Option<String>,
}

/// Arguments for the lecture command
#[derive(Parser, Debug)]
pub struct LectureArgs {
    /// Target user (defaults to the invoking user)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Record that the notice was shown
    #[arg(long)]
    pub mark: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}

/// Arguments for the completions command
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Output format for the status command
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_status() {
        let cli = Cli::parse_from(["credstamp", "status"]);
        match cli.command {
            Commands::Status(args) => {
                assert!(args.user.is_none());
                assert!(!args.no_wait);
                assert_eq!(args.format, OutputFormat::Text);
            }
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn cli_parses_status_flags() {
        let cli = Cli::parse_from([
            "credstamp", "status", "--user", "alice", "--no-wait", "--format", "json",
        ]);
        match cli.command {
            Commands::Status(args) => {
                assert_eq!(args.user.as_deref(), Some("alice"));
                assert!(args.no_wait);
                assert_eq!(args.format, OutputFormat::Json);
            }
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn cli_parses_refresh() {
        let cli = Cli::parse_from(["credstamp", "refresh", "-u", "bob"]);
        match cli.command {
            Commands::Refresh(args) => assert_eq!(args.user.as_deref(), Some("bob")),
            _ => panic!("expected Refresh command"),
        }
    }

    #[test]
    fn cli_parses_invalidate_and_reset() {
        let cli = Cli::parse_from(["credstamp", "invalidate"]);
        assert!(matches!(cli.command, Commands::Invalidate(_)));
        let cli = Cli::parse_from(["credstamp", "reset"]);
        assert!(matches!(cli.command, Commands::Reset(_)));
    }

    #[test]
    fn cli_parses_lecture_mark() {
        let cli = Cli::parse_from(["credstamp", "lecture", "--mark"]);
        match cli.command {
            Commands::Lecture(args) => assert!(args.mark),
            _ => panic!("expected Lecture command"),
        }
    }

    #[test]
    fn cli_parses_completions() {
        let cli = Cli::parse_from(["credstamp", "completions", "bash"]);
        match cli.command {
            Commands::Completions(args) => assert_eq!(args.shell, Shell::Bash),
            _ => panic!("expected Completions command"),
        }
    }

    #[test]
    fn cli_config_flag() {
        let cli = Cli::parse_from(["credstamp", "-c", "/tmp/c.toml", "config", "path"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["credstamp", "invalidate"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["credstamp", "-v", "invalidate"]);
        assert_eq!(cli.verbose, 1);

        let cli = Cli::parse_from(["credstamp", "-vv", "invalidate"]);
        assert_eq!(cli.verbose, 2);
    }
}
