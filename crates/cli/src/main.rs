mod cmd;
mod output;
mod setup;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use probeship_lib::platform::Platform;

use crate::output::OutputFormat;

/// probeship - build and release the netprobify container image
#[derive(Parser)]
#[command(name = "probeship")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to release.toml (default: $PROBESHIP_CONFIG, then ./release.toml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

/// Which event a run reacts to. Without flags the GitHub Actions environment is read.
#[derive(Args, Debug, Clone, Default)]
pub struct TriggerArgs {
  /// Act on a `released` event for this release name
  #[arg(long = "ref", value_name = "NAME", conflicts_with = "manual")]
  pub ref_name: Option<String>,

  /// Act on a manual dispatch
  #[arg(long)]
  pub manual: bool,

  /// Commit sha of the manual dispatch
  #[arg(long, requires = "manual")]
  pub sha: Option<String>,

  /// Ref name of the manual dispatch
  #[arg(long, requires = "manual")]
  pub branch: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the recipe as a Containerfile
  Render,

  /// Show the reference, platforms and instructions a release would use
  Plan {
    #[command(flatten)]
    trigger: TriggerArgs,
  },

  /// Build images locally without publishing
  Build {
    /// Platform to build (repeatable, default: every configured platform)
    #[arg(long = "platform", value_name = "OS/ARCH")]
    platforms: Vec<Platform>,
  },

  /// Build every platform and publish the multi-architecture image
  Release {
    #[command(flatten)]
    trigger: TriggerArgs,

    /// Publish to an in-memory registry instead of the configured one
    #[arg(long)]
    dry_run: bool,

    /// Write the run report as JSON to this path
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Cancel the run after this long (e.g. "45m")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
  },

  /// Inspect or clear the layer cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand)]
enum CacheAction {
  /// Show cache location and size
  Info,
  /// Remove every cached layer
  Clear,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let config = cli.config.as_deref();
  match cli.command {
    Commands::Render => cmd::cmd_render(config),
    Commands::Plan { trigger } => cmd::cmd_plan(config, &trigger, cli.output),
    Commands::Build { platforms } => cmd::cmd_build(config, &platforms, cli.output),
    Commands::Release {
      trigger,
      dry_run,
      report,
      timeout,
    } => cmd::cmd_release(
      config,
      &trigger,
      &cmd::ReleaseOptions {
        dry_run,
        report,
        timeout,
      },
      cli.output,
    ),
    Commands::Cache { action } => match action {
      CacheAction::Info => cmd::cmd_cache_info(config, cli.output),
      CacheAction::Clear => cmd::cmd_cache_clear(config, cli.output),
    },
  }
}
