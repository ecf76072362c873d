//! Implementation of the `probeship release` command.
//!
//! Reads the trigger, authenticates to the registry, builds every configured
//! platform and publishes the multi-architecture index under the derived
//! tag. With `--dry-run` the images are published to an in-memory registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use probeship_lib::registry::{HttpRegistry, MemoryRegistry, Registry};
use probeship_lib::release::{Orchestrator, ReleaseSettings, RunReport, TargetStatus};
use probeship_lib::secret::Credentials;

use crate::TriggerArgs;
use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_layers, print_stat, print_success,
  print_warning, short_digest, symbols,
};
use crate::setup::{cancellation, load_config, runtime, shared_inputs};

#[derive(Debug, Default)]
pub struct ReleaseOptions {
  pub dry_run: bool,
  pub report: Option<PathBuf>,
  pub timeout: Option<Duration>,
}

pub fn cmd_release(
  config: Option<&Path>,
  trigger: &TriggerArgs,
  options: &ReleaseOptions,
  output: OutputFormat,
) -> Result<()> {
  let config = load_config(config)?;
  let event = trigger.event()?;

  let (registry, credentials): (Arc<dyn Registry>, Credentials) = if options.dry_run {
    print_warning("Dry run: publishing to an in-memory registry");
    let credentials = config
      .credentials()
      .unwrap_or_else(|_| Credentials::new("dry-run", "dry-run"));
    (Arc::new(MemoryRegistry::new(&config.registry.host)), credentials)
  } else {
    let credentials = config.credentials().context("Registry credentials are not available")?;
    let registry = HttpRegistry::new(&config.registry.host, config.registry.insecure)
      .context("Failed to create registry client")?;
    (Arc::new(registry), credentials)
  };
  // a dry run never writes to the shared cache
  let inputs = shared_inputs(&config, (!options.dry_run).then_some(&credentials))?;

  let orchestrator = Orchestrator::new(
    registry,
    inputs,
    ReleaseSettings {
      repository: config.registry.repository.clone(),
      platforms: config.build.platforms.clone(),
      manual_tag: config.release.manual_tag.clone(),
      execute: config.execute_config(),
    },
  );

  let rt = runtime()?;
  let mut report = rt.block_on(async {
    let cancel = cancellation(options.timeout);
    orchestrator.run(event, &credentials, &cancel).await
  });
  report.dry_run = options.dry_run;

  if let Some(path) = &options.report {
    report
      .write(path)
      .with_context(|| format!("Failed to write report: {}", path.display()))?;
  }

  if output.is_json() {
    print_json(&report)?;
  } else {
    print_report(&report);
  }

  if !report.is_published() {
    bail!(
      "Release failed: {}",
      report.error.as_deref().unwrap_or("unknown error")
    );
  }
  Ok(())
}

fn print_report(report: &RunReport) {
  println!();
  print_info(&format!("Trigger: {}", report.trigger));
  if let Some(reference) = &report.reference {
    print_stat("Reference", reference);
  }

  for target in &report.targets {
    match (target.status, &target.manifest_digest) {
      (TargetStatus::Built, Some(digest)) => {
        println!(
          "  {} {} {}",
          symbols::SUCCESS,
          target.platform,
          short_digest(digest.as_str())
        );
        print_layers(target.cache_hits, target.cache_misses);
      }
      _ => println!(
        "  {} {} {}",
        symbols::ERROR,
        target.platform,
        target.error.as_deref().unwrap_or("not built")
      ),
    }
  }

  let states: Vec<&str> = report.history.iter().map(|t| t.to.as_str()).collect();
  print_stat("States", &states.join(&format!(" {} ", symbols::ARROW)));
  print_stat("Duration", &format_duration(Duration::from_millis(report.duration_ms)));

  match (&report.index_digest, &report.error) {
    (Some(digest), _) if report.is_published() => {
      print_stat("Blobs pushed", &report.blobs_pushed.to_string());
      print_stat("Blobs already present", &report.blobs_skipped.to_string());
      print_success(&format!("Published {}", digest));
    }
    (_, Some(error)) => print_error(error),
    _ => print_error("Release did not complete"),
  }
}
