//! Implementation of the `probeship build` command.
//!
//! Builds images for the selected platforms against the local layer cache and
//! reports per-platform digests and cache usage. Nothing is published.

use std::path::Path;
use std::time::Instant;

use anyhow::{Result, bail};
use serde::Serialize;

use probeship_lib::execute::build_targets;
use probeship_lib::platform::Platform;
use probeship_lib::release::{TargetReport, TargetStatus};

use crate::output::{
  OutputFormat, format_bytes, format_duration, print_error, print_json, print_layers, print_stat, print_success,
  short_digest,
};
use crate::setup::{cancellation, load_config, runtime, shared_inputs};

#[derive(Serialize)]
struct BuildSummary {
  targets: Vec<TargetReport>,
  duration_ms: u64,
}

pub fn cmd_build(config: Option<&Path>, platforms: &[Platform], output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let config = load_config(config)?;
  let inputs = shared_inputs(&config, config.credentials().ok().as_ref())?;
  let mut targets: Vec<Platform> = Vec::new();
  let requested = if platforms.is_empty() {
    &config.build.platforms[..]
  } else {
    platforms
  };
  for platform in requested {
    if !targets.contains(platform) {
      targets.push(platform.clone());
    }
  }
  let execute = config.execute_config();

  let rt = runtime()?;
  let results = rt.block_on(async {
    let cancel = cancellation(None);
    build_targets(&targets, &inputs, &execute, &cancel).await
  });

  let mut reports = Vec::new();
  for platform in &targets {
    if let Some(image) = results.built.get(platform) {
      reports.push(TargetReport::built(image));
    } else if let Some((_, err)) = results.failed.iter().find(|(p, _)| p == platform) {
      reports.push(TargetReport::failed(platform, err));
    }
  }

  if output.is_json() {
    print_json(&BuildSummary {
      targets: reports,
      duration_ms: start.elapsed().as_millis() as u64,
    })?;
  } else {
    println!();
    for report in &reports {
      match (&report.status, &report.manifest_digest) {
        (TargetStatus::Built, Some(digest)) => {
          print_success(&format!("{} {}", report.platform, short_digest(digest.as_str())));
          print_layers(report.cache_hits, report.cache_misses);
          print_stat("Size", &format_bytes(report.layer_bytes));
        }
        _ => print_error(&format!(
          "{}: {}",
          report.platform,
          report.error.as_deref().unwrap_or("failed")
        )),
      }
    }
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if !results.is_success() {
    bail!("{} of {} targets failed", results.failed.len(), results.total());
  }
  Ok(())
}
