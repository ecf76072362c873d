//! Implementation of the `probeship plan` command.
//!
//! Resolves the trigger to an image reference and lists what a release would
//! build, without authenticating or building.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use probeship_lib::registry::MemoryRegistry;
use probeship_lib::release::{Orchestrator, ReleaseSettings};

use crate::TriggerArgs;
use crate::output::{OutputFormat, print_info, print_json, print_stat, symbols};
use crate::setup::{load_config, shared_inputs};

pub fn cmd_plan(config: Option<&Path>, trigger: &TriggerArgs, output: OutputFormat) -> Result<()> {
  let config = load_config(config)?;
  let inputs = shared_inputs(&config, None)?;
  let event = trigger.event()?;
  let version = inputs.context.version().to_string();

  let orchestrator = Orchestrator::new(
    Arc::new(MemoryRegistry::new(&config.registry.host)),
    inputs,
    ReleaseSettings {
      repository: config.registry.repository.clone(),
      platforms: config.build.platforms.clone(),
      manual_tag: config.release.manual_tag.clone(),
      execute: config.execute_config(),
    },
  );
  let plan = orchestrator.plan(&event).context("Failed to plan release")?;

  if output.is_json() {
    print_json(&serde_json::json!({
      "trigger": event.to_string(),
      "reference": plan.reference.to_string(),
      "tag": plan.reference.tag,
      "version": version,
      "platforms": plan.platforms,
      "cache_mode": plan.cache_mode.as_str(),
      "instructions": plan.instructions,
    }))?;
    return Ok(());
  }

  print_info(&format!("Trigger: {}", event));
  print_stat("Reference", &plan.reference.to_string());
  print_stat("Version", &version);
  let platforms: Vec<String> = plan.platforms.iter().map(ToString::to_string).collect();
  print_stat("Platforms", &platforms.join(", "));
  print_stat("Cache mode", plan.cache_mode.as_str());
  println!();
  println!("Instructions:");
  for instruction in &plan.instructions {
    println!("  {} {}", symbols::ARROW, instruction);
  }

  Ok(())
}
